//! The agent instance: a single-writer actor over a per-agent store.
//!
//! Each resolved `(class, name)` pair is backed by exactly one instance
//! task. All inbound work — HTTP requests, WebSocket traffic, scheduled
//! and queued callbacks, email — funnels through the instance mailbox and
//! executes one handler at a time. Handler writes commit together;
//! broadcasts triggered by state mutations are flushed at commit and
//! dropped on rollback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::{AbortHandle, Abortable, BoxFuture};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use warren_db::{
    AgentStore, ChatMessage, McpServerRecord, QueueItem, Schedule, ScheduleKind, ScheduleQuery,
};

use crate::agent::class::AgentClass;
use crate::agent::connection::{Connection, CLOSE_INTERNAL_ERROR};
use crate::agent::handler::{
    AgentRequest, AgentResponse, EmailMessage, StateSource,
};
use crate::config::RuntimeConfig;
use crate::context::{self, InvocationContext, RequestInfo};
use crate::error::{CoreError, Result};
use crate::name::AgentAddress;
use crate::protocol::{parse_frame, IncomingFrame, OutgoingFrame};
use crate::rpc;
use crate::runtime::RuntimeInner;
use crate::scheduler::{self, ScheduleWhen};

/// Erased closure run inside the instance's serialized context.
pub(crate) type InvokeFn = Box<dyn FnOnce(Agent) -> BoxFuture<'static, ()> + Send>;

/// Operations delivered through the instance mailbox.
pub(crate) enum AgentOp {
    Request {
        req: AgentRequest,
        reply: oneshot::Sender<Result<AgentResponse>>,
    },
    Connect {
        conn: Connection,
        reply: oneshot::Sender<Result<()>>,
    },
    Message {
        conn_id: String,
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Closed {
        conn_id: String,
        code: u16,
        reason: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Email {
        email: EmailMessage,
        reply: oneshot::Sender<Result<()>>,
    },
    Alarm,
    Invoke(InvokeFn),
    Destroy {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Handle stored in the runtime registry.
#[derive(Clone)]
pub(crate) struct InstanceHandle {
    pub tx: mpsc::UnboundedSender<AgentOp>,
    pub chat_aborts: Arc<DashMap<String, AbortHandle>>,
}

struct PendingStateBroadcast {
    state: Value,
    source: StateSource,
    exclude: Option<String>,
}

pub(crate) struct AgentInner {
    address: AgentAddress,
    class: Arc<AgentClass>,
    store: AgentStore,
    connections: DashMap<String, Connection>,
    state_cache: StdRwLock<Value>,
    pending_state: StdMutex<Vec<PendingStateBroadcast>>,
    in_dispatch: AtomicBool,
    alarm_task: StdMutex<Option<JoinHandle<()>>>,
    mailbox: mpsc::UnboundedSender<AgentOp>,
    chat_aborts: Arc<DashMap<String, AbortHandle>>,
    destroyed: AtomicBool,
    persistent: bool,
    retry_delay: Duration,
    runtime: Weak<RuntimeInner>,
}

/// Handle to a live agent instance, passed to every handler invocation.
///
/// Cloning is cheap; all clones refer to the same instance.
#[derive(Clone)]
pub struct Agent {
    pub(crate) inner: Arc<AgentInner>,
}

impl Agent {
    // -- Identity -----------------------------------------------------------

    pub fn address(&self) -> &AgentAddress {
        &self.inner.address
    }

    pub fn class_name(&self) -> &str {
        self.inner.class.name()
    }

    pub fn name(&self) -> &str {
        &self.inner.address.name
    }

    /// Deterministic identifier derived from `(class, name)`.
    pub fn ident(&self) -> String {
        self.inner.address.ident()
    }

    pub(crate) fn class(&self) -> &AgentClass {
        &self.inner.class
    }

    // -- State --------------------------------------------------------------

    /// The current state blob (hydrated; `null` until first write).
    pub fn state(&self) -> Value {
        self.inner
            .state_cache
            .read()
            .map(|s| s.clone())
            .unwrap_or(Value::Null)
    }

    /// Atomically replace the state and broadcast it to all open
    /// connections. Inside a handler the broadcast is deferred until the
    /// handler's transaction commits.
    pub async fn set_state(&self, state: Value) -> Result<()> {
        self.apply_state(state, StateSource::Server, None).await
    }

    pub(crate) async fn apply_state(
        &self,
        state: Value,
        source: StateSource,
        exclude: Option<String>,
    ) -> Result<()> {
        self.ensure_live()?;
        self.inner.store.put_state(&state).await?;
        if let Ok(mut cache) = self.inner.state_cache.write() {
            *cache = state.clone();
        }

        if self.inner.in_dispatch.load(Ordering::Acquire) {
            if let Ok(mut pending) = self.inner.pending_state.lock() {
                pending.push(PendingStateBroadcast {
                    state,
                    source,
                    exclude,
                });
            }
        } else {
            self.emit_state(state, source, exclude).await;
        }
        Ok(())
    }

    async fn emit_state(&self, state: Value, source: StateSource, exclude: Option<String>) {
        let frame = OutgoingFrame::State {
            state: state.clone(),
        };
        for entry in self.inner.connections.iter() {
            if exclude.as_deref() == Some(entry.key().as_str()) {
                continue;
            }
            entry.value().send_frame(&frame);
        }
        self.inner
            .class
            .handler
            .on_state_update(self, &state, source)
            .await;
    }

    async fn flush_pending_state(&self) {
        let pending: Vec<PendingStateBroadcast> = match self.inner.pending_state.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(_) => return,
        };
        for entry in pending {
            self.emit_state(entry.state, entry.source, entry.exclude).await;
        }
    }

    fn clear_pending_state(&self) {
        if let Ok(mut pending) = self.inner.pending_state.lock() {
            pending.clear();
        }
    }

    // -- Scheduling ----------------------------------------------------------

    /// Persist a callback to fire at `when`. The callback name must be
    /// registered on the class. Returns the stored row, whose `id` is
    /// stable across restarts.
    pub async fn schedule(
        &self,
        when: impl Into<ScheduleWhen>,
        callback: &str,
        payload: Value,
    ) -> Result<Schedule> {
        self.ensure_live()?;
        if !self.inner.class.has_callback(callback) {
            return Err(CoreError::CallbackNotFound {
                class: self.inner.class.name().to_string(),
                callback: callback.to_string(),
            });
        }

        let now = Utc::now().timestamp();
        let normalized = scheduler::normalize(when.into(), now)?;
        let schedule = Schedule {
            id: Uuid::new_v4().simple().to_string(),
            callback: callback.to_string(),
            payload,
            kind: normalized.kind,
            time: normalized.time,
            delay_seconds: normalized.delay_seconds,
            cron: normalized.cron,
            created_at: now,
        };
        self.inner.store.insert_schedule(&schedule).await?;
        debug!(
            agent = %self.inner.address,
            schedule = %schedule.id,
            kind = %schedule.kind,
            time = schedule.time,
            "schedule created"
        );
        self.arm_alarm().await;
        Ok(schedule)
    }

    /// List persisted schedules matching the query.
    pub async fn get_schedules(&self, query: ScheduleQuery) -> Result<Vec<Schedule>> {
        self.ensure_live()?;
        Ok(self.inner.store.list_schedules(&query).await?)
    }

    /// Cancel a schedule by id. Returns whether a row was removed.
    pub async fn cancel_schedule(&self, id: &str) -> Result<bool> {
        self.ensure_live()?;
        let removed = self.inner.store.delete_schedule(id).await?;
        if removed {
            self.arm_alarm().await;
        }
        Ok(removed)
    }

    // -- Queue ---------------------------------------------------------------

    /// Enqueue a durable work item; the named callback fires as soon as
    /// the instance is free, in insertion order.
    pub async fn queue(&self, callback: &str, payload: Value) -> Result<i64> {
        self.ensure_live()?;
        if !self.inner.class.has_callback(callback) {
            return Err(CoreError::CallbackNotFound {
                class: self.inner.class.name().to_string(),
                callback: callback.to_string(),
            });
        }
        let id = self.inner.store.push_queue(callback, &payload).await?;
        self.arm_alarm().await;
        Ok(id)
    }

    /// All waiting queue items in FIFO order (operator inspection surface).
    pub async fn queued_items(&self) -> Result<Vec<QueueItem>> {
        self.ensure_live()?;
        Ok(self.inner.store.queue_items().await?)
    }

    /// Remove a queue item without running it.
    pub async fn dequeue(&self, id: i64) -> Result<bool> {
        self.ensure_live()?;
        Ok(self.inner.store.remove_queue_item(id).await?)
    }

    // -- Connections ---------------------------------------------------------

    /// Snapshot of the live connections.
    pub fn connections(&self) -> Vec<Connection> {
        self.inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn connection(&self, id: &str) -> Option<Connection> {
        self.inner.connections.get(id).map(|entry| entry.value().clone())
    }

    /// Send a frame to every open connection.
    pub fn broadcast(&self, frame: &OutgoingFrame) {
        for entry in self.inner.connections.iter() {
            entry.value().send_frame(frame);
        }
    }

    fn broadcast_except(&self, exclude: &str, frame: &OutgoingFrame) {
        for entry in self.inner.connections.iter() {
            if entry.key() != exclude {
                entry.value().send_frame(frame);
            }
        }
    }

    // -- Chat log ------------------------------------------------------------

    /// The persisted chat message log.
    pub async fn chat_log(&self) -> Result<Vec<ChatMessage>> {
        self.ensure_live()?;
        Ok(self.inner.store.chat_messages().await?)
    }

    // -- MCP server bindings --------------------------------------------------

    /// Persist a reconnectable MCP server binding.
    pub async fn add_mcp_server(&self, record: &McpServerRecord) -> Result<()> {
        self.ensure_live()?;
        Ok(self.inner.store.upsert_mcp_server(record).await?)
    }

    pub async fn list_mcp_servers(&self) -> Result<Vec<McpServerRecord>> {
        self.ensure_live()?;
        Ok(self.inner.store.list_mcp_servers().await?)
    }

    pub async fn remove_mcp_server(&self, id: &str) -> Result<bool> {
        self.ensure_live()?;
        Ok(self.inner.store.delete_mcp_server(id).await?)
    }

    // -- Built-in HTTP endpoints ----------------------------------------------

    /// Serve `POST /setState`, `GET /getState` and JSON-RPC on `POST /`.
    /// The default `on_request` delegates here.
    pub async fn serve_default(&self, req: AgentRequest) -> Result<AgentResponse> {
        rpc::serve_default(self, req).await
    }

    // -- Lifecycle ------------------------------------------------------------

    /// Cancel all schedules, drop all queued work, close every connection
    /// and delete all persisted rows. The instance stops accepting work.
    pub async fn destroy(&self) -> Result<()> {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(agent = %self.inner.address, "destroying agent instance");

        if let Ok(mut guard) = self.inner.alarm_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }

        self.inner.store.wipe().await?;

        for entry in self.inner.connections.iter() {
            entry.value().close(1000, "agent destroyed");
        }
        self.inner.connections.clear();

        if let Ok(mut cache) = self.inner.state_cache.write() {
            *cache = Value::Null;
        }

        if let Some(runtime) = self.inner.runtime.upgrade() {
            runtime.forget(&self.inner.address);
        }
        Ok(())
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(CoreError::Destroyed);
        }
        Ok(())
    }

    // -- Dispatch envelope -----------------------------------------------------

    /// Run a handler future inside the ambient context and the handler
    /// transaction. Commit flushes deferred state broadcasts; rollback
    /// drops them.
    pub(crate) async fn run_dispatch<T>(
        &self,
        ctx: InvocationContext,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        self.inner.store.begin().await?;
        self.inner.in_dispatch.store(true, Ordering::Release);

        let result = context::with_context(ctx, fut).await;

        self.inner.in_dispatch.store(false, Ordering::Release);
        match result {
            Ok(value) => match self.inner.store.commit().await {
                Ok(()) => {
                    self.flush_pending_state().await;
                    Ok(value)
                }
                Err(commit_err) => {
                    error!(
                        agent = %self.inner.address,
                        error = %commit_err,
                        "commit failed after handler success"
                    );
                    self.abandon_dispatch().await;
                    Err(commit_err.into())
                }
            },
            Err(e) => {
                self.abandon_dispatch().await;
                Err(e)
            }
        }
    }

    /// Discard everything a failed dispatch left behind: a still-open
    /// transaction, deferred broadcasts that must never reach a peer, and
    /// cache writes that never became durable.
    async fn abandon_dispatch(&self) {
        if self.inner.store.in_transaction().await {
            if let Err(e) = self.inner.store.rollback().await {
                error!(
                    agent = %self.inner.address,
                    error = %e,
                    "rollback failed while abandoning dispatch"
                );
            }
        }
        self.clear_pending_state();
        if let Ok(stored) = self.inner.store.get_state().await {
            if let Ok(mut cache) = self.inner.state_cache.write() {
                *cache = stored.unwrap_or(Value::Null);
            }
        }
    }

    /// Feed an error through `on_error`. Returns the error if it re-raised.
    async fn surface_error(&self, error: CoreError) -> Option<CoreError> {
        match self.inner.class.handler.on_error(error).await {
            Ok(()) => None,
            Err(e) => {
                error!(agent = %self.inner.address, error = %e, "handler error");
                Some(e)
            }
        }
    }

    /// Like [`surface_error`], but a re-raised error also closes the
    /// offending WebSocket with code 1011.
    async fn surface_ws_error(&self, error: CoreError, conn: &Connection) {
        if let Some(e) = self.surface_error(error).await {
            conn.close(CLOSE_INTERNAL_ERROR, &e.to_string());
            self.inner.connections.remove(conn.id());
        }
    }

    // -- Alarm -----------------------------------------------------------------

    pub(crate) async fn arm_alarm(&self) {
        self.arm_alarm_with_retry(false).await;
    }

    async fn arm_alarm_with_retry(&self, had_failure: bool) {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return;
        }
        let now = Utc::now().timestamp();
        let mut next = match self.inner.store.next_fire_time(now).await {
            Ok(next) => next,
            Err(e) => {
                error!(agent = %self.inner.address, error = %e, "failed to compute next alarm");
                Some(now + self.inner.retry_delay.as_secs() as i64)
            }
        };
        if had_failure {
            let retry_at = now + self.inner.retry_delay.as_secs() as i64;
            next = Some(next.map_or(retry_at, |t| t.max(retry_at)));
        }

        let mut guard = match self.inner.alarm_task.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if let Some(task) = guard.take() {
            task.abort();
        }
        if let Some(fire_at) = next {
            let delay = Duration::from_secs((fire_at - now).max(0) as u64);
            let tx = self.inner.mailbox.clone();
            *guard = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(AgentOp::Alarm);
            }));
        }
    }

    /// Fire all due schedules in `(time, id)` order, then queue items in
    /// `(created_at, id)` order. Failed rows are retained and re-fired
    /// after the retry delay (at-least-once).
    pub(crate) async fn process_alarm(&self) {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return;
        }
        let now = Utc::now().timestamp();
        let mut had_failure = false;

        match self.inner.store.due_schedules(now).await {
            Ok(due) => {
                for schedule in due {
                    had_failure |= !self.fire_schedule(&schedule, now).await;
                }
            }
            Err(e) => {
                error!(agent = %self.inner.address, error = %e, "failed to load due schedules");
                had_failure = true;
            }
        }

        match self.inner.store.queue_items().await {
            Ok(items) => {
                for item in items {
                    if !self.fire_queue_item(&item).await {
                        // Retain the item and stop: processing later items
                        // first would break FIFO.
                        had_failure = true;
                        break;
                    }
                }
            }
            Err(e) => {
                error!(agent = %self.inner.address, error = %e, "failed to load queue items");
                had_failure = true;
            }
        }

        self.arm_alarm_with_retry(had_failure).await;
    }

    /// Returns `false` when the row was retained for retry.
    async fn fire_schedule(&self, schedule: &Schedule, now: i64) -> bool {
        let callback = match self.inner.class.callbacks.get(&schedule.callback) {
            Some(cb) => cb.clone(),
            None => {
                warn!(
                    agent = %self.inner.address,
                    schedule = %schedule.id,
                    callback = %schedule.callback,
                    "schedule callback not registered; dropping"
                );
                self.drop_or_advance(schedule, now).await;
                return true;
            }
        };

        let ctx = InvocationContext::bare(self.clone());
        let call = callback(self.clone(), schedule.payload.clone());
        match self.run_dispatch(ctx, call).await {
            Ok(_) => {
                self.drop_or_advance(schedule, now).await;
                true
            }
            Err(e) => {
                warn!(
                    agent = %self.inner.address,
                    schedule = %schedule.id,
                    error = %e,
                    "schedule callback failed; row retained"
                );
                self.surface_error(e).await;
                false
            }
        }
    }

    async fn drop_or_advance(&self, schedule: &Schedule, now: i64) {
        let result = if schedule.kind == ScheduleKind::Cron {
            match schedule
                .cron
                .as_deref()
                .ok_or_else(|| CoreError::InvalidCron {
                    expr: String::new(),
                    reason: "cron row without expression".to_string(),
                })
                .and_then(|expr| scheduler::advance_cron(expr, now))
            {
                Ok(next) => self.inner.store.reschedule(&schedule.id, next).await,
                Err(e) => {
                    warn!(
                        agent = %self.inner.address,
                        schedule = %schedule.id,
                        error = %e,
                        "cron row no longer parses; deleting"
                    );
                    self.inner.store.delete_schedule(&schedule.id).await.map(|_| ())
                }
            }
        } else {
            self.inner.store.delete_schedule(&schedule.id).await.map(|_| ())
        };
        if let Err(e) = result {
            error!(agent = %self.inner.address, error = %e, "failed to settle schedule row");
        }
    }

    /// Returns `false` when the item was retained for retry.
    async fn fire_queue_item(&self, item: &QueueItem) -> bool {
        let callback = match self.inner.class.callbacks.get(&item.callback) {
            Some(cb) => cb.clone(),
            None => {
                warn!(
                    agent = %self.inner.address,
                    item = item.id,
                    callback = %item.callback,
                    "queue callback not registered; dropping item"
                );
                if let Err(e) = self.inner.store.remove_queue_item(item.id).await {
                    error!(agent = %self.inner.address, error = %e, "failed to drop queue item");
                }
                return true;
            }
        };

        let ctx = InvocationContext::bare(self.clone());
        let call = callback(self.clone(), item.payload.clone());
        match self.run_dispatch(ctx, call).await {
            Ok(_) => {
                if let Err(e) = self.inner.store.remove_queue_item(item.id).await {
                    error!(agent = %self.inner.address, error = %e, "failed to remove queue item");
                }
                true
            }
            Err(e) => {
                warn!(
                    agent = %self.inner.address,
                    item = item.id,
                    error = %e,
                    "queue callback failed; item retained"
                );
                self.surface_error(e).await;
                false
            }
        }
    }

    // -- Op handling ------------------------------------------------------------

    pub(crate) async fn handle_op(&self, op: AgentOp) {
        match op {
            AgentOp::Request { req, reply } => {
                let outcome = self.handle_request(req).await;
                let _ = reply.send(outcome);
            }
            AgentOp::Connect { conn, reply } => {
                let outcome = self.handle_connect(conn).await;
                let _ = reply.send(outcome);
            }
            AgentOp::Message {
                conn_id,
                text,
                reply,
            } => {
                let outcome = self.handle_message(&conn_id, text).await;
                let _ = reply.send(outcome);
            }
            AgentOp::Closed {
                conn_id,
                code,
                reason,
                reply,
            } => {
                let outcome = self.handle_closed(&conn_id, code, reason).await;
                let _ = reply.send(outcome);
            }
            AgentOp::Email { email, reply } => {
                let outcome = self.handle_email(email).await;
                let _ = reply.send(outcome);
            }
            AgentOp::Alarm => self.process_alarm().await,
            AgentOp::Invoke(f) => f(self.clone()).await,
            AgentOp::Destroy { reply } => {
                let _ = reply.send(self.destroy().await);
            }
        }
    }

    async fn handle_request(&self, req: AgentRequest) -> Result<AgentResponse> {
        let ctx = InvocationContext::bare(self.clone()).with_request(RequestInfo {
            method: req.method.clone(),
            path: req.path.clone(),
        });
        let handler = Arc::clone(&self.inner.class.handler);
        let agent = self.clone();
        let result = self
            .run_dispatch(ctx, async move { handler.on_request(&agent, req).await })
            .await;

        match result {
            Ok(response) => Ok(response),
            Err(e) => match self.surface_error(e).await {
                None => Ok(AgentResponse::json(
                    500,
                    &serde_json::json!({"error": "internal error"}),
                )),
                Some(e) => Err(e),
            },
        }
    }

    async fn handle_connect(&self, conn: Connection) -> Result<()> {
        conn.mark_open();
        self.inner
            .connections
            .insert(conn.id().to_string(), conn.clone());

        let ctx = InvocationContext::bare(self.clone()).with_connection(conn.clone());
        let handler = Arc::clone(&self.inner.class.handler);
        let agent = self.clone();
        let conn_for_handler = conn.clone();
        let result = self
            .run_dispatch(ctx, async move {
                handler.on_connect(&agent, &conn_for_handler).await
            })
            .await;

        if let Err(e) = result {
            self.surface_ws_error(e, &conn).await;
        }
        Ok(())
    }

    async fn handle_message(&self, conn_id: &str, text: String) -> Result<()> {
        let conn = match self.inner.connections.get(conn_id) {
            Some(entry) => entry.value().clone(),
            None => {
                return Err(CoreError::UnknownConnection {
                    id: conn_id.to_string(),
                })
            }
        };

        match parse_frame(&text) {
            Some(frame) => self.handle_frame(&conn, frame).await,
            None => {
                // Not protocol traffic: hand the raw text to the user.
                let ctx =
                    InvocationContext::bare(self.clone()).with_connection(conn.clone());
                let handler = Arc::clone(&self.inner.class.handler);
                let agent = self.clone();
                let conn_for_handler = conn.clone();
                let result = self
                    .run_dispatch(ctx, async move {
                        handler.on_message(&agent, &conn_for_handler, text).await
                    })
                    .await;
                if let Err(e) = result {
                    self.surface_ws_error(e, &conn).await;
                }
                Ok(())
            }
        }
    }

    async fn handle_frame(&self, conn: &Connection, frame: IncomingFrame) -> Result<()> {
        match frame {
            IncomingFrame::State { state } => {
                let ctx =
                    InvocationContext::bare(self.clone()).with_connection(conn.clone());
                let agent = self.clone();
                let exclude = conn.id().to_string();
                let result = self
                    .run_dispatch(ctx, async move {
                        agent
                            .apply_state(state, StateSource::Client, Some(exclude))
                            .await
                    })
                    .await;
                if let Err(e) = result {
                    self.surface_ws_error(e, conn).await;
                }
            }
            IncomingFrame::Rpc { id, method, args } => {
                rpc::dispatch_ws_rpc(self, conn, id, method, args).await;
            }
            IncomingFrame::ChatRequest { id, init } => {
                self.handle_chat_request(conn, id, init).await;
            }
            IncomingFrame::ChatCancel { id } => {
                if let Some((_, handle)) = self.inner.chat_aborts.remove(&id) {
                    debug!(agent = %self.inner.address, request = %id, "chat request aborted");
                    handle.abort();
                }
            }
            IncomingFrame::ChatMessages { messages } => {
                let ctx =
                    InvocationContext::bare(self.clone()).with_connection(conn.clone());
                let agent = self.clone();
                let rows: Vec<ChatMessage> =
                    messages.iter().map(chat_message_from_value).collect();
                let result = self
                    .run_dispatch(ctx, async move {
                        agent.inner.store.replace_chat_messages(&rows).await?;
                        Ok(())
                    })
                    .await;
                match result {
                    Ok(()) => self
                        .broadcast_except(conn.id(), &OutgoingFrame::ChatMessages { messages }),
                    Err(e) => self.surface_ws_error(e, conn).await,
                }
            }
            IncomingFrame::ChatClear => {
                let ctx =
                    InvocationContext::bare(self.clone()).with_connection(conn.clone());
                let agent = self.clone();
                let result = self
                    .run_dispatch(ctx, async move {
                        agent.inner.store.clear_chat_messages().await?;
                        Ok(())
                    })
                    .await;
                match result {
                    Ok(()) => self.broadcast_except(conn.id(), &OutgoingFrame::ChatClear),
                    Err(e) => self.surface_ws_error(e, conn).await,
                }
            }
        }
        Ok(())
    }

    async fn handle_chat_request(&self, conn: &Connection, id: String, init: Value) {
        let ctx = InvocationContext::bare(self.clone()).with_connection(conn.clone());
        let handler = Arc::clone(&self.inner.class.handler);
        let agent = self.clone();
        let request_id = id.clone();
        let result = self
            .run_dispatch(ctx, async move {
                handler.on_chat_request(&agent, &request_id, init).await
            })
            .await;

        match result {
            Ok(stream) => {
                let (abort_handle, abort_reg) = AbortHandle::new_pair();
                self.inner.chat_aborts.insert(id.clone(), abort_handle);
                let conn = conn.clone();
                let aborts = Arc::clone(&self.inner.chat_aborts);
                // Body forwarding runs concurrently so the instance can
                // keep serving ops (and observe a cancel) mid-stream.
                tokio::spawn(async move {
                    let mut stream = stream;
                    let forward = async {
                        while let Some(chunk) = stream.next().await {
                            conn.send_frame(&OutgoingFrame::ChatResponse {
                                id: id.clone(),
                                body: chunk,
                                done: false,
                            });
                        }
                    };
                    let _ = Abortable::new(forward, abort_reg).await;
                    conn.send_frame(&OutgoingFrame::ChatResponse {
                        id: id.clone(),
                        body: String::new(),
                        done: true,
                    });
                    aborts.remove(&id);
                });
            }
            Err(e) => self.surface_ws_error(e, conn).await,
        }
    }

    async fn handle_closed(&self, conn_id: &str, code: u16, reason: String) -> Result<()> {
        let conn = match self.inner.connections.remove(conn_id) {
            Some((_, conn)) => conn,
            None => return Ok(()),
        };
        conn.mark_closed();

        let ctx = InvocationContext::bare(self.clone()).with_connection(conn.clone());
        let handler = Arc::clone(&self.inner.class.handler);
        let agent = self.clone();
        let conn_for_handler = conn.clone();
        let result = self
            .run_dispatch(ctx, async move {
                handler
                    .on_close(&agent, &conn_for_handler, code, reason)
                    .await
            })
            .await;
        if let Err(e) = result {
            self.surface_error(e).await;
        }
        Ok(())
    }

    async fn handle_email(&self, email: EmailMessage) -> Result<()> {
        let ctx = InvocationContext::bare(self.clone()).with_email(email.clone());
        let handler = Arc::clone(&self.inner.class.handler);
        let agent = self.clone();
        let result = self
            .run_dispatch(ctx, async move { handler.on_email(&agent, email).await })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => match self.surface_error(e).await {
                None => Ok(()),
                Some(e) => Err(e),
            },
        }
    }

    async fn hibernate(&self) {
        if let Ok(mut guard) = self.inner.alarm_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
        let now = Utc::now().timestamp();
        let next_fire = self.inner.store.next_fire_time(now).await.ok().flatten();
        debug!(
            agent = %self.inner.address,
            next_fire = ?next_fire,
            "hibernating idle instance"
        );
        if let Some(runtime) = self.inner.runtime.upgrade() {
            runtime.on_hibernate(&self.inner.address, next_fire);
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("address", &self.inner.address)
            .field("connections", &self.inner.connections.len())
            .finish()
    }
}

fn chat_message_from_value(value: &Value) -> ChatMessage {
    let id = value
        .get("id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    ChatMessage {
        id,
        message: value.clone(),
        created_at: Utc::now().timestamp_millis(),
    }
}

/// Open the store, hydrate, replay missed fires, and start the mailbox
/// loop for one instance.
pub(crate) async fn spawn_instance(
    runtime: Weak<RuntimeInner>,
    class: Arc<AgentClass>,
    address: AgentAddress,
    config: &RuntimeConfig,
) -> Result<InstanceHandle> {
    let store = if config.ephemeral {
        AgentStore::open_in_memory().await?
    } else {
        AgentStore::open(address.db_path(&config.data_dir)).await?
    };
    let state = store.get_state().await?.unwrap_or(Value::Null);

    let (tx, rx) = mpsc::unbounded_channel();
    let chat_aborts: Arc<DashMap<String, AbortHandle>> = Arc::new(DashMap::new());

    let agent = Agent {
        inner: Arc::new(AgentInner {
            address: address.clone(),
            class,
            store,
            connections: DashMap::new(),
            state_cache: StdRwLock::new(state),
            pending_state: StdMutex::new(Vec::new()),
            in_dispatch: AtomicBool::new(false),
            alarm_task: StdMutex::new(None),
            mailbox: tx.clone(),
            chat_aborts: Arc::clone(&chat_aborts),
            destroyed: AtomicBool::new(false),
            persistent: !config.ephemeral,
            retry_delay: config.alarm_retry_delay(),
            runtime,
        }),
    };

    info!(agent = %address, "agent instance hydrated");

    // Missed fires replay before any inbound op is served.
    let now = Utc::now().timestamp();
    match agent.inner.store.next_fire_time(now).await? {
        Some(t) if t <= now => agent.process_alarm().await,
        _ => agent.arm_alarm().await,
    }

    let idle_timeout = config.idle_timeout();
    tokio::spawn(run_loop(agent, rx, idle_timeout));

    Ok(InstanceHandle { tx, chat_aborts })
}

async fn run_loop(
    agent: Agent,
    mut rx: mpsc::UnboundedReceiver<AgentOp>,
    idle_timeout: Duration,
) {
    loop {
        let can_hibernate =
            agent.inner.persistent && agent.inner.connections.is_empty();
        let op = if can_hibernate {
            match tokio::time::timeout(idle_timeout, rx.recv()).await {
                Ok(Some(op)) => op,
                Ok(None) => break,
                Err(_) => {
                    agent.hibernate().await;
                    break;
                }
            }
        } else {
            match rx.recv().await {
                Some(op) => op,
                None => break,
            }
        };

        agent.handle_op(op).await;

        if agent.inner.destroyed.load(Ordering::Acquire) {
            break;
        }
    }
    debug!(agent = %agent.inner.address, "instance loop exited");
}
