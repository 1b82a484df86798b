//! The runtime supervisor: class registry, lazy instance resolution,
//! hibernation wake timers, and the external delivery surface.
//!
//! Instances are spawned on first resolution of `(class, name)` and
//! removed again when they hibernate or are destroyed; callers never hold
//! an instance directly, they hold the runtime and an address.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::agent::class::AgentClass;
use crate::agent::connection::Connection;
use crate::agent::handler::{AgentRequest, AgentResponse, EmailMessage};
use crate::agent::instance::{spawn_instance, Agent, AgentOp, InstanceHandle};
use crate::config::RuntimeConfig;
use crate::context::InvocationContext;
use crate::error::{CoreError, Result};
use crate::name::{kebab_case, AgentAddress};

pub(crate) struct RuntimeInner {
    config: RuntimeConfig,
    classes: HashMap<String, Arc<AgentClass>>,
    instances: DashMap<String, InstanceHandle>,
    wake_timers: DashMap<String, JoinHandle<()>>,
    spawn_lock: Mutex<()>,
}

impl RuntimeInner {
    /// Resolve `(class, name)` to its live instance, spawning one if
    /// needed. Exactly one instance exists per address at a time.
    pub(crate) async fn resolve(
        self: &Arc<Self>,
        class_kebab: &str,
        name: &str,
    ) -> Result<InstanceHandle> {
        let class = self
            .classes
            .get(class_kebab)
            .cloned()
            .ok_or_else(|| CoreError::ClassNotFound {
                class: class_kebab.to_string(),
            })?;

        let address = AgentAddress {
            class: class_kebab.to_string(),
            name: name.to_string(),
        };
        let key = address.key();

        if let Some(handle) = self.instances.get(&key) {
            if !handle.tx.is_closed() {
                return Ok(handle.clone());
            }
        }

        let _guard = self.spawn_lock.lock().await;
        if let Some(handle) = self.instances.get(&key) {
            if !handle.tx.is_closed() {
                return Ok(handle.clone());
            }
        }

        if let Some((_, timer)) = self.wake_timers.remove(&key) {
            timer.abort();
        }

        let handle =
            spawn_instance(Arc::downgrade(self), class, address, &self.config).await?;
        self.instances.insert(key, handle.clone());
        Ok(handle)
    }

    /// Called by an instance as it hibernates. Arms a wake timer when
    /// pending schedule/queue rows exist so they still fire on time.
    pub(crate) fn on_hibernate(self: &Arc<Self>, address: &AgentAddress, next_fire: Option<i64>) {
        let key = address.key();
        self.instances.remove(&key);

        let Some(fire_at) = next_fire else {
            return;
        };
        let weak = Arc::downgrade(self);
        let class = address.class.clone();
        let name = address.name.clone();
        debug!(agent = %address, fire_at, "arming wake timer for hibernated instance");
        let timer = tokio::spawn(async move {
            let delay = (fire_at - Utc::now().timestamp()).max(0) as u64;
            tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
            if let Some(runtime) = weak.upgrade() {
                runtime.wake_timers.remove(&format!("{class}/{name}"));
                // Re-hydration replays the due fires.
                if let Err(e) = runtime.resolve(&class, &name).await {
                    warn!(class = %class, name = %name, error = %e, "wake-up resolution failed");
                }
            }
        });
        if let Some(previous) = self.wake_timers.insert(key, timer) {
            previous.abort();
        }
    }

    /// Called after `destroy`: drop the registry entry and wake timer.
    pub(crate) fn forget(&self, address: &AgentAddress) {
        let key = address.key();
        self.instances.remove(&key);
        if let Some((_, timer)) = self.wake_timers.remove(&key) {
            timer.abort();
        }
    }
}

/// The agent runtime. Cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Kebab-case route segments of the registered classes.
    pub fn class_names(&self) -> Vec<String> {
        self.inner.classes.keys().cloned().collect()
    }

    pub(crate) async fn resolve_handle(&self, class: &str, name: &str) -> Result<InstanceHandle> {
        self.inner.resolve(&kebab_case(class), name).await
    }

    /// Deliver a routed HTTP request to `(class, name)`.
    pub async fn deliver_request(
        &self,
        class: &str,
        name: &str,
        req: AgentRequest,
    ) -> Result<AgentResponse> {
        self.request_reply(class, name, |reply| AgentOp::Request {
            req: req.clone(),
            reply,
        })
        .await
    }

    /// Attach a connection to `(class, name)`. Returns once `on_connect`
    /// has run.
    pub async fn connect(&self, class: &str, name: &str, conn: Connection) -> Result<()> {
        self.request_reply(class, name, |reply| AgentOp::Connect {
            conn: conn.clone(),
            reply,
        })
        .await
    }

    /// Deliver an inbound WebSocket text message from `conn_id`.
    pub async fn deliver_message(
        &self,
        class: &str,
        name: &str,
        conn_id: &str,
        text: String,
    ) -> Result<()> {
        self.request_reply(class, name, |reply| AgentOp::Message {
            conn_id: conn_id.to_string(),
            text: text.clone(),
            reply,
        })
        .await
    }

    /// Notify the instance that a connection closed.
    pub async fn disconnect(
        &self,
        class: &str,
        name: &str,
        conn_id: &str,
        code: u16,
        reason: String,
    ) -> Result<()> {
        self.request_reply(class, name, |reply| AgentOp::Closed {
            conn_id: conn_id.to_string(),
            code,
            reason: reason.clone(),
            reply,
        })
        .await
    }

    /// Route an email to `(class, name)`.
    pub async fn deliver_email(&self, class: &str, name: &str, email: EmailMessage) -> Result<()> {
        self.request_reply(class, name, |reply| AgentOp::Email {
            email: email.clone(),
            reply,
        })
        .await
    }

    /// Destroy the instance: cancel schedules, drop queued work, close
    /// connections, delete all rows.
    pub async fn destroy(&self, class: &str, name: &str) -> Result<()> {
        self.request_reply(class, name, |reply| AgentOp::Destroy { reply })
            .await
    }

    /// Run a closure inside the instance's serialized context, with the
    /// full dispatch envelope (ambient context + handler transaction).
    ///
    /// Do not call this from inside a handler of the same agent: the
    /// closure queues behind the running handler and would deadlock.
    pub async fn with_agent<F, Fut, T>(&self, class: &str, name: &str, f: F) -> Result<T>
    where
        F: FnOnce(Agent) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.resolve_handle(class, name).await?;
        let (tx, rx) = oneshot::channel();
        let op = AgentOp::Invoke(Box::new(move |agent| {
            Box::pin(async move {
                let ctx = InvocationContext::bare(agent.clone());
                let outcome = agent.run_dispatch(ctx, f(agent.clone())).await;
                let _ = tx.send(outcome);
            })
        }));
        handle.tx.send(op).map_err(|_| CoreError::AgentGone)?;
        rx.await.map_err(|_| CoreError::AgentGone)?
    }

    /// Stop wake timers and drop all instance mailboxes; instance loops
    /// exit as their channels close.
    pub fn shutdown(&self) {
        for entry in self.inner.wake_timers.iter() {
            entry.value().abort();
        }
        self.inner.wake_timers.clear();
        self.inner.instances.clear();
    }

    /// Send an op, retrying when the target raced into hibernation.
    async fn request_reply<T>(
        &self,
        class: &str,
        name: &str,
        make_op: impl Fn(oneshot::Sender<Result<T>>) -> AgentOp,
    ) -> Result<T> {
        let class_kebab = kebab_case(class);
        for _ in 0..3 {
            let handle = self.inner.resolve(&class_kebab, name).await?;
            let (tx, rx) = oneshot::channel();
            if handle.tx.send(make_op(tx)).is_err() {
                continue;
            }
            match rx.await {
                Ok(result) => return result,
                Err(_) => continue,
            }
        }
        Err(CoreError::AgentGone)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("classes", &self.inner.classes.keys().collect::<Vec<_>>())
            .field("live_instances", &self.inner.instances.len())
            .finish()
    }
}

/// Builder for [`Runtime`].
#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    classes: Vec<AgentClass>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an agent class. Its kebab-case name becomes the routing
    /// segment.
    pub fn register(mut self, class: AgentClass) -> Self {
        self.classes.push(class);
        self
    }

    pub fn build(self) -> Result<Runtime> {
        let mut classes = HashMap::new();
        for class in self.classes {
            let kebab = class.kebab_name().to_string();
            if classes.insert(kebab.clone(), Arc::new(class)).is_some() {
                return Err(CoreError::DuplicateClass { class: kebab });
            }
        }
        Ok(Runtime {
            inner: Arc::new(RuntimeInner {
                config: self.config,
                classes,
                instances: DashMap::new(),
                wake_timers: DashMap::new(),
                spawn_lock: Mutex::new(()),
            }),
        })
    }
}
