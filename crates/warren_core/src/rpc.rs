//! RPC dispatch: callable lookup, streaming sinks, JSON-RPC over HTTP,
//! and the built-in agent endpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::agent::class::CallableKind;
use crate::agent::connection::Connection;
use crate::agent::handler::{AgentRequest, AgentResponse};
use crate::agent::instance::Agent;
use crate::error::{CoreError, Result};
use crate::protocol::OutgoingFrame;

enum StreamTarget {
    /// Chunks go out as `rpc` frames on the connection.
    Connection(Connection),
    /// Chunks are buffered; the `end` value resolves the call (HTTP path).
    Buffer,
}

struct StreamingInner {
    id: String,
    target: StreamTarget,
    ended: AtomicBool,
    chunks: Mutex<Vec<Value>>,
    final_value: Mutex<Option<Value>>,
}

/// One-way sink handed to streaming methods.
///
/// `send` emits a chunk (`done: false`); `end` emits the final value
/// (`done: true`) and closes the sink. Either call after `end` fails with
/// [`CoreError::StreamClosed`].
#[derive(Clone)]
pub struct StreamingResponse {
    inner: Arc<StreamingInner>,
}

impl StreamingResponse {
    pub(crate) fn for_connection(conn: Connection, id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(StreamingInner {
                id: id.into(),
                target: StreamTarget::Connection(conn),
                ended: AtomicBool::new(false),
                chunks: Mutex::new(Vec::new()),
                final_value: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn buffered(id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(StreamingInner {
                id: id.into(),
                target: StreamTarget::Buffer,
                ended: AtomicBool::new(false),
                chunks: Mutex::new(Vec::new()),
                final_value: Mutex::new(None),
            }),
        }
    }

    /// Emit one chunk.
    pub fn send(&self, chunk: Value) -> Result<()> {
        if self.inner.ended.load(Ordering::Acquire) {
            return Err(CoreError::StreamClosed);
        }
        match &self.inner.target {
            StreamTarget::Connection(conn) => {
                conn.send_frame(&OutgoingFrame::rpc_chunk(&self.inner.id, chunk, false));
            }
            StreamTarget::Buffer => {
                if let Ok(mut chunks) = self.inner.chunks.lock() {
                    chunks.push(chunk);
                }
            }
        }
        Ok(())
    }

    /// Emit the final value and close the sink.
    pub fn end(&self, final_value: Value) -> Result<()> {
        if self.inner.ended.swap(true, Ordering::AcqRel) {
            return Err(CoreError::StreamClosed);
        }
        match &self.inner.target {
            StreamTarget::Connection(conn) => {
                conn.send_frame(&OutgoingFrame::rpc_chunk(
                    &self.inner.id,
                    final_value,
                    true,
                ));
            }
            StreamTarget::Buffer => {
                if let Ok(mut slot) = self.inner.final_value.lock() {
                    *slot = Some(final_value);
                }
            }
        }
        Ok(())
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::Acquire)
    }

    /// The buffered final value (HTTP path).
    pub(crate) fn take_final(&self) -> Option<Value> {
        self.inner
            .final_value
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
    }
}

/// Dispatch an RPC arriving over a WebSocket connection.
///
/// All outcomes are reported as `rpc` frames correlated by `id`; method
/// failures roll back the handler transaction but never close the
/// connection.
pub(crate) async fn dispatch_ws_rpc(
    agent: &Agent,
    conn: &Connection,
    id: String,
    method: String,
    args: Vec<Value>,
) {
    let ctx = crate::context::InvocationContext::bare(agent.clone()).with_connection(conn.clone());

    let callable = match agent.class().callables.get(&method) {
        Some(kind) => kind.clone(),
        None => {
            conn.send_frame(&OutgoingFrame::rpc_error(&id, "method not found"));
            return;
        }
    };

    match callable {
        CallableKind::Unary(f) => {
            let call = f(agent.clone(), args);
            match agent.run_dispatch(ctx, call).await {
                Ok(result) => conn.send_frame(&OutgoingFrame::rpc_result(&id, result)),
                Err(e) => conn.send_frame(&OutgoingFrame::rpc_error(&id, e.to_string())),
            }
        }
        CallableKind::Streaming(f) => {
            let sink = StreamingResponse::for_connection(conn.clone(), id.clone());
            let call = f(agent.clone(), args, sink.clone());
            match agent.run_dispatch(ctx, call).await {
                Ok(result) => {
                    if !sink.is_ended() {
                        let _ = sink.end(result);
                    }
                }
                Err(e) => {
                    if sink.is_ended() {
                        warn!(method = %method, error = %e, "streaming method failed after end");
                    } else {
                        conn.send_frame(&OutgoingFrame::rpc_error(&id, e.to_string()));
                    }
                }
            }
        }
    }
}

/// Invoke a callable for the HTTP JSON-RPC path. Streaming methods buffer
/// their chunks and resolve to the `end` value.
///
/// Runs inside the caller's dispatch envelope (the `on_request`
/// transaction), so no transaction is opened here.
pub(crate) async fn dispatch_http_rpc(
    agent: &Agent,
    method: &str,
    args: Vec<Value>,
) -> Result<Value> {
    let callable = match agent.class().callables.get(method) {
        Some(kind) => kind.clone(),
        None => {
            return Err(CoreError::MethodNotFound {
                method: method.to_string(),
            })
        }
    };

    match callable {
        CallableKind::Unary(f) => f(agent.clone(), args).await,
        CallableKind::Streaming(f) => {
            let sink = StreamingResponse::buffered(method);
            let returned = f(agent.clone(), args, sink.clone()).await?;
            if sink.is_ended() {
                Ok(sink.take_final().unwrap_or(Value::Null))
            } else {
                Ok(returned)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    method: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    id: Value,
}

fn jsonrpc_error(id: Value, status: u16, code: i64, message: &str) -> AgentResponse {
    AgentResponse::json(
        status,
        &json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message },
        }),
    )
}

/// Handle a JSON-RPC 2.0 envelope posted to an agent.
pub(crate) async fn handle_jsonrpc(agent: &Agent, body: &[u8]) -> AgentResponse {
    let request: JsonRpcRequest = match serde_json::from_slice(body) {
        Ok(req) => req,
        Err(e) => return jsonrpc_error(Value::Null, 400, -32700, &format!("parse error: {e}")),
    };

    let args = match request.params {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    };

    match dispatch_http_rpc(agent, &request.method, args).await {
        Ok(result) => AgentResponse::json(
            200,
            &json!({ "jsonrpc": "2.0", "id": request.id, "result": result }),
        ),
        Err(CoreError::MethodNotFound { .. }) => {
            jsonrpc_error(request.id, 400, -32601, "method not found")
        }
        Err(e) => jsonrpc_error(request.id, 500, -32603, &e.to_string()),
    }
}

/// The built-in endpoints served when the user `on_request` delegates.
pub(crate) async fn serve_default(agent: &Agent, req: AgentRequest) -> Result<AgentResponse> {
    match (req.method.as_str(), req.path.as_str()) {
        ("POST", "/setState") => match req.json::<Value>() {
            Ok(state) => {
                agent.set_state(state).await?;
                Ok(AgentResponse::json(200, &json!({"success": true})))
            }
            Err(e) => Ok(AgentResponse::json(500, &json!({"error": e.to_string()}))),
        },
        ("GET", "/getState") => Ok(AgentResponse::json(200, &agent.state())),
        ("POST", "/") => {
            let is_json = req
                .header("content-type")
                .map(|ct| ct.contains("application/json"))
                .unwrap_or(false);
            if is_json {
                Ok(handle_jsonrpc(agent, &req.body).await)
            } else {
                Ok(AgentResponse::not_found())
            }
        }
        _ => Ok(AgentResponse::not_found()),
    }
}
