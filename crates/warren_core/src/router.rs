//! HTTP/WebSocket routing to agent instances.
//!
//! URL grammar: `/<prefix>/<class-kebab>/<instance-name>[/<tail>]`.
//! Only the grammar's paths are registered; anything else is never
//! handled here and falls through to the surrounding application's own
//! routes and fallback. Matched requests are forwarded to the instance,
//! and `Upgrade: websocket` requests are upgraded and attached as
//! connections.

use axum::body::Body;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::agent::connection::{Connection, SocketCommand};
use crate::agent::handler::{AgentRequest, AgentResponse};
use crate::config::RouterConfig;
use crate::error::CoreError;
use crate::protocol::{parse_frame, IncomingFrame};
use crate::runtime::Runtime;

const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// A parsed routing path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPath {
    /// Kebab-case class segment.
    pub class: String,
    /// Instance name segment.
    pub name: String,
    /// Remaining path delivered to the agent, always starting with `/`.
    pub tail: String,
}

/// Parse `/<prefix>/<class>/<name>[/<tail>]`. Returns `None` for paths
/// outside the grammar.
pub fn parse_agent_path(path: &str, prefix: &str) -> Option<AgentPath> {
    let rest = path.strip_prefix('/')?;
    let rest = rest.strip_prefix(prefix)?;
    let rest = rest.strip_prefix('/')?;

    let (class, rest) = rest.split_once('/')?;
    if class.is_empty() {
        return None;
    }

    let (name, tail) = match rest.split_once('/') {
        Some((name, tail)) => (name, format!("/{tail}")),
        None => (rest, "/".to_string()),
    };
    if name.is_empty() {
        return None;
    }

    Some(AgentPath {
        class: class.to_string(),
        name: name.to_string(),
        tail,
    })
}

#[derive(Clone)]
struct RouterState {
    runtime: Runtime,
    config: std::sync::Arc<RouterConfig>,
}

/// Build the axum router for the runtime.
///
/// Routes are registered under `/<prefix>/` only (the prefix must be a
/// single path segment); no fallback is installed, so callers can
/// `merge` this router with their own routes and fallback.
pub fn agent_router(runtime: Runtime, config: RouterConfig) -> axum::Router {
    let prefix = config.prefix.trim_matches('/').to_string();
    axum::Router::new()
        .route(
            &format!("/{prefix}/{{class}}/{{name}}"),
            axum::routing::any(handle),
        )
        .route(
            &format!("/{prefix}/{{class}}/{{name}}/{{*tail}}"),
            axum::routing::any(handle),
        )
        .with_state(RouterState {
            runtime,
            config: std::sync::Arc::new(config),
        })
}

fn wants_websocket(headers: &HeaderMap) -> bool {
    headers
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

async fn handle(State(state): State<RouterState>, req: axum::extract::Request) -> Response {
    // Registered routes always fit the grammar; a parse failure here
    // means the configured prefix is not a plain path segment.
    let path = req.uri().path().to_string();
    let Some(parsed) = parse_agent_path(&path, state.config.prefix.trim_matches('/')) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let cors_headers = state.config.cors.headers();

    if req.method() == Method::OPTIONS {
        if let Some(headers) = &cors_headers {
            let mut response = StatusCode::OK.into_response();
            apply_headers(&mut response, headers);
            return response;
        }
    }

    if wants_websocket(req.headers()) {
        let (mut parts, _body) = req.into_parts();
        let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(ws) => ws,
            Err(rejection) => return rejection.into_response(),
        };
        let runtime = state.runtime.clone();
        return ws
            .on_upgrade(move |socket| serve_socket(socket, runtime, parsed))
            .into_response();
    }

    let agent_req = into_agent_request(parsed.tail.clone(), req).await;
    let mut response = match state
        .runtime
        .deliver_request(&parsed.class, &parsed.name, agent_req)
        .await
    {
        Ok(resp) => into_http_response(resp),
        Err(CoreError::ClassNotFound { .. }) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    };

    if let Some(headers) = &cors_headers {
        apply_headers(&mut response, headers);
    }
    response
}

fn apply_headers(response: &mut Response, headers: &[(String, String)]) {
    for (name, value) in headers {
        let Ok(name) = name.parse::<HeaderName>() else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            continue;
        };
        response.headers_mut().insert(name, value);
    }
}

async fn into_agent_request(tail: String, req: axum::extract::Request) -> AgentRequest {
    let method = req.method().to_string();
    let query = req.uri().query().map(str::to_string);
    let headers = req
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect();
    let body = axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES)
        .await
        .map(|b| b.to_vec())
        .unwrap_or_default();

    AgentRequest {
        method,
        path: tail,
        query,
        headers,
        body,
    }
}

fn into_http_response(resp: AgentResponse) -> Response {
    let mut builder = axum::http::Response::builder().status(resp.status);
    for (name, value) in &resp.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(Body::from(resp.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Pump one upgraded socket: writer drains the connection's command
/// stream, reader forwards text frames through the instance mailbox.
async fn serve_socket(socket: WebSocket, runtime: Runtime, path: AgentPath) {
    let (conn, mut commands) = Connection::channel();
    let conn_id = conn.id().to_string();

    let handle = match runtime.resolve_handle(&path.class, &path.name).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!(class = %path.class, name = %path.name, error = %e, "websocket resolution failed");
            return;
        }
    };
    if let Err(e) = runtime.connect(&path.class, &path.name, conn.clone()).await {
        warn!(class = %path.class, name = %path.name, error = %e, "websocket attach failed");
        return;
    }
    debug!(class = %path.class, name = %path.name, connection = %conn_id, "websocket attached");

    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(cmd) = commands.recv().await {
            match cmd {
                SocketCommand::Text(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                SocketCommand::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let mut close_code: u16 = 1005;
    let mut close_reason = String::new();

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let text = text.to_string();
                // Cancel frames short-circuit past the mailbox so an
                // in-flight chat stream can be aborted while a handler
                // holds the instance.
                if let Some(IncomingFrame::ChatCancel { id }) = parse_frame(&text) {
                    if let Some((_, abort)) = handle.chat_aborts.remove(&id) {
                        abort.abort();
                    }
                    continue;
                }
                if runtime
                    .deliver_message(&path.class, &path.name, &conn_id, text)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(Message::Close(frame)) => {
                if let Some(frame) = frame {
                    close_code = frame.code;
                    close_reason = frame.reason.to_string();
                } else {
                    close_code = 1000;
                }
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(connection = %conn_id, error = %e, "websocket read error");
                break;
            }
        }
    }

    let _ = runtime
        .disconnect(&path.class, &path.name, &conn_id, close_code, close_reason)
        .await;
    writer.abort();
}
