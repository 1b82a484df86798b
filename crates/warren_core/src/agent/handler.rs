//! The user-facing handler trait and the HTTP-shaped request/response
//! types delivered to it.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::agent::connection::Connection;
use crate::agent::instance::Agent;
use crate::error::{CoreError, Result};

/// An inbound request after routing, reduced to transport-independent
/// parts. `path` is the tail below `/<prefix>/<class>/<name>`.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl AgentRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into().to_uppercase(),
            path: path.into(),
            query: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_json(self, value: &impl Serialize) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_default();
        self.with_header("content-type", "application/json")
            .with_body(body)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// The response a handler returns for a routed request.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl AgentResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn json(status: u16, value: &impl Serialize) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_default();
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body,
        }
    }

    pub fn not_found() -> Self {
        Self::new(404)
    }

    /// Parse the body as JSON (test and client convenience).
    pub fn json_body(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// An inbound email routed to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: Option<String>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// Origin of a state mutation, as reported to `on_state_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSource {
    /// A connected peer replaced the state over the control protocol.
    Client,
    /// Server-side code called `set_state`.
    Server,
}

impl StateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateSource::Client => "client",
            StateSource::Server => "server",
        }
    }
}

/// Chunked body produced by the chat handler.
pub type ChatBodyStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Behavior shared by every instance of an agent class.
///
/// Implementations are stateless: durable state lives in the per-instance
/// store and is reached through the [`Agent`] handle. At most one handler
/// runs at a time within an instance.
#[async_trait]
pub trait AgentHandler: Send + Sync + 'static {
    /// Handle a routed HTTP request. The default serves the built-in
    /// endpoints: `POST /setState`, `GET /getState`, and JSON-RPC on
    /// `POST /`.
    async fn on_request(&self, agent: &Agent, req: AgentRequest) -> Result<AgentResponse> {
        agent.serve_default(req).await
    }

    /// A WebSocket attached to the instance.
    async fn on_connect(&self, _agent: &Agent, _conn: &Connection) -> Result<()> {
        Ok(())
    }

    /// A non-protocol text message arrived on a connection.
    async fn on_message(&self, _agent: &Agent, _conn: &Connection, _message: String) -> Result<()> {
        Ok(())
    }

    /// A connection closed.
    async fn on_close(
        &self,
        _agent: &Agent,
        _conn: &Connection,
        _code: u16,
        _reason: String,
    ) -> Result<()> {
        Ok(())
    }

    /// A handler raised. Returning `Ok` swallows the error; the default
    /// re-raises.
    async fn on_error(&self, error: CoreError) -> Result<()> {
        Err(error)
    }

    /// An email was routed to this instance.
    async fn on_email(&self, agent: &Agent, email: EmailMessage) -> Result<()> {
        warn!(
            agent = %agent.address(),
            from = %email.from,
            "email received but on_email is not implemented"
        );
        Ok(())
    }

    /// The persisted state changed. Runs after the mutation is visible to
    /// connected peers.
    async fn on_state_update(&self, _agent: &Agent, _state: &Value, _source: StateSource) {}

    /// An HTTP-shaped chat request arrived over the control protocol.
    /// The returned stream is forwarded to the peer as chunked
    /// `cf_agent_use_chat_response` frames; dropping it aborts the
    /// response.
    async fn on_chat_request(
        &self,
        _agent: &Agent,
        _id: &str,
        _init: Value,
    ) -> Result<ChatBodyStream> {
        Ok(Box::pin(futures::stream::empty()))
    }
}
