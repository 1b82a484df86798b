//! JSON-RPC transport to a remote MCP server.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::auth::McpAuthProvider;
use crate::error::{McpError, McpResult};

/// Abstract JSON-RPC transport. Injectable so connections can be tested
/// without a live server.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a request and wait for its result.
    async fn request(&self, method: &str, params: Value) -> McpResult<Value>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Value) -> McpResult<()>;
}

/// Per-connection transport configuration.
#[derive(Default, Clone)]
pub struct TransportOptions {
    /// Extra headers sent with every request.
    pub headers: Vec<(String, String)>,
    /// OAuth provider supplying bearer tokens and the authorization flow.
    pub auth_provider: Option<Arc<dyn McpAuthProvider>>,
}

impl std::fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportOptions")
            .field("headers", &self.headers)
            .field("has_auth_provider", &self.auth_provider.is_some())
            .finish()
    }
}

/// Factory producing a transport for a server URL.
pub type TransportFactory =
    Arc<dyn Fn(&str, &TransportOptions) -> Arc<dyn McpTransport> + Send + Sync>;

/// The default factory: JSON-RPC over streamable HTTP.
pub fn http_transport_factory() -> TransportFactory {
    Arc::new(|url, options| Arc::new(HttpTransport::new(url, options.clone())))
}

/// JSON-RPC over HTTP POST.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    options: TransportOptions,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, options: TransportOptions) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("warren-mcp/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
            options,
            next_id: AtomicU64::new(1),
        }
    }

    async fn post(&self, body: Value) -> McpResult<reqwest::Response> {
        let mut request = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .header("accept", "application/json, text/event-stream");

        for (name, value) in &self.options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(provider) = &self.options.auth_provider {
            if let Some(token) = provider.bearer_token().await {
                request = request.bearer_auth(token);
            }
        }

        let response = request.json(&body).send().await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(McpError::Unauthorized);
        }
        Ok(response)
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn request(&self, method: &str, params: Value) -> McpResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(url = %self.url, method, id, "mcp request");
        let response = self
            .post(json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }))
            .await?;

        let envelope: Value = response.json().await?;
        if let Some(error) = envelope.get("error") {
            return Err(McpError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(-32000),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown server error")
                    .to_string(),
            });
        }
        Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str, params: Value) -> McpResult<()> {
        self.post(json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))
        .await?;
        Ok(())
    }
}
