//! The MCP client manager: a pool of server connections with OAuth
//! callback demultiplexing and namespaced discovery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionState, InitOutcome, McpConnection};
use crate::error::{McpError, McpResult};
use crate::transport::{http_transport_factory, TransportFactory, TransportOptions};
use crate::types::{Namespaced, Prompt, Resource, ResourceTemplate, Tool};

/// Options for re-establishing a known server binding.
#[derive(Debug, Clone, Default)]
pub struct ReconnectOptions {
    /// Reuse this server id instead of allocating a fresh one.
    pub id: String,
    /// OAuth client id to plant into the auth provider.
    pub oauth_client_id: Option<String>,
    /// Authorization code to exchange during init.
    pub oauth_code: Option<String>,
}

/// Options for [`McpClientManager::connect`].
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub transport: TransportOptions,
    pub reconnect: Option<ReconnectOptions>,
}

/// Outcome of a connect call.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectResult {
    pub id: String,
    /// Present when the server requires the user to authorize first.
    pub auth_url: Option<String>,
    pub client_id: Option<String>,
}

/// Outcome of a completed OAuth callback.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackResponse {
    pub server_id: String,
}

struct ManagerInner {
    /// Connections in insertion order; ids are unique within the manager.
    connections: RwLock<Vec<Arc<McpConnection>>>,
    /// Registered OAuth redirect URLs. Append-only.
    callback_urls: RwLock<Vec<String>>,
    transport_factory: TransportFactory,
    warned_missing_auth: AtomicBool,
}

/// Aggregates connections to remote MCP servers and namespaces their
/// discovered tools, prompts and resources by server id.
///
/// Cheap to clone; all clones share the same pool.
#[derive(Clone)]
pub struct McpClientManager {
    inner: Arc<ManagerInner>,
}

impl Default for McpClientManager {
    fn default() -> Self {
        Self::new()
    }
}

impl McpClientManager {
    pub fn new() -> Self {
        Self::with_transport_factory(http_transport_factory())
    }

    /// Use a custom transport factory (tests, alternate wire protocols).
    pub fn with_transport_factory(factory: TransportFactory) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                connections: RwLock::new(Vec::new()),
                callback_urls: RwLock::new(Vec::new()),
                transport_factory: factory,
                warned_missing_auth: AtomicBool::new(false),
            }),
        }
    }

    // -- Connect -------------------------------------------------------------

    /// Open (or re-open) a connection to a server.
    ///
    /// When the server demands authorization the result carries the
    /// `auth_url` for the user to visit and the connection parks in the
    /// `authenticating` state until the OAuth callback lands.
    pub async fn connect(&self, url: &str, opts: ConnectOptions) -> McpResult<ConnectResult> {
        let id = match &opts.reconnect {
            Some(reconnect) if !reconnect.id.is_empty() => reconnect.id.clone(),
            _ => self.fresh_server_id(),
        };

        let provider = opts.transport.auth_provider.clone();
        match &provider {
            Some(provider) => {
                provider.set_server_id(id.clone());
                if let Some(reconnect) = &opts.reconnect {
                    if let Some(client_id) = &reconnect.oauth_client_id {
                        provider.set_client_id(client_id.clone());
                    }
                }
            }
            None => {
                if !self.inner.warned_missing_auth.swap(true, Ordering::Relaxed) {
                    warn!(
                        "connecting to an MCP server without an auth provider; \
                         only unauthenticated servers will work"
                    );
                }
            }
        }

        let transport = (self.inner.transport_factory)(url, &opts.transport);
        let conn = Arc::new(McpConnection::new(
            id.clone(),
            url.to_string(),
            transport,
            opts.transport.clone(),
        ));
        self.insert_connection(Arc::clone(&conn));

        let oauth_code = opts
            .reconnect
            .as_ref()
            .and_then(|r| r.oauth_code.clone());

        match conn.init(oauth_code.as_deref()).await? {
            InitOutcome::Ready => {
                info!(server = %id, url, "mcp connection ready");
                Ok(ConnectResult {
                    id,
                    auth_url: None,
                    client_id: None,
                })
            }
            InitOutcome::NeedsAuth { auth_url } => {
                if let Some(provider) = &provider {
                    if let Some(redirect) = provider.redirect_url() {
                        self.register_callback_url(redirect);
                    }
                }
                let client_id = provider.as_ref().and_then(|p| p.client_id());
                Ok(ConnectResult {
                    id,
                    auth_url: Some(auth_url),
                    client_id,
                })
            }
        }
    }

    fn fresh_server_id(&self) -> String {
        loop {
            let id: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(8)
                .map(char::from)
                .collect();
            if self.connection(&id).is_none() {
                return id;
            }
        }
    }

    fn insert_connection(&self, conn: Arc<McpConnection>) {
        let Ok(mut connections) = self.inner.connections.write() else {
            return;
        };
        match connections.iter().position(|c| c.id() == conn.id()) {
            // Reconnects keep their position in the listing order.
            Some(index) => connections[index] = conn,
            None => connections.push(conn),
        }
    }

    fn register_callback_url(&self, url: String) {
        let Ok(mut urls) = self.inner.callback_urls.write() else {
            return;
        };
        if !urls.contains(&url) {
            debug!(callback = %url, "registered oauth callback url");
            urls.push(url);
        }
    }

    // -- OAuth callback demultiplexing ----------------------------------------

    /// Whether a request targets one of the registered OAuth callbacks.
    pub fn is_callback_request(&self, method: &str, url: &str) -> bool {
        if !method.eq_ignore_ascii_case("GET") {
            return false;
        }
        self.inner
            .callback_urls
            .read()
            .map(|urls| urls.iter().any(|cb| url.starts_with(cb.as_str())))
            .unwrap_or(false)
    }

    /// Complete an OAuth authorization round-trip: pull `code` and
    /// `state` off the callback URL, finish the token exchange and
    /// reconnect the bound server.
    pub async fn handle_callback_request(&self, url: &str) -> McpResult<CallbackResponse> {
        let matched = self
            .inner
            .callback_urls
            .read()
            .ok()
            .and_then(|urls| {
                urls.iter()
                    .find(|cb| url.starts_with(cb.as_str()))
                    .cloned()
            })
            .ok_or_else(|| McpError::NoCallbackMatch {
                url: url.to_string(),
            })?;

        let parsed = url::Url::parse(url)?;
        let server_id = parsed
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .map(str::to_string)
            .ok_or_else(|| McpError::NoCallbackMatch {
                url: url.to_string(),
            })?;

        let mut code = None;
        let mut state = None;
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                _ => {}
            }
        }
        let code = code.ok_or(McpError::NoCodeProvided)?;
        let state = state.ok_or(McpError::NoStateProvided)?;

        let conn = self
            .connection(&server_id)
            .ok_or_else(|| McpError::UnknownServer {
                id: server_id.clone(),
            })?;
        if conn.connection_state() != ConnectionState::Authenticating {
            return Err(McpError::NotAuthenticating);
        }
        let provider = conn.auth_provider().ok_or(McpError::NoAuthProvider)?;

        // The state parameter carries the OAuth client id.
        provider.set_client_id(state.clone());
        provider.set_server_id(server_id.clone());

        debug!(server = %server_id, callback = %matched, "finalizing oauth callback");
        let opts = ConnectOptions {
            transport: conn.transport_options(),
            reconnect: Some(ReconnectOptions {
                id: server_id.clone(),
                oauth_client_id: Some(state),
                oauth_code: Some(code),
            }),
        };
        let url = conn.url().to_string();
        self.connect(&url, opts)
            .await
            .map_err(|_| McpError::InitFailed)?;

        let conn = self
            .connection(&server_id)
            .ok_or_else(|| McpError::UnknownServer {
                id: server_id.clone(),
            })?;
        if conn.connection_state() != ConnectionState::Ready {
            return Err(McpError::InitFailed);
        }
        Ok(CallbackResponse { server_id })
    }

    // -- Pool access -----------------------------------------------------------

    /// All connections in insertion order.
    pub fn connections(&self) -> Vec<Arc<McpConnection>> {
        self.inner
            .connections
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn connection(&self, id: &str) -> Option<Arc<McpConnection>> {
        self.inner
            .connections
            .read()
            .ok()
            .and_then(|connections| {
                connections.iter().find(|c| c.id() == id).cloned()
            })
    }

    pub fn connection_state(&self, id: &str) -> Option<ConnectionState> {
        self.connection(id).map(|c| c.connection_state())
    }

    /// Drop a connection from the pool.
    pub fn close_connection(&self, id: &str) -> McpResult<()> {
        let Ok(mut connections) = self.inner.connections.write() else {
            return Ok(());
        };
        let index = connections
            .iter()
            .position(|c| c.id() == id)
            .ok_or_else(|| McpError::UnknownServer { id: id.to_string() })?;
        connections.remove(index);
        Ok(())
    }

    /// Drop every connection. Registered callback URLs are kept; the
    /// registry is append-only.
    pub fn close_all_connections(&self) {
        if let Ok(mut connections) = self.inner.connections.write() {
            connections.clear();
        }
    }

    // -- Namespaced discovery ---------------------------------------------------

    pub fn list_tools(&self) -> Vec<Namespaced<Tool>> {
        let mut out = Vec::new();
        for conn in self.connections() {
            for tool in conn.tools() {
                out.push(Namespaced {
                    server_id: conn.id().to_string(),
                    item: tool,
                });
            }
        }
        out
    }

    pub fn list_prompts(&self) -> Vec<Namespaced<Prompt>> {
        let mut out = Vec::new();
        for conn in self.connections() {
            for prompt in conn.prompts() {
                out.push(Namespaced {
                    server_id: conn.id().to_string(),
                    item: prompt,
                });
            }
        }
        out
    }

    pub fn list_resources(&self) -> Vec<Namespaced<Resource>> {
        let mut out = Vec::new();
        for conn in self.connections() {
            for resource in conn.resources() {
                out.push(Namespaced {
                    server_id: conn.id().to_string(),
                    item: resource,
                });
            }
        }
        out
    }

    pub fn list_resource_templates(&self) -> Vec<Namespaced<ResourceTemplate>> {
        let mut out = Vec::new();
        for conn in self.connections() {
            for template in conn.resource_templates() {
                out.push(Namespaced {
                    server_id: conn.id().to_string(),
                    item: template,
                });
            }
        }
        out
    }

    // -- Forwarded invocations ---------------------------------------------------

    /// Invoke a tool on a server. `name` may be namespaced as
    /// `"<serverId>.<local>"`; the prefix is stripped before forwarding.
    pub async fn call_tool(
        &self,
        server_id: &str,
        name: &str,
        arguments: Value,
    ) -> McpResult<Value> {
        let conn = self
            .connection(server_id)
            .ok_or_else(|| McpError::UnknownServer {
                id: server_id.to_string(),
            })?;
        let local = name
            .strip_prefix(&format!("{server_id}."))
            .unwrap_or(name);
        conn.call_tool(local, arguments).await
    }

    pub async fn read_resource(&self, server_id: &str, uri: &str) -> McpResult<Value> {
        let conn = self
            .connection(server_id)
            .ok_or_else(|| McpError::UnknownServer {
                id: server_id.to_string(),
            })?;
        conn.read_resource(uri).await
    }

    pub async fn get_prompt(
        &self,
        server_id: &str,
        name: &str,
        arguments: Value,
    ) -> McpResult<Value> {
        let conn = self
            .connection(server_id)
            .ok_or_else(|| McpError::UnknownServer {
                id: server_id.to_string(),
            })?;
        conn.get_prompt(name, arguments).await
    }

    // -- AI tool adapter -----------------------------------------------------------

    /// Flatten every discovered tool into an executable adapter keyed
    /// `tool_<serverId>_<name>`.
    pub fn unstable_get_ai_tools(&self) -> Vec<AiTool> {
        let mut out = Vec::new();
        for conn in self.connections() {
            for tool in conn.tools() {
                out.push(AiTool {
                    name: format!("tool_{}_{}", conn.id(), tool.name),
                    description: tool.description.clone().unwrap_or_default(),
                    input_schema: tool.input_schema.clone(),
                    manager: self.clone(),
                    server_id: conn.id().to_string(),
                    tool_name: tool.name,
                });
            }
        }
        out
    }
}

impl std::fmt::Debug for McpClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClientManager")
            .field("connections", &self.connections().len())
            .finish()
    }
}

/// An executable view of one discovered tool, suitable for handing to an
/// LLM tool-use loop.
#[derive(Clone)]
pub struct AiTool {
    /// `tool_<serverId>_<name>`.
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    manager: McpClientManager,
    server_id: String,
    tool_name: String,
}

impl AiTool {
    /// Invoke the underlying tool. A result carrying `isError: true`
    /// raises with the first content element's text.
    pub async fn execute(&self, arguments: Value) -> McpResult<Value> {
        let result = self
            .manager
            .call_tool(&self.server_id, &self.tool_name, arguments)
            .await?;

        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if is_error {
            let message = result
                .get("content")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("Tool execution failed")
                .to_string();
            return Err(McpError::ToolFailed { message });
        }
        Ok(result)
    }
}

impl std::fmt::Debug for AiTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiTool")
            .field("name", &self.name)
            .field("server_id", &self.server_id)
            .finish()
    }
}
