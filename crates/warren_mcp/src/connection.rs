//! A single MCP server connection: state machine, handshake, discovery
//! caches and request forwarding.

use std::sync::{Arc, RwLock};

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::auth::McpAuthProvider;
use crate::error::{McpError, McpResult};
use crate::transport::{McpTransport, TransportOptions};
use crate::types::{
    Prompt, PromptsList, Resource, ResourceTemplate, ResourceTemplatesList, ResourcesList, Tool,
    ToolsList,
};

/// Lifecycle of a server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Ready,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Ready => "ready",
            ConnectionState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of initializing a connection.
#[derive(Debug)]
pub(crate) enum InitOutcome {
    Ready,
    NeedsAuth { auth_url: String },
}

/// One live (or pending) connection to a remote MCP server.
pub struct McpConnection {
    id: String,
    url: String,
    state: RwLock<ConnectionState>,
    transport: Arc<dyn McpTransport>,
    auth_provider: Option<Arc<dyn McpAuthProvider>>,
    transport_options: TransportOptions,
    tools: RwLock<Vec<Tool>>,
    prompts: RwLock<Vec<Prompt>>,
    resources: RwLock<Vec<Resource>>,
    resource_templates: RwLock<Vec<ResourceTemplate>>,
}

impl McpConnection {
    pub(crate) fn new(
        id: String,
        url: String,
        transport: Arc<dyn McpTransport>,
        transport_options: TransportOptions,
    ) -> Self {
        let auth_provider = transport_options.auth_provider.clone();
        Self {
            id,
            url,
            state: RwLock::new(ConnectionState::Connecting),
            transport,
            auth_provider,
            transport_options,
            tools: RwLock::new(Vec::new()),
            prompts: RwLock::new(Vec::new()),
            resources: RwLock::new(Vec::new()),
            resource_templates: RwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
            .read()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Failed)
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut guard) = self.state.write() {
            *guard = state;
        }
    }

    pub(crate) fn auth_provider(&self) -> Option<Arc<dyn McpAuthProvider>> {
        self.auth_provider.clone()
    }

    pub(crate) fn transport_options(&self) -> TransportOptions {
        self.transport_options.clone()
    }

    /// Initialize the connection: optionally finish an OAuth exchange,
    /// run the MCP handshake, then discover the server's offerings.
    ///
    /// An unauthorized server with an auth provider parks the connection
    /// in `authenticating` and reports the URL to visit; any other
    /// failure leaves it `failed` and re-raises.
    pub(crate) async fn init(&self, oauth_code: Option<&str>) -> McpResult<InitOutcome> {
        self.set_state(ConnectionState::Connecting);

        if let Some(code) = oauth_code {
            let provider = self.auth_provider.as_ref().ok_or(McpError::NoAuthProvider)?;
            if let Err(e) = provider.finish_auth(code).await {
                self.set_state(ConnectionState::Failed);
                return Err(e);
            }
        }

        match self.handshake().await {
            Ok(()) => {}
            Err(McpError::Unauthorized) if self.auth_provider.is_some() => {
                let provider = self.auth_provider.as_ref().ok_or(McpError::NoAuthProvider)?;
                let auth_url = match provider.begin_auth(&self.url).await {
                    Ok(url) => url,
                    Err(e) => {
                        self.set_state(ConnectionState::Failed);
                        return Err(e);
                    }
                };
                debug!(server = %self.id, "server requires authorization");
                self.set_state(ConnectionState::Authenticating);
                return Ok(InitOutcome::NeedsAuth { auth_url });
            }
            Err(e) => {
                self.set_state(ConnectionState::Failed);
                return Err(e);
            }
        }

        if let Err(e) = self.discover().await {
            self.set_state(ConnectionState::Failed);
            return Err(e);
        }
        self.set_state(ConnectionState::Ready);
        Ok(InitOutcome::Ready)
    }

    async fn handshake(&self) -> McpResult<()> {
        self.transport
            .request(
                "initialize",
                json!({
                    "protocolVersion": "2025-03-26",
                    "capabilities": {},
                    "clientInfo": {
                        "name": "warren-mcp",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
            .await?;
        self.transport
            .notify("notifications/initialized", json!({}))
            .await?;
        Ok(())
    }

    /// Populate the discovery caches. Servers without a capability answer
    /// "method not found" for its list call; those stay empty.
    async fn discover(&self) -> McpResult<()> {
        match self.transport.request("tools/list", json!({})).await {
            Ok(value) => {
                let list: ToolsList = serde_json::from_value(value)?;
                if let Ok(mut tools) = self.tools.write() {
                    *tools = list.tools;
                }
            }
            Err(e) if e.is_method_not_found() => {}
            Err(e) => return Err(e),
        }

        match self.transport.request("prompts/list", json!({})).await {
            Ok(value) => {
                let list: PromptsList = serde_json::from_value(value)?;
                if let Ok(mut prompts) = self.prompts.write() {
                    *prompts = list.prompts;
                }
            }
            Err(e) if e.is_method_not_found() => {}
            Err(e) => return Err(e),
        }

        match self.transport.request("resources/list", json!({})).await {
            Ok(value) => {
                let list: ResourcesList = serde_json::from_value(value)?;
                if let Ok(mut resources) = self.resources.write() {
                    *resources = list.resources;
                }
            }
            Err(e) if e.is_method_not_found() => {}
            Err(e) => return Err(e),
        }

        match self
            .transport
            .request("resources/templates/list", json!({}))
            .await
        {
            Ok(value) => {
                let list: ResourceTemplatesList = serde_json::from_value(value)?;
                if let Ok(mut templates) = self.resource_templates.write() {
                    *templates = list.resource_templates;
                }
            }
            Err(e) if e.is_method_not_found() => {}
            Err(e) => {
                warn!(server = %self.id, error = %e, "resource template discovery failed");
            }
        }

        Ok(())
    }

    // -- Cache snapshots -----------------------------------------------------

    pub fn tools(&self) -> Vec<Tool> {
        self.tools.read().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.read().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn resources(&self) -> Vec<Resource> {
        self.resources.read().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn resource_templates(&self) -> Vec<ResourceTemplate> {
        self.resource_templates
            .read()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    // -- Forwarded requests ---------------------------------------------------

    /// Invoke a tool by its local (un-namespaced) name.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<Value> {
        self.transport
            .request("tools/call", json!({"name": name, "arguments": arguments}))
            .await
    }

    pub async fn read_resource(&self, uri: &str) -> McpResult<Value> {
        self.transport
            .request("resources/read", json!({"uri": uri}))
            .await
    }

    pub async fn get_prompt(&self, name: &str, arguments: Value) -> McpResult<Value> {
        self.transport
            .request("prompts/get", json!({"name": name, "arguments": arguments}))
            .await
    }
}

impl std::fmt::Debug for McpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpConnection")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("state", &self.connection_state())
            .field("tools", &self.tools().len())
            .finish()
    }
}
