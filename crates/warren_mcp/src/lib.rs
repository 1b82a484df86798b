//! Warren MCP client manager.
//!
//! Maintains a pool of connections to remote Model Context Protocol
//! servers, runs the OAuth authorization-code flow with PKCE where a
//! server demands it, and exposes the union of discovered tools, prompts
//! and resources namespaced by server id.
//!
//! The manager is storage-agnostic: agents persist reconnectable server
//! bindings through their own store (`warren_core`'s `mcp_servers` table)
//! and re-`connect` on hydration with `ReconnectOptions`.

pub mod auth;
pub mod connection;
pub mod error;
pub mod manager;
pub mod transport;
pub mod types;

pub use auth::{McpAuthProvider, PkceAuthProvider};
pub use connection::{ConnectionState, McpConnection};
pub use error::{McpError, McpResult};
pub use manager::{
    AiTool, CallbackResponse, ConnectOptions, ConnectResult, McpClientManager, ReconnectOptions,
};
pub use transport::{HttpTransport, McpTransport, TransportFactory, TransportOptions};
pub use types::{Namespaced, Prompt, Resource, ResourceTemplate, Tool};
