//! Error types for the MCP client manager.

use miette::Diagnostic;
use thiserror::Error;

/// Result type for MCP operations.
pub type McpResult<T> = Result<T, McpError>;

/// Errors from MCP connections, discovery and the OAuth callback flow.
#[derive(Error, Diagnostic, Debug)]
pub enum McpError {
    /// The server rejected the request for lack of credentials. Internal
    /// signal that flips a connection into the `authenticating` state.
    #[error("Server rejected the request as unauthorized")]
    #[diagnostic(code(warren_mcp::unauthorized))]
    Unauthorized,

    #[error("Unauthorized: no code provided")]
    #[diagnostic(code(warren_mcp::no_code))]
    NoCodeProvided,

    #[error("Unauthorized: no state provided")]
    #[diagnostic(code(warren_mcp::no_state))]
    NoStateProvided,

    #[error("Failed to authenticate: the client isn't in the `authenticating` state")]
    #[diagnostic(code(warren_mcp::not_authenticating))]
    NotAuthenticating,

    #[error("No callback URI match found for the request url: {url}")]
    #[diagnostic(
        code(warren_mcp::no_callback_match),
        help("Callback URLs are registered when connect() returns an authUrl")
    )]
    NoCallbackMatch { url: String },

    #[error("Trying to finalize authentication for a server connection without an authProvider")]
    #[diagnostic(code(warren_mcp::no_auth_provider))]
    NoAuthProvider,

    #[error("Failed to authenticate: client failed to initialize")]
    #[diagnostic(code(warren_mcp::init_failed))]
    InitFailed,

    #[error("No MCP server connection with id '{id}'")]
    #[diagnostic(code(warren_mcp::unknown_server))]
    UnknownServer { id: String },

    #[error("Transport error: {0}")]
    #[diagnostic(code(warren_mcp::transport))]
    Transport(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    #[diagnostic(code(warren_mcp::url))]
    Url(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    #[diagnostic(code(warren_mcp::json))]
    Json(#[from] serde_json::Error),

    /// A JSON-RPC error object returned by the server.
    #[error("Server error {code}: {message}")]
    #[diagnostic(code(warren_mcp::rpc))]
    Rpc { code: i64, message: String },

    /// A tool invocation returned `isError: true`.
    #[error("{message}")]
    #[diagnostic(code(warren_mcp::tool_failed))]
    ToolFailed { message: String },

    #[error("OAuth error: {reason}")]
    #[diagnostic(code(warren_mcp::oauth))]
    OAuth { reason: String },
}

impl McpError {
    /// Whether this is a JSON-RPC "method not found" from the server —
    /// tolerated during discovery of optional capabilities.
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, McpError::Rpc { code: -32601, .. })
    }
}
