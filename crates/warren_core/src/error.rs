//! Error types for the runtime core.

use miette::Diagnostic;
use thiserror::Error;

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the agent runtime.
#[derive(Error, Diagnostic, Debug)]
pub enum CoreError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Db(#[from] warren_db::DbError),

    #[error("method not found")]
    #[diagnostic(
        code(warren_core::method_not_found),
        help("Only methods registered as callable on the agent class can be invoked remotely")
    )]
    MethodNotFound { method: String },

    #[error("No callback named '{callback}' is registered on class '{class}'")]
    #[diagnostic(
        code(warren_core::callback_not_found),
        help("schedule() and queue() targets must be registered with AgentClassBuilder::callback")
    )]
    CallbackNotFound { class: String, callback: String },

    #[error("No agent class registered for '{class}'")]
    #[diagnostic(
        code(warren_core::class_not_found),
        help("Register the class with RuntimeBuilder::register before routing to it")
    )]
    ClassNotFound { class: String },

    #[error("Invalid cron expression '{expr}': {reason}")]
    #[diagnostic(
        code(warren_core::invalid_cron),
        help("Cron schedules use the standard 5-field grammar: minute hour day-of-month month day-of-week")
    )]
    InvalidCron { expr: String, reason: String },

    #[error("StreamingResponse is already closed")]
    #[diagnostic(code(warren_core::stream_closed))]
    StreamClosed,

    #[error("Agent instance is gone")]
    #[diagnostic(
        code(warren_core::agent_gone),
        help("The instance hibernated or was destroyed mid-operation; the caller may retry")
    )]
    AgentGone,

    #[error("Agent has been destroyed")]
    #[diagnostic(code(warren_core::destroyed))]
    Destroyed,

    #[error("Connection {id} is not attached to this agent")]
    #[diagnostic(code(warren_core::unknown_connection))]
    UnknownConnection { id: String },

    #[error("Duplicate agent class '{class}'")]
    #[diagnostic(
        code(warren_core::duplicate_class),
        help("Two registered classes normalize to the same kebab-case route segment")
    )]
    DuplicateClass { class: String },

    #[error("Configuration error: {reason}")]
    #[diagnostic(code(warren_core::config))]
    Config { reason: String },

    #[error("JSON error: {0}")]
    #[diagnostic(code(warren_core::json))]
    Json(#[from] serde_json::Error),

    #[error("{message}")]
    #[diagnostic(code(warren_core::handler))]
    Handler { message: String },
}

impl CoreError {
    /// An error raised by user handler code.
    pub fn handler(message: impl Into<String>) -> Self {
        CoreError::Handler {
            message: message.into(),
        }
    }
}
