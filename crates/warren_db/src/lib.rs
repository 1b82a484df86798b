//! Warren storage layer.
//!
//! One SQLite database per agent instance, physically isolating agents from
//! one another. The store exposes typed operations over five tables —
//! state, queue, schedule, mcp_servers, chat_messages — and the handler
//! transaction used by the runtime to make each handler invocation's
//! writes atomic.

pub mod connection;
pub mod error;
pub mod models;
pub mod queries;

pub use connection::AgentStore;
pub use error::{DbError, DbResult};
pub use models::{
    ChatMessage, McpServerRecord, QueueItem, Schedule, ScheduleKind, ScheduleQuery,
};
