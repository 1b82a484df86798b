//! Warren - an agent runtime.
//!
//! Warren hosts long-lived, addressable, stateful agents. Each `(class,
//! name)` pair resolves to exactly one single-writer instance backed by
//! its own SQLite store; HTTP requests, WebSocket control traffic, email,
//! durable queues and schedules all funnel through the instance mailbox
//! and execute one handler at a time.
//!
//! The crate layers, bottom up:
//! - [`name`]: kebab-case routing names and deterministic identifiers
//! - [`agent`]: classes, handlers, instances, connections
//! - [`scheduler`]: `when` normalization and cron evaluation
//! - [`rpc`]: callable dispatch, streaming sinks, JSON-RPC over HTTP
//! - [`protocol`]: the WebSocket control frames
//! - [`runtime`]: the supervisor resolving addresses to instances
//! - [`router`]: axum routing, CORS, WebSocket upgrades

pub mod agent;
pub mod config;
pub mod context;
pub mod error;
pub mod name;
pub mod protocol;
pub mod router;
pub mod rpc;
pub mod runtime;
pub mod scheduler;

pub use agent::{
    Agent, AgentClass, AgentClassBuilder, AgentHandler, AgentRequest, AgentResponse,
    ChatBodyStream, Connection, EmailMessage, ReadyState, SocketCommand, StateSource,
    CLOSE_INTERNAL_ERROR,
};
pub use config::{CorsConfig, RouterConfig, RuntimeConfig};
pub use context::{current, current_agent, current_connection, InvocationContext};
pub use error::{CoreError, Result};
pub use name::{kebab_case, AgentAddress};
pub use protocol::{IncomingFrame, OutgoingFrame};
pub use router::{agent_router, parse_agent_path, AgentPath};
pub use rpc::StreamingResponse;
pub use runtime::{Runtime, RuntimeBuilder};
pub use scheduler::ScheduleWhen;

// Storage models are part of the public surface: schedules and queue
// items round-trip through the agent API.
pub use warren_db::{ChatMessage, McpServerRecord, QueueItem, Schedule, ScheduleKind, ScheduleQuery};
