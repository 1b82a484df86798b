//! Typed queries for the per-agent tables.
//!
//! Nothing outside this crate composes SQL; every operation here is a
//! named function over the single store connection.

pub mod chat;
pub mod mcp_servers;
pub mod queue;
pub mod schedule;
pub mod state;
