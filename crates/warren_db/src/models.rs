//! Domain models for the five per-agent tables.
//!
//! Column semantics are part of the runtime's public contract: external
//! tooling may read these tables directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DbError;

/// Discriminant for the `schedule.type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    /// Fires once at an absolute time.
    Scheduled,
    /// Fires once after a relative delay; `delay_seconds` records the offset.
    Delayed,
    /// Recurs on a 5-field cron expression; `time` holds the next fire.
    Cron,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::Scheduled => "scheduled",
            ScheduleKind::Delayed => "delayed",
            ScheduleKind::Cron => "cron",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DbError> {
        match s {
            "scheduled" => Ok(ScheduleKind::Scheduled),
            "delayed" => Ok(ScheduleKind::Delayed),
            "cron" => Ok(ScheduleKind::Cron),
            other => Err(DbError::UnknownScheduleType(other.to_string())),
        }
    }
}

impl std::fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted schedule row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    /// Name of the registered callback to invoke on fire.
    pub callback: String,
    pub payload: Value,
    pub kind: ScheduleKind,
    /// Next fire as epoch seconds (absolute for all three kinds).
    pub time: i64,
    /// Original relative offset for `delayed` rows.
    pub delay_seconds: Option<i64>,
    /// The cron expression for `cron` rows.
    pub cron: Option<String>,
    pub created_at: i64,
}

impl Schedule {
    /// The next fire time as a `DateTime`.
    pub fn fire_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.time, 0)
    }
}

/// Filter for listing schedules.
#[derive(Debug, Clone, Default)]
pub struct ScheduleQuery {
    pub id: Option<String>,
    pub kind: Option<ScheduleKind>,
    /// Only rows with `time >= after` (epoch seconds).
    pub after: Option<i64>,
    /// Only rows with `time <= before` (epoch seconds).
    pub before: Option<i64>,
}

/// A durable FIFO work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub payload: Value,
    pub callback: String,
    /// Insertion time in epoch milliseconds; FIFO order is `(created_at, id)`.
    pub created_at: i64,
}

/// A reconnectable MCP server binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerRecord {
    pub id: String,
    pub name: String,
    pub server_url: String,
    pub callback_url: String,
    /// OAuth client id obtained during dynamic registration, if any.
    pub client_id: Option<String>,
    pub auth_url: Option<String>,
    /// Opaque transport/connect options, stored as JSON.
    pub server_options: Option<Value>,
}

/// One entry in the chat append-log. Unused by the runtime core itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub message: Value,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_kind_round_trips() {
        for kind in [
            ScheduleKind::Scheduled,
            ScheduleKind::Delayed,
            ScheduleKind::Cron,
        ] {
            assert_eq!(ScheduleKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(ScheduleKind::parse("hourly").is_err());
    }
}
