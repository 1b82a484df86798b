//! Schedule normalization and cron evaluation.
//!
//! `when` inputs normalize to one of three persisted kinds:
//! an absolute time (`scheduled`), a relative delay (`delayed`), or a
//! 5-field cron expression (`cron`, stored with its next computed fire).
//! The `cron` crate is the authority on calendar edge cases; the 5-field
//! grammar is converted to its 7-field form by prepending a `0` seconds
//! field and appending a `*` year field.

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{CoreError, Result};
use warren_db::ScheduleKind;

/// When a schedule should fire.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleWhen {
    /// An absolute instant.
    At(DateTime<Utc>),
    /// Seconds from now.
    Delay(u64),
    /// A 5-field cron expression.
    Cron(String),
}

impl From<DateTime<Utc>> for ScheduleWhen {
    fn from(dt: DateTime<Utc>) -> Self {
        ScheduleWhen::At(dt)
    }
}

impl From<u64> for ScheduleWhen {
    fn from(secs: u64) -> Self {
        ScheduleWhen::Delay(secs)
    }
}

impl From<&str> for ScheduleWhen {
    fn from(expr: &str) -> Self {
        ScheduleWhen::Cron(expr.to_string())
    }
}

impl From<String> for ScheduleWhen {
    fn from(expr: String) -> Self {
        ScheduleWhen::Cron(expr)
    }
}

impl ScheduleWhen {
    /// An absolute time given as epoch milliseconds.
    pub fn at_epoch_ms(ms: i64) -> Self {
        ScheduleWhen::At(Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now))
    }
}

/// The persisted form of a normalized `when`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct NormalizedSchedule {
    pub kind: ScheduleKind,
    /// Epoch seconds of the (next) fire.
    pub time: i64,
    pub delay_seconds: Option<i64>,
    pub cron: Option<String>,
}

/// Normalize a `when` relative to `now` (epoch seconds).
pub(crate) fn normalize(when: ScheduleWhen, now: i64) -> Result<NormalizedSchedule> {
    match when {
        ScheduleWhen::At(dt) => Ok(NormalizedSchedule {
            kind: ScheduleKind::Scheduled,
            time: dt.timestamp(),
            delay_seconds: None,
            cron: None,
        }),
        ScheduleWhen::Delay(secs) => Ok(NormalizedSchedule {
            kind: ScheduleKind::Delayed,
            time: now + secs as i64,
            delay_seconds: Some(secs as i64),
            cron: None,
        }),
        ScheduleWhen::Cron(expr) => {
            let schedule = parse_cron(&expr)?;
            let after = DateTime::from_timestamp(now, 0).unwrap_or_else(Utc::now);
            let time = next_fire(&schedule, after).ok_or_else(|| CoreError::InvalidCron {
                expr: expr.clone(),
                reason: "expression never fires".to_string(),
            })?;
            Ok(NormalizedSchedule {
                kind: ScheduleKind::Cron,
                time,
                delay_seconds: None,
                cron: Some(expr),
            })
        }
    }
}

/// Parse a standard 5-field cron expression.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    let trimmed = expr.trim();
    let fields = trimmed.split_whitespace().count();
    if fields != 5 {
        return Err(CoreError::InvalidCron {
            expr: expr.to_string(),
            reason: format!("expected 5 fields, got {fields}"),
        });
    }
    // minute hour dom month dow -> sec minute hour dom month dow year
    let seven_field = format!("0 {trimmed} *");
    seven_field
        .parse::<cron::Schedule>()
        .map_err(|e| CoreError::InvalidCron {
            expr: expr.to_string(),
            reason: e.to_string(),
        })
}

/// The next fire strictly after `after`, as epoch seconds.
pub fn next_fire(schedule: &cron::Schedule, after: DateTime<Utc>) -> Option<i64> {
    schedule.after(&after).next().map(|dt| dt.timestamp())
}

/// Recompute a stored cron row's next fire after an execution at `now`.
pub(crate) fn advance_cron(expr: &str, now: i64) -> Result<i64> {
    let schedule = parse_cron(expr)?;
    let after = DateTime::from_timestamp(now, 0).unwrap_or_else(Utc::now);
    next_fire(&schedule, after).ok_or_else(|| CoreError::InvalidCron {
        expr: expr.to_string(),
        reason: "expression never fires".to_string(),
    })
}
