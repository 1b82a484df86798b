//! Persisted schedule rows.

use serde_json::Value;
use sqlx::SqliteConnection;

use crate::error::{DbError, DbResult};
use crate::models::{Schedule, ScheduleKind, ScheduleQuery};

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    id: String,
    callback: String,
    payload: Option<String>,
    #[sqlx(rename = "type")]
    kind: String,
    time: i64,
    delay_seconds: Option<i64>,
    cron: Option<String>,
    created_at: i64,
}

impl ScheduleRow {
    fn into_schedule(self) -> DbResult<Schedule> {
        let payload = match self.payload {
            Some(raw) => serde_json::from_str(&raw).map_err(|source| DbError::CorruptJson {
                column: "schedule.payload",
                source,
            })?,
            None => Value::Null,
        };
        Ok(Schedule {
            id: self.id,
            callback: self.callback,
            payload,
            kind: ScheduleKind::parse(&self.kind)?,
            time: self.time,
            delay_seconds: self.delay_seconds,
            cron: self.cron,
            created_at: self.created_at,
        })
    }
}

const COLUMNS: &str = "id, callback, payload, type, time, delay_seconds, cron, created_at";

pub async fn insert(conn: &mut SqliteConnection, schedule: &Schedule) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO schedule (id, callback, payload, type, time, delay_seconds, cron, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&schedule.id)
    .bind(&schedule.callback)
    .bind(schedule.payload.to_string())
    .bind(schedule.kind.as_str())
    .bind(schedule.time)
    .bind(schedule.delay_seconds)
    .bind(&schedule.cron)
    .bind(schedule.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<Schedule>> {
    let row: Option<ScheduleRow> =
        sqlx::query_as(&format!("SELECT {COLUMNS} FROM schedule WHERE id = ?"))
            .bind(id)
            .fetch_optional(conn)
            .await?;
    row.map(ScheduleRow::into_schedule).transpose()
}

/// List schedules matching the query, ascending by `(time, id)`.
///
/// Rows are filtered after the fetch; per-agent schedule counts are small
/// and this keeps the SQL static.
pub async fn list(conn: &mut SqliteConnection, query: &ScheduleQuery) -> DbResult<Vec<Schedule>> {
    let rows: Vec<ScheduleRow> =
        sqlx::query_as(&format!("SELECT {COLUMNS} FROM schedule ORDER BY time ASC, id ASC"))
            .fetch_all(conn)
            .await?;

    let mut schedules = Vec::with_capacity(rows.len());
    for row in rows {
        let schedule = row.into_schedule()?;
        if let Some(ref id) = query.id {
            if &schedule.id != id {
                continue;
            }
        }
        if let Some(kind) = query.kind {
            if schedule.kind != kind {
                continue;
            }
        }
        if let Some(after) = query.after {
            if schedule.time < after {
                continue;
            }
        }
        if let Some(before) = query.before {
            if schedule.time > before {
                continue;
            }
        }
        schedules.push(schedule);
    }
    Ok(schedules)
}

pub async fn delete(conn: &mut SqliteConnection, id: &str) -> DbResult<bool> {
    let result = sqlx::query("DELETE FROM schedule WHERE id = ?")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn update_time(conn: &mut SqliteConnection, id: &str, time: i64) -> DbResult<()> {
    sqlx::query("UPDATE schedule SET time = ? WHERE id = ?")
        .bind(time)
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Rows with `time <= now`, ascending by `(time, id)`.
pub async fn due(conn: &mut SqliteConnection, now: i64) -> DbResult<Vec<Schedule>> {
    let rows: Vec<ScheduleRow> = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM schedule WHERE time <= ? ORDER BY time ASC, id ASC"
    ))
    .bind(now)
    .fetch_all(conn)
    .await?;
    rows.into_iter().map(ScheduleRow::into_schedule).collect()
}

/// The earliest pending fire time, if any.
pub async fn next_time(conn: &mut SqliteConnection) -> DbResult<Option<i64>> {
    let row: (Option<i64>,) = sqlx::query_as("SELECT MIN(time) FROM schedule")
        .fetch_one(conn)
        .await?;
    Ok(row.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AgentStore;
    use serde_json::json;

    fn sample(id: &str, kind: ScheduleKind, time: i64) -> Schedule {
        Schedule {
            id: id.to_string(),
            callback: "tick".to_string(),
            payload: json!({"id": id}),
            kind,
            time,
            delay_seconds: match kind {
                ScheduleKind::Delayed => Some(30),
                _ => None,
            },
            cron: match kind {
                ScheduleKind::Cron => Some("0 9 * * *".to_string()),
                _ => None,
            },
            created_at: 1_000,
        }
    }

    #[tokio::test]
    async fn round_trips_all_kinds() {
        let store = AgentStore::open_in_memory().await.unwrap();
        for (id, kind) in [
            ("a", ScheduleKind::Scheduled),
            ("b", ScheduleKind::Delayed),
            ("c", ScheduleKind::Cron),
        ] {
            let schedule = sample(id, kind, 2_000);
            store.insert_schedule(&schedule).await.unwrap();
            let loaded = store.get_schedule(id).await.unwrap().unwrap();
            assert_eq!(loaded, schedule);
        }
    }

    #[tokio::test]
    async fn due_is_ordered_and_bounded() {
        let store = AgentStore::open_in_memory().await.unwrap();
        store
            .insert_schedule(&sample("late", ScheduleKind::Scheduled, 300))
            .await
            .unwrap();
        store
            .insert_schedule(&sample("early", ScheduleKind::Scheduled, 100))
            .await
            .unwrap();
        store
            .insert_schedule(&sample("future", ScheduleKind::Scheduled, 900))
            .await
            .unwrap();

        let due = store.due_schedules(300).await.unwrap();
        assert_eq!(
            due.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec!["early", "late"]
        );
    }

    #[tokio::test]
    async fn list_filters_by_kind_and_window() {
        let store = AgentStore::open_in_memory().await.unwrap();
        store
            .insert_schedule(&sample("s1", ScheduleKind::Scheduled, 100))
            .await
            .unwrap();
        store
            .insert_schedule(&sample("c1", ScheduleKind::Cron, 200))
            .await
            .unwrap();
        store
            .insert_schedule(&sample("s2", ScheduleKind::Scheduled, 400))
            .await
            .unwrap();

        let crons = store
            .list_schedules(&ScheduleQuery {
                kind: Some(ScheduleKind::Cron),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(crons.len(), 1);
        assert_eq!(crons[0].id, "c1");

        let windowed = store
            .list_schedules(&ScheduleQuery {
                after: Some(150),
                before: Some(450),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(
            windowed.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec!["c1", "s2"]
        );
    }

    #[tokio::test]
    async fn update_time_advances_cron() {
        let store = AgentStore::open_in_memory().await.unwrap();
        store
            .insert_schedule(&sample("c", ScheduleKind::Cron, 500))
            .await
            .unwrap();

        store.reschedule("c", 86_900).await.unwrap();
        let loaded = store.get_schedule("c").await.unwrap().unwrap();
        assert_eq!(loaded.time, 86_900);
    }

    #[tokio::test]
    async fn next_time_is_minimum() {
        let store = AgentStore::open_in_memory().await.unwrap();
        assert_eq!(store.next_fire_time(50).await.unwrap(), None);

        store
            .insert_schedule(&sample("a", ScheduleKind::Scheduled, 700))
            .await
            .unwrap();
        store
            .insert_schedule(&sample("b", ScheduleKind::Scheduled, 300))
            .await
            .unwrap();
        assert_eq!(store.next_fire_time(50).await.unwrap(), Some(300));

        // A waiting queue item pulls the alarm to "now".
        store.push_queue("cb", &json!(null)).await.unwrap();
        assert_eq!(store.next_fire_time(50).await.unwrap(), Some(50));
    }
}
