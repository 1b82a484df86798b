//! Durable FIFO queue items.

use chrono::Utc;
use serde_json::Value;
use sqlx::SqliteConnection;

use crate::error::{DbError, DbResult};
use crate::models::QueueItem;

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: i64,
    payload: String,
    callback: String,
    created_at: i64,
}

impl QueueRow {
    fn into_item(self) -> DbResult<QueueItem> {
        let payload = serde_json::from_str(&self.payload).map_err(|source| {
            DbError::CorruptJson {
                column: "queue.payload",
                source,
            }
        })?;
        Ok(QueueItem {
            id: self.id,
            payload,
            callback: self.callback,
            created_at: self.created_at,
        })
    }
}

pub async fn push(conn: &mut SqliteConnection, callback: &str, payload: &Value) -> DbResult<i64> {
    let result = sqlx::query("INSERT INTO queue (payload, callback, created_at) VALUES (?, ?, ?)")
        .bind(payload.to_string())
        .bind(callback)
        .bind(Utc::now().timestamp_millis())
        .execute(conn)
        .await?;
    Ok(result.last_insert_rowid())
}

/// All items, strictly in `(created_at, id)` order.
pub async fn all(conn: &mut SqliteConnection) -> DbResult<Vec<QueueItem>> {
    let rows: Vec<QueueRow> = sqlx::query_as(
        "SELECT id, payload, callback, created_at FROM queue ORDER BY created_at ASC, id ASC",
    )
    .fetch_all(conn)
    .await?;

    rows.into_iter().map(QueueRow::into_item).collect()
}

pub async fn count(conn: &mut SqliteConnection) -> DbResult<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue")
        .fetch_one(conn)
        .await?;
    Ok(count)
}

pub async fn remove(conn: &mut SqliteConnection, id: i64) -> DbResult<bool> {
    let result = sqlx::query("DELETE FROM queue WHERE id = ?")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected() > 0)
}
