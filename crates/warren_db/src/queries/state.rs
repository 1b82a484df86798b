//! The singleton state row.

use serde_json::Value;
use sqlx::SqliteConnection;

use crate::error::{DbError, DbResult};

pub async fn get(conn: &mut SqliteConnection) -> DbResult<Option<Value>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT blob FROM state WHERE id = 1")
        .fetch_optional(conn)
        .await?;

    row.map(|(blob,)| {
        serde_json::from_str(&blob).map_err(|source| DbError::CorruptJson {
            column: "state.blob",
            source,
        })
    })
    .transpose()
}

pub async fn put(conn: &mut SqliteConnection, state: &Value) -> DbResult<()> {
    let blob = state.to_string();
    sqlx::query(
        "INSERT INTO state (id, blob) VALUES (1, ?)
         ON CONFLICT (id) DO UPDATE SET blob = excluded.blob",
    )
    .bind(blob)
    .execute(conn)
    .await?;
    Ok(())
}
