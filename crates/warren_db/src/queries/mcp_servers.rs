//! Durable MCP server bindings.

use sqlx::SqliteConnection;

use crate::error::{DbError, DbResult};
use crate::models::McpServerRecord;

#[derive(sqlx::FromRow)]
struct McpServerRow {
    id: String,
    name: String,
    server_url: String,
    callback_url: String,
    client_id: Option<String>,
    auth_url: Option<String>,
    server_options: Option<String>,
}

impl McpServerRow {
    fn into_record(self) -> DbResult<McpServerRecord> {
        let server_options = self
            .server_options
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|source| DbError::CorruptJson {
                    column: "mcp_servers.server_options",
                    source,
                })
            })
            .transpose()?;
        Ok(McpServerRecord {
            id: self.id,
            name: self.name,
            server_url: self.server_url,
            callback_url: self.callback_url,
            client_id: self.client_id,
            auth_url: self.auth_url,
            server_options,
        })
    }
}

const COLUMNS: &str = "id, name, server_url, callback_url, client_id, auth_url, server_options";

pub async fn upsert(conn: &mut SqliteConnection, record: &McpServerRecord) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO mcp_servers (id, name, server_url, callback_url, client_id, auth_url, server_options)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (id) DO UPDATE SET
             name = excluded.name,
             server_url = excluded.server_url,
             callback_url = excluded.callback_url,
             client_id = excluded.client_id,
             auth_url = excluded.auth_url,
             server_options = excluded.server_options",
    )
    .bind(&record.id)
    .bind(&record.name)
    .bind(&record.server_url)
    .bind(&record.callback_url)
    .bind(&record.client_id)
    .bind(&record.auth_url)
    .bind(record.server_options.as_ref().map(|v| v.to_string()))
    .execute(conn)
    .await?;
    Ok(())
}

/// All bindings in insertion order.
pub async fn list(conn: &mut SqliteConnection) -> DbResult<Vec<McpServerRecord>> {
    let rows: Vec<McpServerRow> =
        sqlx::query_as(&format!("SELECT {COLUMNS} FROM mcp_servers ORDER BY rowid"))
            .fetch_all(conn)
            .await?;
    rows.into_iter().map(McpServerRow::into_record).collect()
}

pub async fn get(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<McpServerRecord>> {
    let row: Option<McpServerRow> =
        sqlx::query_as(&format!("SELECT {COLUMNS} FROM mcp_servers WHERE id = ?"))
            .bind(id)
            .fetch_optional(conn)
            .await?;
    row.map(McpServerRow::into_record).transpose()
}

pub async fn delete(conn: &mut SqliteConnection, id: &str) -> DbResult<bool> {
    let result = sqlx::query("DELETE FROM mcp_servers WHERE id = ?")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected() > 0)
}
