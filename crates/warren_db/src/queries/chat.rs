//! Chat message append-log.

use sqlx::SqliteConnection;

use crate::error::{DbError, DbResult};
use crate::models::ChatMessage;

#[derive(sqlx::FromRow)]
struct ChatRow {
    id: String,
    message: String,
    created_at: i64,
}

impl ChatRow {
    fn into_message(self) -> DbResult<ChatMessage> {
        let message = serde_json::from_str(&self.message).map_err(|source| {
            DbError::CorruptJson {
                column: "chat_messages.message",
                source,
            }
        })?;
        Ok(ChatMessage {
            id: self.id,
            message,
            created_at: self.created_at,
        })
    }
}

/// Replace the full log with the synced array, preserving array order.
pub async fn replace_all(conn: &mut SqliteConnection, messages: &[ChatMessage]) -> DbResult<()> {
    sqlx::query("DELETE FROM chat_messages")
        .execute(&mut *conn)
        .await?;
    for message in messages {
        sqlx::query("INSERT INTO chat_messages (id, message, created_at) VALUES (?, ?, ?)")
            .bind(&message.id)
            .bind(message.message.to_string())
            .bind(message.created_at)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

pub async fn list(conn: &mut SqliteConnection) -> DbResult<Vec<ChatMessage>> {
    let rows: Vec<ChatRow> =
        sqlx::query_as("SELECT id, message, created_at FROM chat_messages ORDER BY rowid")
            .fetch_all(conn)
            .await?;
    rows.into_iter().map(ChatRow::into_message).collect()
}

pub async fn clear(conn: &mut SqliteConnection) -> DbResult<()> {
    sqlx::query("DELETE FROM chat_messages").execute(conn).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::models::ChatMessage;
    use crate::AgentStore;
    use serde_json::json;

    fn msg(id: &str, text: &str) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            message: json!({"role": "user", "content": text}),
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn replace_all_is_a_full_sync() {
        let store = AgentStore::open_in_memory().await.unwrap();
        store
            .replace_chat_messages(&[msg("1", "hello"), msg("2", "world")])
            .await
            .unwrap();
        store
            .replace_chat_messages(&[msg("3", "replaced")])
            .await
            .unwrap();

        let log = store.chat_messages().await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].id, "3");
    }

    #[tokio::test]
    async fn clear_empties_the_log() {
        let store = AgentStore::open_in_memory().await.unwrap();
        store
            .replace_chat_messages(&[msg("1", "hello")])
            .await
            .unwrap();
        store.clear_chat_messages().await.unwrap();
        assert!(store.chat_messages().await.unwrap().is_empty());
    }
}
