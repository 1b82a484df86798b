//! Store management for a single agent.
//!
//! Each agent instance owns exactly one `AgentStore` over its own SQLite
//! file. The store holds a single connection behind a mutex: the instance
//! is a single-writer actor, so there is never more than one statement in
//! flight, and handler transactions (`begin`/`commit`/`rollback`) are
//! guaranteed to land on the same connection.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{Connection, ConnectOptions, SqliteConnection};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::DbResult;
use crate::models::{ChatMessage, McpServerRecord, QueueItem, Schedule, ScheduleQuery};
use crate::queries;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

struct StoreInner {
    conn: SqliteConnection,
    in_tx: bool,
}

/// Typed storage for one agent.
pub struct AgentStore {
    inner: Mutex<StoreInner>,
}

impl AgentStore {
    /// Open or create the store at the given path and run pending
    /// migrations.
    pub async fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!(path = %path.display(), "opening agent store");

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .pragma("synchronous", "NORMAL")
            .foreign_keys(true)
            .disable_statement_logging();

        Self::connect(options).await
    }

    /// Open an in-memory store (for tests).
    pub async fn open_in_memory() -> DbResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true)
            .disable_statement_logging();

        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> DbResult<Self> {
        let mut conn = options.connect().await?;
        MIGRATOR.run(&mut conn).await?;
        debug!("agent store migrations complete");

        Ok(Self {
            inner: Mutex::new(StoreInner { conn, in_tx: false }),
        })
    }

    // -- Handler transactions ----------------------------------------------

    /// Begin the transaction wrapping one handler invocation.
    pub async fn begin(&self) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut inner.conn).await?;
        inner.in_tx = true;
        Ok(())
    }

    /// Commit the active handler transaction.
    pub async fn commit(&self) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.in_tx {
            return Err(crate::error::DbError::NoTransaction);
        }
        sqlx::query("COMMIT").execute(&mut inner.conn).await?;
        inner.in_tx = false;
        Ok(())
    }

    /// Roll back the active handler transaction.
    pub async fn rollback(&self) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.in_tx {
            return Err(crate::error::DbError::NoTransaction);
        }
        sqlx::query("ROLLBACK").execute(&mut inner.conn).await?;
        inner.in_tx = false;
        Ok(())
    }

    /// Whether a handler transaction is currently open.
    pub async fn in_transaction(&self) -> bool {
        self.inner.lock().await.in_tx
    }

    // -- state --------------------------------------------------------------

    pub async fn get_state(&self) -> DbResult<Option<serde_json::Value>> {
        let mut inner = self.inner.lock().await;
        queries::state::get(&mut inner.conn).await
    }

    pub async fn put_state(&self, state: &serde_json::Value) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        queries::state::put(&mut inner.conn, state).await
    }

    // -- queue ---------------------------------------------------------------

    pub async fn push_queue(&self, callback: &str, payload: &serde_json::Value) -> DbResult<i64> {
        let mut inner = self.inner.lock().await;
        queries::queue::push(&mut inner.conn, callback, payload).await
    }

    /// All queue items in FIFO `(created_at, id)` order.
    pub async fn queue_items(&self) -> DbResult<Vec<QueueItem>> {
        let mut inner = self.inner.lock().await;
        queries::queue::all(&mut inner.conn).await
    }

    pub async fn remove_queue_item(&self, id: i64) -> DbResult<bool> {
        let mut inner = self.inner.lock().await;
        queries::queue::remove(&mut inner.conn, id).await
    }

    // -- schedule -------------------------------------------------------------

    pub async fn insert_schedule(&self, schedule: &Schedule) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        queries::schedule::insert(&mut inner.conn, schedule).await
    }

    pub async fn get_schedule(&self, id: &str) -> DbResult<Option<Schedule>> {
        let mut inner = self.inner.lock().await;
        queries::schedule::get(&mut inner.conn, id).await
    }

    pub async fn list_schedules(&self, query: &ScheduleQuery) -> DbResult<Vec<Schedule>> {
        let mut inner = self.inner.lock().await;
        queries::schedule::list(&mut inner.conn, query).await
    }

    pub async fn delete_schedule(&self, id: &str) -> DbResult<bool> {
        let mut inner = self.inner.lock().await;
        queries::schedule::delete(&mut inner.conn, id).await
    }

    /// Rewrite a cron row's next fire time.
    pub async fn reschedule(&self, id: &str, time: i64) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        queries::schedule::update_time(&mut inner.conn, id, time).await
    }

    /// Schedules with `time <= now`, ascending.
    pub async fn due_schedules(&self, now: i64) -> DbResult<Vec<Schedule>> {
        let mut inner = self.inner.lock().await;
        queries::schedule::due(&mut inner.conn, now).await
    }

    // -- mcp servers ----------------------------------------------------------

    pub async fn upsert_mcp_server(&self, record: &McpServerRecord) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        queries::mcp_servers::upsert(&mut inner.conn, record).await
    }

    pub async fn list_mcp_servers(&self) -> DbResult<Vec<McpServerRecord>> {
        let mut inner = self.inner.lock().await;
        queries::mcp_servers::list(&mut inner.conn).await
    }

    pub async fn get_mcp_server(&self, id: &str) -> DbResult<Option<McpServerRecord>> {
        let mut inner = self.inner.lock().await;
        queries::mcp_servers::get(&mut inner.conn, id).await
    }

    pub async fn delete_mcp_server(&self, id: &str) -> DbResult<bool> {
        let mut inner = self.inner.lock().await;
        queries::mcp_servers::delete(&mut inner.conn, id).await
    }

    // -- chat -----------------------------------------------------------------

    pub async fn replace_chat_messages(&self, messages: &[ChatMessage]) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        queries::chat::replace_all(&mut inner.conn, messages).await
    }

    pub async fn chat_messages(&self) -> DbResult<Vec<ChatMessage>> {
        let mut inner = self.inner.lock().await;
        queries::chat::list(&mut inner.conn).await
    }

    pub async fn clear_chat_messages(&self) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        queries::chat::clear(&mut inner.conn).await
    }

    // -- alarm / lifecycle ----------------------------------------------------

    /// The next alarm time in epoch seconds: `min(schedule.time)`, or `now`
    /// if any queue item is waiting. `None` means nothing is pending.
    pub async fn next_fire_time(&self, now: i64) -> DbResult<Option<i64>> {
        let mut inner = self.inner.lock().await;
        let next_schedule = queries::schedule::next_time(&mut inner.conn).await?;
        let queue_waiting = queries::queue::count(&mut inner.conn).await? > 0;

        Ok(match (next_schedule, queue_waiting) {
            (Some(t), true) => Some(t.min(now)),
            (Some(t), false) => Some(t),
            (None, true) => Some(now),
            (None, false) => None,
        })
    }

    /// Delete every row in all five tables. Backs `Agent::destroy`.
    pub async fn wipe(&self) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        for table in ["state", "queue", "schedule", "mcp_servers", "chat_messages"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut inner.conn)
                .await?;
        }
        Ok(())
    }

    /// Close the underlying connection.
    pub async fn close(self) -> DbResult<()> {
        let inner = self.inner.into_inner();
        inner.conn.close().await?;
        Ok(())
    }
}

impl std::fmt::Debug for AgentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_runs_migrations() {
        let store = AgentStore::open_in_memory().await.unwrap();
        assert!(store.get_state().await.unwrap().is_none());
        assert!(store.queue_items().await.unwrap().is_empty());
        assert!(store.next_fire_time(0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn open_on_disk_creates_parent_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/dir/agent.db");
        let store = AgentStore::open(&path).await.unwrap();
        store
            .put_state(&serde_json::json!({"ok": true}))
            .await
            .unwrap();
        store.close().await.unwrap();

        // Reopen and verify persistence.
        let store = AgentStore::open(&path).await.unwrap();
        assert_eq!(
            store.get_state().await.unwrap(),
            Some(serde_json::json!({"ok": true}))
        );
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = AgentStore::open_in_memory().await.unwrap();
        store.put_state(&serde_json::json!({"n": 1})).await.unwrap();

        store.begin().await.unwrap();
        store.put_state(&serde_json::json!({"n": 2})).await.unwrap();
        store.rollback().await.unwrap();

        assert_eq!(
            store.get_state().await.unwrap(),
            Some(serde_json::json!({"n": 1}))
        );
    }

    #[tokio::test]
    async fn commit_persists_writes() {
        let store = AgentStore::open_in_memory().await.unwrap();
        store.begin().await.unwrap();
        store.put_state(&serde_json::json!({"n": 2})).await.unwrap();
        store.commit().await.unwrap();

        assert_eq!(
            store.get_state().await.unwrap(),
            Some(serde_json::json!({"n": 2}))
        );
    }

    #[tokio::test]
    async fn commit_without_begin_errors() {
        let store = AgentStore::open_in_memory().await.unwrap();
        assert!(store.commit().await.is_err());
        assert!(store.rollback().await.is_err());
    }

    #[tokio::test]
    async fn wipe_clears_everything() {
        let store = AgentStore::open_in_memory().await.unwrap();
        store.put_state(&serde_json::json!({"x": 1})).await.unwrap();
        store
            .push_queue("work", &serde_json::json!(null))
            .await
            .unwrap();

        store.wipe().await.unwrap();

        assert!(store.get_state().await.unwrap().is_none());
        assert!(store.queue_items().await.unwrap().is_empty());
    }
}
