//! Error types for the storage layer.

use miette::Diagnostic;
use thiserror::Error;

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors from the per-agent storage layer.
#[derive(Error, Diagnostic, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    #[diagnostic(code(warren_db::sqlx))]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    #[diagnostic(
        code(warren_db::migration),
        help("The store's schema could not be brought up to date; check the database file for corruption")
    )]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    #[diagnostic(code(warren_db::io))]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON in column {column}: {source}")]
    #[diagnostic(
        code(warren_db::corrupt_json),
        help("A persisted JSON blob failed to parse; the row was written by an incompatible version or corrupted")
    )]
    CorruptJson {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown schedule type: {0}")]
    #[diagnostic(code(warren_db::schedule_type))]
    UnknownScheduleType(String),

    #[error("No transaction is active")]
    #[diagnostic(
        code(warren_db::no_transaction),
        help("commit/rollback must be paired with a prior begin")
    )]
    NoTransaction,
}
