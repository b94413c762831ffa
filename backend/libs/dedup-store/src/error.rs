//! Error types for the dedup store

use thiserror::Error;

/// Result type for dedup store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while reading or writing the dedup store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database operation failed (connection, query execution, I/O, etc.)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Embedded schema migrations could not be applied
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Event failed the storage-boundary checks (empty id/topic, too long)
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Payload could not be serialized or a stored payload could not be parsed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    /// Check if error is transient (lock contention, pool exhaustion)
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(sqlx_err) => match sqlx_err {
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
                // SQLITE_BUSY, SQLITE_LOCKED and their extended codes
                sqlx::Error::Database(db_err) => {
                    matches!(db_err.code().as_deref(), Some("5" | "6" | "261" | "517"))
                }
                _ => false,
            },
            _ => false,
        }
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db_err| {
            // SQLITE_CONSTRAINT_PRIMARYKEY / SQLITE_CONSTRAINT_UNIQUE
            db_err.is_unique_violation()
                || matches!(db_err.code().as_deref(), Some("1555" | "2067"))
        })
        .unwrap_or(false)
}
