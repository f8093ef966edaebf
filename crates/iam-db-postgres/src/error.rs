//! Error types for the PostgreSQL storage backend.

use iam_storage::StorageError;
use sqlx_core::error::Error as SqlxError;

/// PostgreSQL error code for deadlock_detected (40P01).
pub const PG_DEADLOCK_DETECTED: &str = "40P01";

/// PostgreSQL error code for unique_violation (23505).
pub const PG_UNIQUE_VIOLATION: &str = "23505";

/// Maps a SQLSTATE code and message to the storage error taxonomy.
pub fn classify_code(code: Option<&str>, message: &str) -> StorageError {
    match code {
        Some(PG_DEADLOCK_DETECTED) => StorageError::deadlock(message),
        Some(PG_UNIQUE_VIOLATION) => StorageError::already_exists(message),
        _ => StorageError::database(message),
    }
}

/// Converts a sqlx error into a [`StorageError`], classifying deadlocks.
pub fn classify(err: SqlxError) -> StorageError {
    match &err {
        SqlxError::Database(db_err) => classify_code(db_err.code().as_deref(), db_err.message()),
        SqlxError::PoolTimedOut | SqlxError::PoolClosed | SqlxError::Io(_) | SqlxError::Tls(_) => {
            StorageError::connection_error(err.to_string())
        }
        _ => StorageError::database(err.to_string()),
    }
}

/// Errors specific to the PostgreSQL storage backend.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    /// Database connection error.
    #[error("Database connection error: {0}")]
    Connection(#[from] sqlx_core::error::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl PostgresError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

impl From<PostgresError> for StorageError {
    fn from(err: PostgresError) -> Self {
        match err {
            PostgresError::Connection(e) => StorageError::connection_error(e.to_string()),
            PostgresError::Migration(e) => StorageError::internal(format!("Migration error: {e}")),
            PostgresError::Config { message } => {
                StorageError::internal(format!("Configuration error: {message}"))
            }
        }
    }
}

/// Result type alias for PostgreSQL operations.
pub type Result<T> = std::result::Result<T, PostgresError>;
