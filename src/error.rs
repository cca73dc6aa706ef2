//! Error types for the sync engine

use thiserror::Error;

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Sync errors
///
/// Malformed event data never shows up here: the normalizer skips it and
/// returns `None`. Everything in this enum aborts the current sub-range
/// without advancing its checkpoint.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Log source failure (RPC error object, unexpected response shape)
    #[error("Log source error: {0}")]
    Source(String),

    /// Bounded wait on an external call elapsed
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Storage error (SQLite)
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Schema directory or migration problem
    #[error("Schema error: {0}")]
    Schema(String),

    /// Stored row could not be decoded back into its typed form
    #[error("Corrupt stored value: {0}")]
    Corrupt(String),

    /// A writer panicked while holding the connection
    #[error("Connection lock poisoned")]
    LockPoisoned,

    /// Background task failed to join
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether retrying the same stream from the same checkpoint can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Source(_) | SyncError::Timeout(_) => true,
            SyncError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            SyncError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
