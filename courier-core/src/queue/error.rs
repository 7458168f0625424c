//! Error types for message persistence and retry bookkeeping.

use thiserror::Error;

/// Error type for queue operations.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database error from `SQLite`.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored JSON column could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value is not recognised.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type alias for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
