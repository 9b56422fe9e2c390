use thiserror::Error;

/// Storage error types. Storage failures are fatal for the operation that
/// hit them; transactions roll back before the error is surfaced.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("unknown index: {0}")]
    UnknownIndex(String),

    #[error("transaction aborted: {0}")]
    Aborted(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
