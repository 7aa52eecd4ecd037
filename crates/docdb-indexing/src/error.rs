//! Error types for the indexing executors.

use docdb_storage::StorageError;
use thiserror::Error;

/// Errors that can occur while maintaining index output
#[derive(Error, Debug)]
pub enum IndexingError {
    /// Storage operation failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A reduce function failed for one key/group
    #[error("Reduce failed for index {index}, key {reduce_key}: {message}")]
    Reduce {
        index: String,
        reduce_key: String,
        message: String,
    },

    /// Custom reduce function not registered on the context
    #[error("Unknown reduce function: {0}")]
    UnknownReducer(String),

    /// Per-index work panicked
    #[error("Indexing work panicked: {0}")]
    Panic(String),

    /// Background task could not be joined
    #[error("Task join error: {0}")]
    Join(String),

    /// Generic index error
    #[error("Index error: {0}")]
    Index(String),
}

impl From<tokio::task::JoinError> for IndexingError {
    fn from(err: tokio::task::JoinError) -> Self {
        IndexingError::Join(err.to_string())
    }
}
