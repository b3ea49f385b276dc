//! Storage trait abstraction.

use async_trait::async_trait;

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Persistence backend for the finished-checkpoint list of a run.
///
/// The list is opaque to the backend: it is stored and returned as is.
#[async_trait]
pub trait CheckpointStorage: Send + Sync {
    /// Load a previously saved list; `None` if nothing was saved yet.
    async fn load(&self) -> Result<Option<Vec<String>>>;

    /// Replace the saved list.
    async fn save(&self, checkpoints: &[String]) -> Result<()>;
}
