//! In-memory checkpoint storage, for tests and embedding.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CheckpointStorage, Result};

/// Checkpoint list held in memory. Clones share the same list.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStorage {
    saved: Arc<Mutex<Option<Vec<String>>>>,
    saves: Arc<Mutex<usize>>,
}

impl MemoryCheckpointStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that already holds `checkpoints`.
    pub fn with_checkpoints(checkpoints: Vec<String>) -> Self {
        Self {
            saved: Arc::new(Mutex::new(Some(checkpoints))),
            saves: Arc::new(Mutex::new(0)),
        }
    }

    /// How many times [`CheckpointStorage::save`] was called.
    pub async fn save_count(&self) -> usize {
        *self.saves.lock().await
    }
}

#[async_trait]
impl CheckpointStorage for MemoryCheckpointStorage {
    async fn load(&self) -> Result<Option<Vec<String>>> {
        Ok(self.saved.lock().await.clone())
    }

    async fn save(&self, checkpoints: &[String]) -> Result<()> {
        *self.saved.lock().await = Some(checkpoints.to_vec());
        *self.saves.lock().await += 1;
        Ok(())
    }
}
