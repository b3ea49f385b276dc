//! JSON file checkpoint storage.
//!
//! The checkpoint list is stored as a pretty-printed JSON array of strings.
//! A missing file means "no checkpoints yet".

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::{CheckpointStorage, Result};

/// Checkpoint list stored in a single JSON file.
#[derive(Debug, Clone)]
pub struct JsonCheckpointFile {
    path: PathBuf,
}

impl JsonCheckpointFile {
    /// Storage backed by the file at `path`. Nothing is touched until used.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Location of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CheckpointStorage for JsonCheckpointFile {
    async fn load(&self) -> Result<Option<Vec<String>>> {
        match fs::read_to_string(&self.path).await {
            Ok(json) => {
                let checkpoints: Vec<String> = serde_json::from_str(&json)?;
                debug!(path = %self.path.display(), count = checkpoints.len(), "loaded checkpoints");
                Ok(Some(checkpoints))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, checkpoints: &[String]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(checkpoints)?;
        fs::write(&self.path, json.as_bytes()).await?;
        debug!(path = %self.path.display(), count = checkpoints.len(), "saved checkpoints");
        Ok(())
    }
}
