//! Run configuration.

use std::path::PathBuf;
use std::time::Duration;

use harvester_core::EngineError;

/// Configuration of a [`crate::RunController`].
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Name of the root scope
    pub name: String,
    /// JSON file to restore checkpoints from and save them to
    pub checkpoint_file: Option<PathBuf>,
    /// Render the progress tree into the log at this interval
    pub progress_log_interval: Option<Duration>,
    /// Concurrency limit of executors created in the run
    pub default_limit: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            name: "ROOT".to_string(),
            checkpoint_file: None,
            progress_log_interval: None,
            default_limit: 1,
        }
    }
}

impl RunConfig {
    /// Default configuration with the given root scope name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Restore from and save to a checkpoint file.
    pub fn with_checkpoint_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_file = Some(path.into());
        self
    }

    /// Log the progress tree periodically.
    pub fn with_progress_log_interval(mut self, interval: Duration) -> Self {
        self.progress_log_interval = Some(interval);
        self
    }

    /// Set the default executor concurrency.
    pub fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit;
        self
    }

    /// Check the configuration before a run starts.
    pub fn validate(&self) -> harvester_core::Result<()> {
        if self.default_limit < 1 {
            return Err(EngineError::InvalidLimit(self.default_limit));
        }
        if self.progress_log_interval == Some(Duration::ZERO) {
            return Err(EngineError::InvalidConfig(
                "progress log interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
