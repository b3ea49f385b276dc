//! One-shot, broadcast cancellation signal owned by a root scope.

use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};

/// Cooperative cancellation flag shared by every scope of a run.
///
/// Cancelling is idempotent; clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
}

impl CancelSignal {
    /// Create a fresh, non-cancelled signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Has cancellation been signalled?
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fail with [`EngineError::Aborted`] if cancellation was signalled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(EngineError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Wait until cancellation is signalled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}
