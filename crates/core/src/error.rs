//! Error taxonomy for the execution engine.

use std::sync::Arc;

use crate::scope::ScopeNode;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the engine itself (as opposed to user callbacks).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// `current()` was called outside of any scope extent.
    ///
    /// This is a programmer error: scoped code was invoked without a run.
    #[error("no active scope: scoped code must run inside a run entrypoint")]
    NoActiveScope,

    /// Cancellation was observed at an iteration or scope boundary.
    #[error("aborted")]
    Aborted,

    /// A concurrency limit lower than 1 was requested.
    #[error("concurrency limit must be at least 1, got {0}")]
    InvalidLimit(usize),

    /// An operation was attempted in a lifecycle state that does not allow it.
    #[error("cannot {operation} a run in state '{current}', expected '{expected}'")]
    InvalidState {
        /// Operation that was attempted
        operation: &'static str,
        /// State the operation requires
        expected: &'static str,
        /// State the run was in
        current: String,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A second progress tracker was created while one is live in the same scope.
    #[error("there can be only one active progress tracker per scope ({0})")]
    TrackerAlreadyActive(String),

    /// An item could not be serialized into a checkpoint identifier.
    #[error("cannot serialize checkpoint item: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// An error raised inside a scoped call, wrapped once at its origin scope.
///
/// Ancestor scopes pass it through unchanged, so the original cause reaches
/// the top of the run intact.
pub struct ScopedError {
    origin: Arc<ScopeNode>,
    cause: anyhow::Error,
}

impl ScopedError {
    /// Wrap `cause` as originating in `origin`.
    pub fn new(origin: Arc<ScopeNode>, cause: anyhow::Error) -> Self {
        Self { origin, cause }
    }

    /// Scope in which the error was raised.
    pub fn origin(&self) -> &Arc<ScopeNode> {
        &self.origin
    }

    /// The original error.
    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }

    /// Discard the origin and return the original error.
    pub fn into_cause(self) -> anyhow::Error {
        self.cause
    }
}

impl std::fmt::Debug for ScopedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedError")
            .field("origin", &self.origin.full_execution_label())
            .field("cause", &self.cause)
            .finish()
    }
}

impl std::fmt::Display for ScopedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.cause, f)
    }
}

impl std::error::Error for ScopedError {}

/// Returns true if `err` is, or wraps, an [`EngineError::Aborted`].
pub fn is_aborted(err: &anyhow::Error) -> bool {
    let err = match err.downcast_ref::<ScopedError>() {
        Some(scoped) => scoped.cause(),
        None => err,
    };
    err.chain()
        .any(|e| matches!(e.downcast_ref::<EngineError>(), Some(EngineError::Aborted)))
}

/// Strip a [`ScopedError`] wrapper, if present.
pub fn unwrap_scoped(err: anyhow::Error) -> anyhow::Error {
    match err.downcast::<ScopedError>() {
        Ok(scoped) => scoped.into_cause(),
        Err(err) => err,
    }
}
