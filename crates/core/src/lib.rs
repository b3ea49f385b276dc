//! Harvester core: scope tree and context propagation.
//!
//! This crate defines the execution-context model shared by every other
//! harvester crate: the [`ScopeNode`] tree, the per-run [`RootScope`],
//! the feature registry and the task-local "current scope".

#![warn(missing_docs)]

// Identities
mod id;

// Errors and cancellation
mod cancel;
mod error;

// Scope tree
mod feature;
mod label;
mod scope;

// Propagation
pub mod context;

// Re-exports
pub use id::RunId;

pub use cancel::CancelSignal;
pub use error::{is_aborted, unwrap_scoped, EngineError, Result, ScopedError};

pub use feature::{Feature, FeatureConfig, FeatureId, FeatureRegistry};
pub use label::{execution_label, format_scope_params, ScopeArgs, ScopeParam};
pub use scope::{RootScope, ScopeKind, ScopeNode, ScopeTiming, ScopeValue};

pub use context::{current, run, run_scoped, try_current, wrap_with_scope, ScopedFn};
