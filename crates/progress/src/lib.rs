//! Progress tracking
//!
//! Loop counters with derived statistics, the tree that mirrors their
//! nesting, and text rendering for logs and terminals.

#![warn(missing_docs)]

pub mod render;
pub mod tracker;
pub mod tree;

pub use render::{format_clock, render_bar, render_tree, BAR_WIDTH};
pub use tracker::{ProgressStatus, ProgressTracker, UpdateCallback};
pub use tree::{NodeId, ScopeTree, TreeNode};
