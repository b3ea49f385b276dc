//! Execution layer - checkpointed, bounded-concurrency loops and the run lifecycle.
//!
//! A [`RunController`] owns one run: it builds the root scope, registers the
//! default features, restores checkpoints, runs the entrypoint inside the
//! root scope and persists checkpoints when the run settles. Inside the run,
//! [`Parallel`] drives loops whose items are skipped when a previous run
//! already finished them, and [`TimerFeature`] schedules callbacks that die
//! with the scope that created them.

#![warn(missing_docs)]

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod metrics;
pub mod pages;
pub mod parallel;
pub mod progress;
pub mod run;
pub mod timer;

pub use checkpoint::{CheckpointContainer, CheckpointFeature, CheckpointStore};
pub use config::RunConfig;
pub use data::{DataFeature, DataItem};
pub use metrics::{MetricsBoard, MetricsFeature, MetricsReport, ScopeMetrics, TimingStats};
pub use pages::{find_page_count, find_page_count_in, PageRange};
pub use parallel::{Parallel, Step};
pub use progress::{ProgressBoard, ProgressFeature, TrackerOptions};
pub use run::{RunController, RunStatus};
pub use timer::{TimerFeature, TimerHandle};
