//! Per-scope execution timings.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use harvester_core::{Feature, FeatureId, RootScope, ScopeNode};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;

const FINALIZED_VAR: &str = "metrics.finalized";

#[derive(Default)]
struct ScopeSamples {
    executions: usize,
    durations: Vec<Duration>,
}

/// Timings collected for a run, keyed by scope full name.
#[derive(Default)]
pub struct MetricsBoard {
    scopes: Mutex<IndexMap<String, ScopeSamples>>,
}

impl MetricsBoard {
    fn entered(&self, scope: &ScopeNode) {
        self.scopes
            .lock()
            .entry(scope.full_name().to_string())
            .or_default()
            .executions += 1;
    }

    fn finalized(&self, scope: &ScopeNode) {
        let already = scope
            .local_or_insert_with(FINALIZED_VAR, || AtomicBool::new(false))
            .swap(true, Ordering::SeqCst);
        if already {
            return;
        }
        let duration = scope.timing().map(|t| t.duration).unwrap_or_else(|| scope.elapsed());
        self.scopes
            .lock()
            .entry(scope.full_name().to_string())
            .or_default()
            .durations
            .push(duration);
    }

    /// Snapshot of scopes with at least one finished execution.
    pub fn report(&self) -> MetricsReport {
        let scopes = self
            .scopes
            .lock()
            .iter()
            .filter_map(|(name, samples)| {
                let min = samples.durations.iter().min()?;
                let max = samples.durations.iter().max()?;
                let total: Duration = samples.durations.iter().sum();
                let average = total / samples.durations.len() as u32;
                Some((
                    name.clone(),
                    ScopeMetrics {
                        executions: samples.executions,
                        timing: TimingStats {
                            min_ms: as_millis(*min),
                            max_ms: as_millis(*max),
                            average_ms: as_millis(average),
                        },
                    },
                ))
            })
            .collect();
        MetricsReport { scopes }
    }
}

fn as_millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Timings of every measured scope.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsReport {
    /// Metrics by scope full name, in first-seen order
    pub scopes: IndexMap<String, ScopeMetrics>,
}

/// Metrics of one scope full name.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeMetrics {
    /// Number of times the scope was entered
    pub executions: usize,
    /// Durations of finished executions
    pub timing: TimingStats,
}

/// Duration statistics in milliseconds.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TimingStats {
    /// Fastest execution
    pub min_ms: f64,
    /// Slowest execution
    pub max_ms: f64,
    /// Mean execution time
    pub average_ms: f64,
}

/// Measures how often and how long every scope runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsFeature;

impl MetricsFeature {
    /// Feature id.
    pub const ID: FeatureId = "metrics";

    /// Collected timings of the run.
    pub fn board(root: &RootScope) -> Arc<MetricsBoard> {
        root.feature_context(Self::ID, MetricsBoard::default)
    }

    /// Report of the run so far.
    pub fn report(root: &RootScope) -> MetricsReport {
        Self::board(root).report()
    }
}

impl Feature for MetricsFeature {
    fn id(&self) -> FeatureId {
        Self::ID
    }

    fn on_root_scope_enter(&self, root: &Arc<ScopeNode>) {
        Self::board(root.root()).entered(root);
    }

    fn on_scope_enter(&self, scope: &Arc<ScopeNode>) {
        Self::board(scope.root()).entered(scope);
    }

    fn on_scope_exit(&self, scope: &Arc<ScopeNode>) {
        Self::board(scope.root()).finalized(scope);
    }

    fn on_scope_error(&self, scope: &Arc<ScopeNode>, _origin: &Arc<ScopeNode>, _cause: &anyhow::Error) {
        Self::board(scope.root()).finalized(scope);
    }
}
