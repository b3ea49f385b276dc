//! Timers owned by a scope.
//!
//! A timer belongs to the nearest named scope of the caller (executor
//! branches are skipped). It is cleared when that scope exits or fails, and
//! never fires once the run is cancelled. Callbacks run inside the scope
//! that created the timer.

use std::sync::Arc;
use std::time::Duration;

use harvester_core::{context, EngineError, Feature, FeatureId, ScopeKind, ScopeNode};
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

/// Local: timers registered on a scope.
const TIMERS_VAR: &str = "timer.handles";

/// Handle of a scheduled timer.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    abort: AbortHandle,
}

impl TimerHandle {
    /// Stop the timer; a pending callback never runs.
    pub fn clear(&self) {
        self.abort.abort();
    }

    /// Has the timer fired (timeouts), been cleared, or been cancelled?
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

#[derive(Default)]
struct ScopeTimers {
    handles: Mutex<Vec<AbortHandle>>,
}

impl ScopeTimers {
    fn track(&self, handle: AbortHandle) {
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    fn clear(&self) -> usize {
        let handles: Vec<AbortHandle> = self.handles.lock().drain(..).collect();
        let pending = handles.iter().filter(|h| !h.is_finished()).count();
        for handle in handles {
            handle.abort();
        }
        pending
    }
}

/// Scope-bound timeouts and intervals.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimerFeature;

impl TimerFeature {
    /// Feature id.
    pub const ID: FeatureId = "timer";

    /// Call `f` once after `delay`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn set_timeout<F>(scope: &Arc<ScopeNode>, delay: Duration, f: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let cancel = scope.root().cancel_signal().clone();
        let current = scope.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => context::run(current, async move { f() }).await,
            }
        });
        Self::track(scope, task.abort_handle())
    }

    /// Call `f` every `period`, first after one period.
    ///
    /// Fails with [`EngineError::InvalidConfig`] for a zero period.
    pub fn set_interval<F>(
        scope: &Arc<ScopeNode>,
        period: Duration,
        mut f: F,
    ) -> harvester_core::Result<TimerHandle>
    where
        F: FnMut() + Send + 'static,
    {
        if period.is_zero() {
            return Err(EngineError::InvalidConfig(
                "timer interval must be greater than zero".to_string(),
            ));
        }
        let cancel = scope.root().cancel_signal().clone();
        let current = scope.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => context::run(current.clone(), async { f() }).await,
                }
            }
        });
        Ok(Self::track(scope, task.abort_handle()))
    }

    /// Clear every timer owned by `scope`; returns how many were pending.
    pub fn clear_scope(scope: &Arc<ScopeNode>) -> usize {
        let cleared = timers(&owner(scope)).clear();
        if cleared > 0 {
            debug!(scope = %scope.full_execution_label(), cleared, "timers cleared");
        }
        cleared
    }

    fn track(scope: &Arc<ScopeNode>, handle: AbortHandle) -> TimerHandle {
        timers(&owner(scope)).track(handle.clone());
        TimerHandle { abort: handle }
    }
}

/// Nearest scope that is not an executor branch.
fn owner(scope: &Arc<ScopeNode>) -> Arc<ScopeNode> {
    let mut node = scope;
    while node.kind() == ScopeKind::Iteration {
        match node.parent() {
            Some(parent) => node = parent,
            None => break,
        }
    }
    node.clone()
}

fn timers(scope: &ScopeNode) -> Arc<ScopeTimers> {
    scope.local_or_insert_with(TIMERS_VAR, ScopeTimers::default)
}

impl Feature for TimerFeature {
    fn id(&self) -> FeatureId {
        Self::ID
    }

    fn on_scope_exit(&self, scope: &Arc<ScopeNode>) {
        Self::clear_scope(scope);
    }

    fn on_scope_error(&self, scope: &Arc<ScopeNode>, _origin: &Arc<ScopeNode>, _cause: &anyhow::Error) {
        Self::clear_scope(scope);
    }
}
