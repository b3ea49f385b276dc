//! Progress tracker: a counter with derived statistics.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

/// Called after every change of a tracker, with the updated tracker.
pub type UpdateCallback = Arc<dyn Fn(&ProgressTracker) + Send + Sync>;

/// Counts processed items of a loop, from `start` towards an optional `max`.
pub struct ProgressTracker {
    name: Option<String>,
    start: i64,
    started: Instant,
    state: Mutex<TrackerState>,
    on_update: Option<UpdateCallback>,
}

#[derive(Debug, Clone, Copy)]
struct TrackerState {
    current: i64,
    max: Option<i64>,
    finished: bool,
}

/// Point-in-time statistics of a tracker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressStatus {
    /// Display name of the tracker
    pub name: Option<String>,
    /// Initial counter value
    pub start: i64,
    /// Current counter value
    pub current: i64,
    /// Upper bound, if known
    pub max: Option<i64>,
    /// Has the tracked loop completed?
    pub finished: bool,
    /// Seconds since the tracker was created
    pub elapsed_secs: f64,
    /// Completed fraction in `[0, 1]` for bounded loops
    pub percentage: Option<f64>,
    /// Estimated seconds remaining
    pub eta_secs: Option<f64>,
    /// Processed items per second
    pub rate: f64,
}

impl ProgressTracker {
    /// Create a tracker with `current = start`.
    pub fn new(start: i64, max: Option<i64>) -> Self {
        Self {
            name: None,
            start,
            started: Instant::now(),
            state: Mutex::new(TrackerState {
                current: start,
                max,
                finished: false,
            }),
            on_update: None,
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the update callback.
    pub fn with_on_update(mut self, f: impl Fn(&ProgressTracker) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Arc::new(f));
        self
    }

    /// Display name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Initial counter value.
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Current counter value.
    pub fn current(&self) -> i64 {
        self.state.lock().current
    }

    /// Upper bound, if known.
    pub fn max(&self) -> Option<i64> {
        self.state.lock().max
    }

    /// Has [`ProgressTracker::finish`] been called?
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Advance the counter by `delta` and notify.
    pub fn increase(&self, delta: i64) {
        self.state.lock().current += delta;
        self.notify();
    }

    /// Update the upper bound and notify.
    pub fn set_max(&self, max: i64) {
        self.state.lock().max = Some(max);
        self.notify();
    }

    /// Mark the tracked loop completed. Notifies on the first call only.
    pub fn finish(&self) {
        {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
        }
        self.notify();
    }

    /// Derived statistics as of now.
    pub fn status(&self) -> ProgressStatus {
        self.status_at(self.started.elapsed())
    }

    fn status_at(&self, elapsed: Duration) -> ProgressStatus {
        let state = *self.state.lock();
        let elapsed_secs = elapsed.as_secs_f64();
        let done = (state.current - self.start) as f64;

        let percentage = state
            .max
            .map(|max| max - self.start)
            .filter(|total| *total != 0)
            .map(|total| done / total as f64);
        let eta_secs = percentage
            .filter(|p| *p != 0.0)
            .map(|p| elapsed_secs / p * (1.0 - p));
        let rate = if elapsed_secs > 0.0 {
            done / elapsed_secs
        } else {
            0.0
        };

        ProgressStatus {
            name: self.name.clone(),
            start: self.start,
            current: state.current,
            max: state.max,
            finished: state.finished,
            elapsed_secs,
            percentage,
            eta_secs,
            rate,
        }
    }

    fn notify(&self) {
        if let Some(on_update) = &self.on_update {
            on_update(self);
        }
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = *self.state.lock();
        f.debug_struct("ProgressTracker")
            .field("name", &self.name)
            .field("start", &self.start)
            .field("current", &state.current)
            .field("max", &state.max)
            .field("finished", &state.finished)
            .finish()
    }
}
