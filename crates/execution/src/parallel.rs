//! Bounded-concurrency executor.
//!
//! A [`Parallel`] is bound to the scope it was created in. Every item runs
//! in its own iteration branch of that scope, so nested scopes, executors
//! and checkpoints created by the item compose under the item's id.
//!
//! Items are started in input order with at most `limit` in flight, all
//! polled on the caller's task. Before each item the run's cancellation is
//! checked; finished items from a previous run are skipped. On the first
//! failure or cancellation no new item is started, in-flight items run to
//! completion, and the first error is returned.

use std::future::Future;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use harvester_core::{context, EngineError, FeatureId, ScopeNode};
use serde::Serialize;
use tracing::debug;

use crate::checkpoint::{CheckpointContainer, CheckpointFeature, CHECKPOINT_ID_VAR};
use crate::progress::{LoopTracker, ProgressFeature, TrackerOptions};

/// Feature bag holding executor defaults of a run.
pub(crate) const PARALLEL_CONFIG: FeatureId = "parallel";
pub(crate) const DEFAULT_LIMIT_VAR: &str = "default_limit";

/// What an unbounded loop should do after an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Go on with the next index
    Continue,
    /// Stop the loop; the current item is not checkpointed
    Stop,
    /// Go on; the loop ends before this index
    UpperBound(i64),
}

impl From<bool> for Step {
    fn from(proceed: bool) -> Self {
        if proceed {
            Step::Continue
        } else {
            Step::Stop
        }
    }
}

impl From<i64> for Step {
    fn from(max: i64) -> Self {
        Step::UpperBound(max)
    }
}

/// Executor driving loops inside one scope.
#[derive(Debug)]
pub struct Parallel {
    scope: Arc<ScopeNode>,
    container: CheckpointContainer,
    limit: usize,
}

impl Parallel {
    /// Executor bound to `scope`, with the run's default limit.
    pub fn new(scope: &Arc<ScopeNode>) -> Self {
        let limit = scope
            .feature_config(PARALLEL_CONFIG)
            .get_var::<usize>(DEFAULT_LIMIT_VAR)
            .map(|limit| *limit)
            .filter(|limit| *limit >= 1)
            .unwrap_or(1);
        Self {
            scope: scope.clone(),
            container: CheckpointFeature::container(scope),
            limit,
        }
    }

    /// Executor bound to the current scope.
    pub fn current() -> harvester_core::Result<Self> {
        Ok(Self::new(&context::current()?))
    }

    /// Set the maximum number of items in flight.
    pub fn set_limit(&mut self, limit: usize) -> harvester_core::Result<&mut Self> {
        if limit < 1 {
            return Err(EngineError::InvalidLimit(limit));
        }
        self.limit = limit;
        Ok(self)
    }

    /// Builder form of [`Parallel::set_limit`].
    pub fn with_limit(mut self, limit: usize) -> harvester_core::Result<Self> {
        self.set_limit(limit)?;
        Ok(self)
    }

    /// Maximum number of items in flight.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Checkpoint id of this executor.
    pub fn checkpoint_id(&self) -> &str {
        self.container.id()
    }

    /// Scope the executor is bound to.
    pub fn scope(&self) -> &Arc<ScopeNode> {
        &self.scope
    }

    /// Run `f` once per element of `items`.
    pub async fn for_each<T, I, F, Fut>(&self, items: I, f: F) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Serialize,
        F: Fn(T) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let items: Vec<T> = items.into_iter().collect();
        let progress = self.tracker(0, Some(items.len() as i64));
        let result = self.dispatch(items, &progress, &f).await;
        progress.tracker.finish();
        result
    }

    /// Run `f(i)` for every `i` in `start..end`. An empty or reversed range
    /// runs nothing.
    pub async fn for_range<F, Fut>(&self, start: i64, end: i64, f: F) -> anyhow::Result<()>
    where
        F: Fn(i64) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let progress = self.tracker(start, Some(end.max(start)));
        let result = self.dispatch(start..end, &progress, &f).await;
        progress.tracker.finish();
        result
    }

    /// Run `f(i)` for `i = start, start + 1, ...` one at a time until it
    /// returns `false`.
    ///
    /// Returning an integer reports the loop's upper bound for progress and
    /// continues. The bound is checkpointed so a resumed loop knows it from
    /// the start. Items finished in a previous run are skipped as continuing.
    pub async fn count_while<F, Fut, S>(&self, start: i64, f: F) -> anyhow::Result<()>
    where
        F: Fn(i64) -> Fut,
        Fut: Future<Output = anyhow::Result<S>>,
        S: Into<Step>,
    {
        let progress = self.tracker(start, self.container.upper_bound());
        let result = self.count(start, &progress, &f).await;
        progress.tracker.finish();
        result
    }

    fn tracker(&self, start: i64, max: Option<i64>) -> LoopTracker {
        ProgressFeature::create_for_loop(
            &self.scope,
            TrackerOptions {
                name: None,
                start,
                max,
            },
        )
    }

    /// Checks cancellation and the finished set; `None` means skip.
    fn prepare<T: Serialize + ?Sized>(
        &self,
        item: &T,
        progress: &LoopTracker,
    ) -> anyhow::Result<Option<(String, Arc<ScopeNode>)>> {
        self.scope.root().cancel_signal().check()?;
        let item_id = self.container.item_id(item)?;
        if self.container.is_finished(&item_id) {
            debug!(checkpoint = %item_id, "already finished, skipping");
            return Ok(None);
        }
        let branch = self.scope.iteration();
        branch.set(CHECKPOINT_ID_VAR, item_id.clone());
        progress.adopt(&branch);
        Ok(Some((item_id, branch)))
    }

    async fn dispatch<T, I, F, Fut>(
        &self,
        items: I,
        progress: &LoopTracker,
        f: &F,
    ) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Serialize,
        F: Fn(T) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let tracker = &progress.tracker;
        let mut pending = items.into_iter();
        let mut in_flight = FuturesUnordered::new();
        let mut failure: Option<anyhow::Error> = None;

        loop {
            while failure.is_none() && in_flight.len() < self.limit {
                let Some(item) = pending.next() else {
                    break;
                };
                match self.prepare(&item, progress) {
                    Err(err) => failure = Some(err),
                    Ok(None) => tracker.increase(1),
                    Ok(Some((item_id, branch))) => in_flight.push(async move {
                        let result = context::run(branch.clone(), async move { f(item).await }).await;
                        (item_id, branch, result)
                    }),
                }
            }

            let Some((item_id, branch, result)) = in_flight.next().await else {
                break;
            };
            match result {
                Ok(()) => {
                    self.container.mark_finished(&item_id, &branch);
                    tracker.increase(1);
                }
                Err(err) => {
                    debug!(checkpoint = %item_id, error = %err, "item failed");
                    if failure.is_none() {
                        failure = Some(err);
                    }
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn count<F, Fut, S>(&self, start: i64, progress: &LoopTracker, f: &F) -> anyhow::Result<()>
    where
        F: Fn(i64) -> Fut,
        Fut: Future<Output = anyhow::Result<S>>,
        S: Into<Step>,
    {
        let tracker = &progress.tracker;
        let mut index = start;
        loop {
            let Some((item_id, branch)) = self.prepare(&index, progress)? else {
                tracker.increase(1);
                index += 1;
                continue;
            };

            let step: Step = context::run(branch.clone(), async { f(index).await })
                .await?
                .into();
            match step {
                Step::Stop => return Ok(()),
                Step::Continue => {}
                Step::UpperBound(max) => {
                    self.container.set_upper_bound(max, &branch);
                    tracker.set_max(max);
                }
            }
            self.container.mark_finished(&item_id, &branch);
            tracker.increase(1);
            index += 1;
        }
    }
}
