//! Run lifecycle: start, settle, cancel.
//!
//! ```text
//! initial -> running -> finished | errored
//!                    -> cancelling -> cancelled
//! ```
//!
//! A settle that happens while cancelling never overwrites the cancelled
//! state; [`RunController::start`] still returns the run's own result.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use harvester_core::{
    context, is_aborted, unwrap_scoped, EngineError, FeatureRegistry, RootScope, RunId, ScopeNode,
    ScopedError,
};
use harvester_progress::ProgressStatus;
use harvester_storage::{CheckpointStorage, JsonCheckpointFile};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointFeature;
use crate::config::RunConfig;
use crate::data::{DataFeature, DataItem};
use crate::metrics::{MetricsFeature, MetricsReport};
use crate::parallel::{DEFAULT_LIMIT_VAR, PARALLEL_CONFIG};
use crate::progress::{ProgressBoard, ProgressFeature};
use crate::timer::TimerFeature;

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Created, not started
    Initial,
    /// Entrypoint executing
    Running,
    /// Entrypoint returned successfully
    Finished,
    /// Entrypoint failed
    Errored,
    /// Cancellation signalled, waiting for the run to settle
    Cancelling,
    /// Cancellation completed or timed out
    Cancelled,
}

impl RunStatus {
    fn as_str(self) -> &'static str {
        match self {
            RunStatus::Initial => "initial",
            RunStatus::Running => "running",
            RunStatus::Finished => "finished",
            RunStatus::Errored => "errored",
            RunStatus::Cancelling => "cancelling",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type Entrypoint<R> = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<R>> + Send>;
type Hook = Box<dyn Fn() + Send + Sync>;
type ErrorHook = Box<dyn Fn(&anyhow::Error) + Send + Sync>;

/// Owns one run of an entrypoint: its root scope, features, persistence
/// and lifecycle.
pub struct RunController<R> {
    config: RunConfig,
    root: Arc<ScopeNode>,
    status: Mutex<RunStatus>,
    settled: watch::Sender<bool>,
    entrypoint: Mutex<Option<Entrypoint<R>>>,
    storage: Option<Arc<dyn CheckpointStorage>>,
    on_finished: Option<Hook>,
    on_cancelled: Option<Hook>,
    on_errored: Option<ErrorHook>,
}

impl<R: Send + 'static> RunController<R> {
    /// Create a run of `entrypoint`.
    ///
    /// The data, checkpoint, progress, metrics and timer features are added to
    /// `features` unless already registered.
    pub fn new<F, Fut>(config: RunConfig, mut features: FeatureRegistry, entrypoint: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        features.register_default(DataFeature);
        features.register_default(CheckpointFeature);
        features.register_default(ProgressFeature);
        features.register_default(MetricsFeature);
        features.register_default(TimerFeature);

        let root = ScopeNode::root_with(
            config.name.clone(),
            Arc::new(RootScope::new(config.name.clone(), features)),
        );
        root.feature_config(PARALLEL_CONFIG)
            .set_var(DEFAULT_LIMIT_VAR, config.default_limit);

        let storage = config
            .checkpoint_file
            .as_ref()
            .map(|path| Arc::new(JsonCheckpointFile::new(path)) as Arc<dyn CheckpointStorage>);
        let (settled, _) = watch::channel(false);
        let entrypoint: Entrypoint<R> = Box::new(move || entrypoint().boxed());

        Self {
            config,
            root,
            status: Mutex::new(RunStatus::Initial),
            settled,
            entrypoint: Mutex::new(Some(entrypoint)),
            storage,
            on_finished: None,
            on_cancelled: None,
            on_errored: None,
        }
    }

    /// Restore from and save to `storage` instead of the configured file.
    pub fn with_checkpoint_storage(mut self, storage: impl CheckpointStorage + 'static) -> Self {
        self.storage = Some(Arc::new(storage));
        self
    }

    /// Seed the finished set before the entrypoint runs.
    pub fn restore_checkpoints(self, checkpoints: Vec<String>) -> Self {
        CheckpointFeature::restore(self.root.root(), checkpoints);
        self
    }

    /// Called when the run finishes successfully.
    pub fn on_finished(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_finished = Some(Box::new(f));
        self
    }

    /// Called once a cancellation completes or times out.
    pub fn on_cancelled(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_cancelled = Some(Box::new(f));
        self
    }

    /// Called with the unwrapped cause when the run fails.
    pub fn on_errored(mut self, f: impl Fn(&anyhow::Error) + Send + Sync + 'static) -> Self {
        self.on_errored = Some(Box::new(f));
        self
    }

    /// Called for every data item reported by the run.
    pub fn on_data_received(self, f: impl Fn(&DataItem) + Send + Sync + 'static) -> Self {
        DataFeature::on_data_received(self.root.root(), move |item: &DataItem, _: &Arc<ScopeNode>| f(item));
        self
    }

    /// Called with the finished list after every checkpoint change.
    pub fn on_checkpoint_update(self, f: impl Fn(&[String]) + Send + Sync + 'static) -> Self {
        CheckpointFeature::on_checkpoint_update(self.root.root(), f);
        self
    }

    /// Called on every tracker update.
    pub fn on_progress(
        self,
        f: impl Fn(&ProgressStatus, &Arc<ScopeNode>) + Send + Sync + 'static,
    ) -> Self {
        ProgressFeature::on_progress(self.root.root(), f);
        self
    }

    /// Current lifecycle state.
    pub fn status(&self) -> RunStatus {
        *self.status.lock()
    }

    /// Root scope of the run.
    pub fn root(&self) -> &Arc<ScopeNode> {
        &self.root
    }

    /// Id of the run.
    pub fn run_id(&self) -> RunId {
        self.root.root().run_id()
    }

    /// Configuration the run was created with.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Finished checkpoint ids so far.
    pub fn checkpoints(&self) -> Vec<String> {
        CheckpointFeature::checkpoints(self.root.root())
    }

    /// Live progress trackers.
    pub fn progress(&self) -> Arc<ProgressBoard> {
        ProgressFeature::board(self.root.root())
    }

    /// Scope timings so far.
    pub fn metrics(&self) -> MetricsReport {
        MetricsFeature::report(self.root.root())
    }

    /// Run the entrypoint to completion.
    ///
    /// Fails with [`EngineError::InvalidState`] unless the run is still
    /// initial. A failure of the entrypoint is returned without its
    /// [`ScopedError`] wrapper.
    pub async fn start(&self) -> anyhow::Result<R> {
        self.config.validate()?;
        self.transition("start", RunStatus::Initial, RunStatus::Running)?;
        let _settle = SettleGuard {
            status: &self.status,
            settled: &self.settled,
        };
        let entrypoint = self.entrypoint.lock().take().ok_or(EngineError::InvalidState {
            operation: "start",
            expected: RunStatus::Initial.as_str(),
            current: RunStatus::Running.to_string(),
        })?;

        info!("Starting run {} ({})", self.config.name, self.run_id());
        let result = self.execute(entrypoint).await;

        let settled = {
            let mut status = self.status.lock();
            match *status {
                RunStatus::Cancelling | RunStatus::Cancelled => None,
                _ => {
                    *status = if result.is_ok() {
                        RunStatus::Finished
                    } else {
                        RunStatus::Errored
                    };
                    Some(*status)
                }
            }
        };

        match (&result, settled) {
            (_, None) => info!("Run {} settled after cancellation", self.run_id()),
            (Ok(_), Some(_)) => {
                info!("Run {} finished", self.run_id());
                if let Some(hook) = &self.on_finished {
                    hook();
                }
            }
            (Err(err), Some(_)) => {
                if is_aborted(err) {
                    info!("Run {} aborted", self.run_id());
                } else {
                    error!(error = %err, "Run {} failed", self.run_id());
                }
                if let Some(hook) = &self.on_errored {
                    hook(err);
                }
            }
        }

        result
    }

    /// Signal cancellation and wait for the run to settle.
    ///
    /// `Some(Duration::ZERO)` returns `true` without waiting, `None` waits
    /// for the run to settle, any other timeout returns whether the run
    /// settled in time. The run ends up cancelled in every case.
    pub async fn cancel(&self, timeout: Option<Duration>) -> harvester_core::Result<bool> {
        self.transition("cancel", RunStatus::Running, RunStatus::Cancelling)?;
        info!("Cancelling run {}", self.run_id());
        self.root.root().cancel_signal().cancel();

        let settled = match timeout {
            Some(timeout) if timeout.is_zero() => true,
            None => {
                self.wait_settled().await;
                true
            }
            Some(timeout) => tokio::time::timeout(timeout, self.wait_settled())
                .await
                .is_ok(),
        };
        if !settled {
            warn!(
                timeout_ms = timeout.map(|t| t.as_millis() as u64).unwrap_or_default(),
                "Run {} did not settle before the cancel timeout",
                self.run_id()
            );
        }

        *self.status.lock() = RunStatus::Cancelled;
        if let Some(hook) = &self.on_cancelled {
            hook();
        }
        Ok(settled)
    }

    fn transition(
        &self,
        operation: &'static str,
        from: RunStatus,
        to: RunStatus,
    ) -> harvester_core::Result<()> {
        let mut status = self.status.lock();
        if *status != from {
            return Err(EngineError::InvalidState {
                operation,
                expected: from.as_str(),
                current: status.to_string(),
            });
        }
        *status = to;
        Ok(())
    }

    /// Resolves once `start` has returned or its future was dropped.
    async fn wait_settled(&self) {
        let mut settled = self.settled.subscribe();
        let _ = settled.wait_for(|settled| *settled).await;
    }

    async fn execute(&self, entrypoint: Entrypoint<R>) -> anyhow::Result<R> {
        if let Some(storage) = &self.storage {
            if let Some(checkpoints) = storage.load().await? {
                debug!(count = checkpoints.len(), "loaded checkpoints");
                CheckpointFeature::restore(self.root.root(), checkpoints);
            }
        }

        let ticker = self
            .config
            .progress_log_interval
            .map(|every| tokio::spawn(log_progress(self.root.root().clone(), every)));

        let root = self.root.clone();
        let features = root.root().features();
        let result = context::run(root.clone(), async {
            features.root_scope_entered(&root);
            entrypoint().await
        })
        .await;

        match &result {
            Ok(_) => {
                root.mark_exited();
            }
            Err(err) => match err.downcast_ref::<ScopedError>() {
                Some(scoped) => features.scope_errored(&root, scoped.origin(), scoped.cause()),
                None => features.scope_errored(&root, &root, err),
            },
        }
        features.scope_exited(&root);
        if let Some(ticker) = ticker {
            ticker.abort();
        }

        if let Some(storage) = &self.storage {
            let checkpoints = self.checkpoints();
            match storage.save(&checkpoints).await {
                Ok(()) => debug!(count = checkpoints.len(), "saved checkpoints"),
                Err(err) => error!(error = %err, "Failed to save checkpoints"),
            }
        }

        result.map_err(unwrap_scoped)
    }
}

async fn log_progress(root: Arc<RootScope>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;
        let rendered = ProgressFeature::board(&root).render();
        if !rendered.is_empty() {
            info!("Progress:\n{}", rendered.trim_end());
        }
    }
}

/// Sends the settle signal when `start` ends, also when its future is
/// dropped mid-run. A run abandoned while still running ends up errored.
struct SettleGuard<'a> {
    status: &'a Mutex<RunStatus>,
    settled: &'a watch::Sender<bool>,
}

impl Drop for SettleGuard<'_> {
    fn drop(&mut self) {
        {
            let mut status = self.status.lock();
            if *status == RunStatus::Running {
                warn!("Run dropped before it settled");
                *status = RunStatus::Errored;
            }
        }
        self.settled.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvester_storage::MemoryCheckpointStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_status_display() {
        assert_eq!(RunStatus::Cancelling.to_string(), "cancelling");
        assert_eq!(
            serde_json::to_string(&RunStatus::Errored).unwrap(),
            "\"errored\""
        );
    }

    #[tokio::test]
    async fn test_start_runs_entrypoint_in_root_scope() {
        let run = RunController::new(RunConfig::new("robot"), FeatureRegistry::new(), || async {
            Ok(context::current()?.full_name().to_string())
        });
        assert_eq!(run.status(), RunStatus::Initial);
        assert_eq!(run.start().await.unwrap(), "robot");
        assert_eq!(run.status(), RunStatus::Finished);
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid() {
        let run = RunController::new(RunConfig::default(), FeatureRegistry::new(), || async { Ok(()) });
        run.start().await.unwrap();
        let err = run.start().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::InvalidState { operation: "start", .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_requires_running() {
        let run = RunController::new(RunConfig::default(), FeatureRegistry::new(), || async { Ok(()) });
        assert!(matches!(
            run.cancel(None).await,
            Err(EngineError::InvalidState { operation: "cancel", .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_keeps_run_initial() {
        let config = RunConfig::default().with_default_limit(0);
        let run = RunController::new(config, FeatureRegistry::new(), || async { Ok(()) });
        assert!(run.start().await.is_err());
        assert_eq!(run.status(), RunStatus::Initial);
    }

    #[tokio::test]
    async fn test_failure_calls_on_errored_with_cause() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let run = RunController::new(RunConfig::default(), FeatureRegistry::new(), || async {
            let step = context::wrap_with_scope("step", vec![], |_: ()| async {
                Err::<(), _>(anyhow::anyhow!("broken page"))
            });
            step.call(()).await
        })
        .on_errored(move |err| *sink.lock() = Some(err.to_string()));

        let err = run.start().await.unwrap_err();
        assert!(err.downcast_ref::<ScopedError>().is_none());
        assert_eq!(err.to_string(), "broken page");
        assert_eq!(run.status(), RunStatus::Errored);
        assert_eq!(seen.lock().as_deref(), Some("broken page"));
    }

    #[tokio::test]
    async fn test_storage_round_trip() {
        let storage = MemoryCheckpointStorage::with_checkpoints(vec!["ROOT[0][0]".to_string()]);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let run = RunController::new(RunConfig::default(), FeatureRegistry::new(), move || async move {
            crate::Parallel::current()?
                .for_range(0, 2, |_| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await
        })
        .with_checkpoint_storage(storage.clone());

        run.start().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            storage.load().await.unwrap(),
            Some(vec!["ROOT[0][0]".to_string(), "ROOT[0][1]".to_string()])
        );
    }

    fn sleeping_run() -> RunController<()> {
        RunController::new(RunConfig::default(), FeatureRegistry::new(), || async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(())
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_start_still_settles_cancel() {
        let run = sleeping_run();
        let started = tokio::time::Instant::now();
        let (abandoned, (settled, at)) = tokio::join!(
            tokio::time::timeout(Duration::from_millis(100), run.start()),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let settled = run.cancel(None).await;
                (settled, started.elapsed())
            }
        );

        assert!(abandoned.is_err());
        assert!(settled.unwrap());
        assert_eq!(at, Duration::from_millis(100));
        assert_eq!(run.status(), RunStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_start_marks_run_errored() {
        let run = sleeping_run();
        let abandoned = tokio::time::timeout(Duration::from_millis(100), run.start()).await;
        assert!(abandoned.is_err());
        assert_eq!(run.status(), RunStatus::Errored);
        assert!(run.cancel(None).await.is_err());
    }
}
