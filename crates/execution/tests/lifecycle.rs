//! Run lifecycle, cancellation timing and a full nested run.

use std::sync::Arc;
use std::time::Duration;

use harvester_core::{context, is_aborted, FeatureRegistry, ScopeNode, ScopeParam};
use harvester_execution::{
    DataFeature, DataItem, Parallel, RunConfig, RunController, RunStatus, TimerFeature,
};
use harvester_progress::ProgressStatus;
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::Instant;

fn slow_run() -> RunController<()> {
    RunController::new(RunConfig::default(), FeatureRegistry::new(), || async {
        Parallel::current()?
            .for_range(0, 1, |_| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok(())
            })
            .await
    })
}

/// Cancel `run` 100ms after it starts; returns the cancel result and when
/// `cancel` resolved, relative to the start.
async fn cancel_after_start(
    run: &RunController<()>,
    timeout: Option<Duration>,
) -> (anyhow::Result<()>, bool, Duration) {
    let started = Instant::now();
    let (result, (settled, at)) = tokio::join!(run.start(), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let settled = run.cancel(timeout).await.unwrap();
        (settled, started.elapsed())
    });
    (result, settled, at)
}

#[tokio::test(start_paused = true)]
async fn test_cancel_zero_does_not_wait() {
    let run = slow_run();
    let (result, settled, at) = cancel_after_start(&run, Some(Duration::ZERO)).await;
    assert!(settled);
    assert_eq!(at, Duration::from_millis(100));
    assert!(result.is_ok());
    assert_eq!(run.status(), RunStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_without_timeout_waits_for_settle() {
    let run = slow_run();
    let (_, settled, at) = cancel_after_start(&run, None).await;
    assert!(settled);
    assert_eq!(at, Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_timeout_expires() {
    let run = slow_run();
    let (_, settled, at) = cancel_after_start(&run, Some(Duration::from_millis(500))).await;
    assert!(!settled);
    assert_eq!(at, Duration::from_millis(600));
    assert_eq!(run.status(), RunStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_settle_during_cancel_keeps_cancelled_and_skips_hooks() {
    let fired = Arc::new(Mutex::new(Vec::new()));
    let (finished, errored, cancelled) = (fired.clone(), fired.clone(), fired.clone());
    let run = RunController::new(RunConfig::default(), FeatureRegistry::new(), || async {
        Parallel::current()?
            .for_range(0, 3, |_| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await
    })
    .on_finished(move || finished.lock().push("finished"))
    .on_errored(move |_| errored.lock().push("errored"))
    .on_cancelled(move || cancelled.lock().push("cancelled"));

    let (result, _, _) = cancel_after_start(&run, None).await;
    assert!(is_aborted(&result.unwrap_err()));
    assert_eq!(run.status(), RunStatus::Cancelled);
    assert_eq!(*fired.lock(), vec!["cancelled"]);
    assert_eq!(run.checkpoints(), vec!["ROOT[0][0]"]);
}

#[tokio::test]
async fn test_end_to_end_loop() {
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = statuses.clone();
    let updates = Arc::new(Mutex::new(Vec::new()));
    let update_sink = updates.clone();
    let finished = Arc::new(Mutex::new(false));
    let finished_flag = finished.clone();

    let run = RunController::new(RunConfig::default(), FeatureRegistry::new(), || async {
        let crawl = context::wrap_with_scope("loop", vec![], |_: ()| async {
            Parallel::current()?
                .for_each(["a", "b", "c"], |_| async { Ok(()) })
                .await
        });
        crawl.call(()).await
    })
    .on_progress(move |status: &ProgressStatus, _: &Arc<ScopeNode>| sink.lock().push(status.clone()))
    .on_checkpoint_update(move |list| update_sink.lock().push(list.to_vec()))
    .on_finished(move || *finished_flag.lock() = true);

    run.start().await.unwrap();

    assert_eq!(run.status(), RunStatus::Finished);
    assert!(*finished.lock());
    assert_eq!(
        run.checkpoints(),
        vec![r#"loop[0]["a"]"#, r#"loop[0]["b"]"#, r#"loop[0]["c"]"#]
    );
    assert_eq!(updates.lock().len(), 3);

    let last = statuses.lock().last().cloned().unwrap();
    assert_eq!(last.name.as_deref(), Some("loop()[0]"));
    assert_eq!((last.current, last.max, last.finished), (3, Some(3), true));
    assert!(run.progress().live().is_empty());

    let metrics = run.metrics();
    assert_eq!(metrics.scopes["ROOT.loop"].executions, 1);
    assert_eq!(metrics.scopes["ROOT"].executions, 1);
}

#[tokio::test]
async fn test_nested_scopes_report_data_and_labels() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let config = RunConfig::new("shop").with_default_limit(2);

    let run = RunController::new(config, FeatureRegistry::new(), || async {
        let page = Arc::new(context::wrap_with_scope(
            "page",
            vec![ScopeParam::new(0, "category"), ScopeParam::new(1, "number")],
            |(category, number): (String, i64)| async move {
                let scope = context::current()?;
                DataFeature::report_data(
                    &scope,
                    "product",
                    &json!({ "label": scope.full_execution_label(), "category": category, "page": number }),
                )?;
                Ok(())
            },
        ));

        let parallel = Parallel::current()?;
        assert_eq!(parallel.limit(), 2);
        parallel
            .for_each(vec!["books".to_string()], |category| {
                let page = page.clone();
                async move {
                    Parallel::current()?
                        .for_range(1, 3, |number| {
                            let page = page.clone();
                            let category = category.clone();
                            async move { page.call((category, number)).await }
                        })
                        .await
                }
            })
            .await
    })
    .on_data_received(move |item: &DataItem| sink.lock().push(item.clone()));

    run.start().await.unwrap();

    let mut labels: Vec<String> = received
        .lock()
        .iter()
        .map(|item| item.data["label"].as_str().unwrap_or_default().to_string())
        .collect();
    labels.sort();
    assert_eq!(
        labels,
        vec![
            r#"shop.page(category="books",number=1)"#,
            r#"shop.page(category="books",number=2)"#,
        ]
    );
    assert_eq!(run.checkpoints(), vec![r#"shop[0]["books"]"#]);
}

#[tokio::test(start_paused = true)]
async fn test_timers_die_with_their_scope() {
    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink = fired.clone();

    let run = RunController::new(RunConfig::default(), FeatureRegistry::new(), move || async move {
        let page_sink = sink.clone();
        let page = context::wrap_with_scope("page", vec![], move |_: ()| {
            let sink = page_sink.clone();
            async move {
                let scope = context::current()?;
                TimerFeature::set_timeout(&scope, Duration::from_millis(500), move || {
                    sink.lock().push("page")
                });
                Ok(())
            }
        });
        page.call(()).await?;

        let root = context::current()?;
        let root_sink = sink.clone();
        TimerFeature::set_timeout(&root, Duration::from_millis(500), move || {
            root_sink.lock().push("root")
        });
        TimerFeature::set_timeout(&root, Duration::from_secs(5), move || sink.lock().push("late"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(())
    });

    run.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(*fired.lock(), vec!["root"]);
}
