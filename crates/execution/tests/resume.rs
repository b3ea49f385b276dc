//! Checkpoint persistence across runs.

use std::sync::Arc;
use std::time::Duration;

use harvester_core::{context, is_aborted, FeatureRegistry};
use harvester_execution::{CheckpointFeature, Parallel, RunConfig, RunController, RunStatus};
use harvester_storage::{CheckpointStorage, JsonCheckpointFile, MemoryCheckpointStorage};
use parking_lot::Mutex;
use tokio::sync::Notify;

type Calls = Arc<Mutex<Vec<i64>>>;

fn range_run(calls: Calls, done: Arc<Notify>) -> RunController<()> {
    RunController::new(RunConfig::default(), FeatureRegistry::new(), move || async move {
        Parallel::current()?
            .for_range(0, 5, |i| {
                let calls = calls.clone();
                let done = done.clone();
                async move {
                    calls.lock().push(i);
                    if i == 1 {
                        done.notify_one();
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    Ok(())
                }
            })
            .await
    })
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_run_resumes_remaining_items() {
    let storage = MemoryCheckpointStorage::new();

    let calls: Calls = Arc::default();
    let done = Arc::new(Notify::new());
    let first = range_run(calls.clone(), done.clone()).with_checkpoint_storage(storage.clone());
    let (result, cancelled) = tokio::join!(first.start(), async {
        done.notified().await;
        first.cancel(None).await
    });

    assert!(is_aborted(&result.unwrap_err()));
    assert!(cancelled.unwrap());
    assert_eq!(first.status(), RunStatus::Cancelled);
    assert_eq!(*calls.lock(), vec![0, 1]);
    assert_eq!(
        storage.load().await.unwrap(),
        Some(vec!["ROOT[0][0]".to_string(), "ROOT[0][1]".to_string()])
    );

    let calls: Calls = Arc::default();
    let second = range_run(calls.clone(), Arc::new(Notify::new()))
        .with_checkpoint_storage(storage.clone());
    second.start().await.unwrap();

    assert_eq!(*calls.lock(), vec![2, 3, 4]);
    assert_eq!(second.status(), RunStatus::Finished);
    assert_eq!(storage.save_count().await, 2);
}

#[tokio::test]
async fn test_checkpoint_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("checkpoints.json");
    let config = RunConfig::new("crawl").with_checkpoint_file(&path);

    let first = RunController::new(config.clone(), FeatureRegistry::new(), || async {
        let categories = context::current()?.child("categories", "");
        Parallel::new(&categories)
            .for_each(["books", "games"], |category| async move {
                if category == "games" {
                    anyhow::bail!("games unavailable");
                }
                Ok(())
            })
            .await
    });
    let err = first.start().await.unwrap_err();
    assert_eq!(err.to_string(), "games unavailable");
    assert_eq!(first.status(), RunStatus::Errored);

    let saved = JsonCheckpointFile::new(&path).load().await.unwrap();
    assert_eq!(saved, Some(vec![r#"categories[0]["books"]"#.to_string()]));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let second = RunController::new(config, FeatureRegistry::new(), move || async move {
        let categories = context::current()?.child("categories", "");
        Parallel::new(&categories)
            .for_each(["books", "games"], |category| {
                let sink = sink.clone();
                async move {
                    sink.lock().push(category);
                    Ok(())
                }
            })
            .await
    });
    second.start().await.unwrap();

    assert_eq!(*seen.lock(), vec!["games"]);
    assert_eq!(
        JsonCheckpointFile::new(&path).load().await.unwrap(),
        Some(vec![
            r#"categories[0]["books"]"#.to_string(),
            r#"categories[0]["games"]"#.to_string(),
        ])
    );
}

#[tokio::test]
async fn test_finishing_a_composite_unit_prunes_its_items() {
    let run = RunController::new(RunConfig::new("A"), FeatureRegistry::new(), || async {
        let root = context::current()?;
        let scope = root.child("B", "");
        let container = CheckpointFeature::container(&scope);
        assert_eq!(container.id(), "B[0]");

        let item = container.item_id("x")?;
        container.mark_finished(&item, &scope);
        assert_eq!(CheckpointFeature::checkpoints(root.root()), vec![item.clone()]);

        container.mark_finished(container.id(), &scope);
        Ok(CheckpointFeature::checkpoints(root.root()))
    });

    assert_eq!(run.start().await.unwrap(), vec!["B[0]".to_string()]);
}

#[tokio::test]
async fn test_restored_checkpoints_reach_on_checkpoint_update() {
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();
    let run = RunController::new(RunConfig::default(), FeatureRegistry::new(), || async {
        Parallel::current()?.for_range(0, 3, |_| async { Ok(()) }).await
    })
    .restore_checkpoints(vec!["ROOT[0][0]".to_string()])
    .on_checkpoint_update(move |list| sink.lock().push(list.len()));

    run.start().await.unwrap();
    assert_eq!(*updates.lock(), vec![2, 3]);
}
