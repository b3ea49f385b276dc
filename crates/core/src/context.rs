//! Context propagation: the "current scope" of an asynchronous call chain.
//!
//! The current [`ScopeNode`] is stored in a tokio task-local. [`run`] installs
//! a scope for the whole extent of a future: every poll of that future, and of
//! every future it awaits, sees the installed scope. Concurrent branches
//! polled by the same task (`join!`, `FuturesUnordered`) are each wrapped by
//! their own [`run`], so they never observe each other's scope.
//!
//! The task-local is a convenience over explicit passing: every operation
//! that reads [`current`] also has a variant taking the scope as an argument
//! (e.g. [`ScopedFn::call_in`]). Spawned tasks do not inherit the scope.

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use crate::error::{EngineError, Result, ScopedError};
use crate::label::{format_scope_params, ScopeArgs, ScopeParam};
use crate::scope::ScopeNode;

tokio::task_local! {
    static CURRENT_SCOPE: Arc<ScopeNode>;
}

/// Run `fut` with `scope` as the current scope for its entire extent.
pub async fn run<F: Future>(scope: Arc<ScopeNode>, fut: F) -> F::Output {
    CURRENT_SCOPE.scope(scope, fut).await
}

/// The scope of the calling continuation.
///
/// Fails with [`EngineError::NoActiveScope`] outside of any [`run`] extent.
pub fn current() -> Result<Arc<ScopeNode>> {
    CURRENT_SCOPE
        .try_with(Arc::clone)
        .map_err(|_| EngineError::NoActiveScope)
}

/// Like [`current`], without failing.
pub fn try_current() -> Option<Arc<ScopeNode>> {
    CURRENT_SCOPE.try_with(Arc::clone).ok()
}

/// Run `fut` inside a new child of `parent` named `name`.
///
/// Refuses to start once the run is cancelled. On success the child's
/// timing is recorded and features see `on_scope_exit`. On failure the
/// error is wrapped into a [`ScopedError`] at its origin, features see
/// `on_scope_error` for this scope, and the error is passed on unchanged.
pub async fn run_scoped<T, Fut>(
    parent: &Arc<ScopeNode>,
    name: &str,
    formatted_args: &str,
    fut: Fut,
) -> anyhow::Result<T>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    parent.root().cancel_signal().check()?;

    let scope = parent.child(name, formatted_args);
    let features = scope.root().features();
    debug!(scope = %scope.full_execution_label(), "entering scope");
    features.scope_entered(&scope);

    match run(scope.clone(), fut).await {
        Ok(value) => {
            let timing = scope.mark_exited();
            debug!(
                scope = %scope.full_execution_label(),
                duration_ms = timing.duration.as_millis() as u64,
                "exited scope"
            );
            features.scope_exited(&scope);
            Ok(value)
        }
        Err(err) => {
            if let Some(scoped) = err.downcast_ref::<ScopedError>() {
                features.scope_errored(&scope, scoped.origin(), scoped.cause());
                return Err(err);
            }
            debug!(scope = %scope.full_execution_label(), error = %err, "scope failed");
            features.scope_errored(&scope, &scope, &err);
            Err(ScopedError::new(scope, err).into())
        }
    }
}

/// A function whose every call runs in its own child scope.
pub struct ScopedFn<F> {
    name: String,
    params: Vec<ScopeParam>,
    f: F,
}

/// Wrap `f` so each call derives a child scope named `name`.
///
/// `params` names the arguments rendered into the execution label.
pub fn wrap_with_scope<A, F, Fut, T>(
    name: impl Into<String>,
    params: Vec<ScopeParam>,
    f: F,
) -> ScopedFn<F>
where
    F: Fn(A) -> Fut,
    A: ScopeArgs,
    Fut: Future<Output = anyhow::Result<T>>,
{
    ScopedFn {
        name: name.into(),
        params,
        f,
    }
}

impl<F> ScopedFn<F> {
    /// Name of the scopes this function creates.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call in a child of the current scope.
    pub async fn call<A, Fut, T>(&self, args: A) -> anyhow::Result<T>
    where
        F: Fn(A) -> Fut,
        A: ScopeArgs,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let parent = current()?;
        self.call_in(&parent, args).await
    }

    /// Call in a child of an explicitly passed scope.
    pub async fn call_in<A, Fut, T>(&self, parent: &Arc<ScopeNode>, args: A) -> anyhow::Result<T>
    where
        F: Fn(A) -> Fut,
        A: ScopeArgs,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let formatted = format_scope_params(&args.to_values(), &self.params);
        run_scoped(parent, &self.name, &formatted, async { (self.f)(args).await }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_aborted;
    use crate::feature::{Feature, FeatureId, FeatureRegistry};
    use crate::scope::RootScope;
    use parking_lot::Mutex;
    use proptest::prelude::*;

    fn record(names: &Mutex<Vec<String>>) {
        names.lock().push(current().unwrap().full_name().to_string());
    }

    #[test]
    fn test_current_outside_scope_fails() {
        assert!(matches!(current(), Err(EngineError::NoActiveScope)));
        assert!(try_current().is_none());
    }

    #[tokio::test]
    async fn test_current_outside_scope_fails_in_async_code() {
        assert!(matches!(current(), Err(EngineError::NoActiveScope)));
    }

    #[tokio::test]
    async fn test_nested_scopes() {
        let root = ScopeNode::new_root("ROOT");
        let names = &Mutex::new(Vec::new());

        let c = &wrap_with_scope("C", vec![], move |_: ()| async move {
            record(names);
            Ok(())
        });
        let b = &wrap_with_scope("B", vec![], move |_: ()| async move {
            record(names);
            c.call(()).await?;
            record(names);
            Ok(())
        });
        let a = wrap_with_scope("A", vec![], move |_: ()| async move {
            record(names);
            b.call(()).await
        });

        run(root, a.call(())).await.unwrap();

        assert_eq!(
            *names.lock(),
            vec!["ROOT.A", "ROOT.A.B", "ROOT.A.B.C", "ROOT.A.B"]
        );
    }

    #[tokio::test]
    async fn test_interleaved_branches_keep_their_own_scope() {
        let root = ScopeNode::new_root("ROOT");
        let names = &Mutex::new(Vec::new());

        let f1 = wrap_with_scope("F1", vec![], move |_: ()| async move {
            record(names);
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            record(names);
            Ok(())
        });
        let f2 = &wrap_with_scope("F2", vec![], move |_: ()| async move {
            record(names);
            tokio::task::yield_now().await;
            record(names);
            Ok(())
        });
        let f3 = wrap_with_scope("F3", vec![], move |_: ()| async move {
            tokio::task::yield_now().await;
            f2.call(()).await
        });

        run(root, async {
            let (a, b, c) = tokio::join!(f1.call(()), f2.call(()), f3.call(()));
            a.and(b).and(c)
        })
        .await
        .unwrap();

        let names = names.lock().clone();
        assert_eq!(names.len(), 6);
        assert_eq!(names.iter().filter(|n| *n == "ROOT.F1").count(), 2);
        assert_eq!(names.iter().filter(|n| *n == "ROOT.F2").count(), 2);
        assert_eq!(names.iter().filter(|n| *n == "ROOT.F3.F2").count(), 2);
    }

    #[tokio::test]
    async fn test_execution_label_uses_declared_params() {
        let root = ScopeNode::new_root("ROOT");
        let labels = &Mutex::new(Vec::new());

        let f = wrap_with_scope(
            "fn",
            vec![ScopeParam::new(0, "param1"), ScopeParam::new(1, "param2")],
            move |(_a, _b): (u32, String)| async move {
                labels
                    .lock()
                    .push(current()?.full_execution_label().to_string());
                Ok(())
            },
        );

        run(root, f.call((123u32, "str".to_string()))).await.unwrap();
        assert_eq!(*labels.lock(), vec![r#"ROOT.fn(param1=123,param2="str")"#]);
    }

    #[tokio::test]
    async fn test_call_in_explicit_scope() {
        let root = ScopeNode::new_root("ROOT");
        let f = wrap_with_scope("explicit", vec![], |_: ()| async {
            Ok::<_, anyhow::Error>(current()?.full_name().to_string())
        });
        let name = f.call_in(&root, ()).await.unwrap();
        assert_eq!(name, "ROOT.explicit");
    }

    #[tokio::test]
    async fn test_scoped_call_refuses_after_cancel() {
        let root = ScopeNode::new_root("ROOT");
        root.root().cancel_signal().cancel();
        let ran = &std::sync::atomic::AtomicBool::new(false);
        let f = wrap_with_scope("never", vec![], move |_: ()| async move {
            ran.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });
        let err = f.call_in(&root, ()).await.unwrap_err();
        assert!(is_aborted(&err));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[derive(Default)]
    struct ErrorLog(Arc<Mutex<Vec<(String, String)>>>);

    impl Feature for ErrorLog {
        fn id(&self) -> FeatureId {
            "error-log"
        }

        fn on_scope_error(&self, scope: &Arc<ScopeNode>, origin: &Arc<ScopeNode>, _: &anyhow::Error) {
            self.0
                .lock()
                .push((scope.full_name().to_string(), origin.full_name().to_string()));
        }
    }

    #[tokio::test]
    async fn test_error_wrapped_once_and_ancestors_notified() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = FeatureRegistry::new().with(ErrorLog(log.clone()));
        let root = ScopeNode::root_with("ROOT", Arc::new(RootScope::new("test", registry)));

        let inner = &wrap_with_scope("inner", vec![], |_: ()| async {
            Err::<(), _>(anyhow::anyhow!("boom"))
        });
        let outer = wrap_with_scope("outer", vec![], move |_: ()| async move { inner.call(()).await });

        let err = outer.call_in(&root, ()).await.unwrap_err();
        let scoped = err.downcast_ref::<ScopedError>().unwrap();
        assert_eq!(scoped.origin().full_name(), "ROOT.outer.inner");
        assert_eq!(scoped.cause().to_string(), "boom");
        assert!(scoped.cause().downcast_ref::<ScopedError>().is_none());

        assert_eq!(
            *log.lock(),
            vec![
                ("ROOT.outer.inner".to_string(), "ROOT.outer.inner".to_string()),
                ("ROOT.outer".to_string(), "ROOT.outer.inner".to_string()),
            ]
        );
    }

    async fn branch(
        root: Arc<ScopeNode>,
        id: usize,
        yields: [u8; 3],
        names: Arc<Mutex<Vec<String>>>,
    ) -> anyhow::Result<()> {
        let push = |names: &Arc<Mutex<Vec<String>>>| record(names);
        run_scoped(&root, &format!("b{}", id), "", async {
            push(&names);
            for _ in 0..yields[0] {
                tokio::task::yield_now().await;
            }
            run_scoped(&current()?, "mid", "", async {
                push(&names);
                for _ in 0..yields[1] {
                    tokio::task::yield_now().await;
                }
                run_scoped(&current()?, "leaf", "", async {
                    push(&names);
                    for _ in 0..yields[2] {
                        tokio::task::yield_now().await;
                    }
                    push(&names);
                    Ok(())
                })
                .await?;
                push(&names);
                Ok(())
            })
            .await?;
            push(&names);
            Ok(())
        })
        .await
    }

    proptest! {
        #[test]
        fn prop_branches_observe_only_their_own_lineage(
            yields in proptest::collection::vec(any::<[u8; 3]>().prop_map(|y| y.map(|v| v % 4)), 1..8)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let records: Vec<Arc<Mutex<Vec<String>>>> =
                yields.iter().map(|_| Arc::new(Mutex::new(Vec::new()))).collect();

            runtime.block_on(async {
                let root = ScopeNode::new_root("ROOT");
                let branches = yields.iter().enumerate().map(|(id, y)| {
                    branch(root.clone(), id, *y, records[id].clone())
                });
                run(root.clone(), futures::future::join_all(branches)).await
            });

            for (id, record) in records.iter().enumerate() {
                let base = format!("ROOT.b{}", id);
                let expected = vec![
                    base.clone(),
                    format!("{}.mid", base),
                    format!("{}.mid.leaf", base),
                    format!("{}.mid.leaf", base),
                    format!("{}.mid", base),
                    base,
                ];
                prop_assert_eq!(record.lock().clone(), expected);
            }
        }
    }
}
