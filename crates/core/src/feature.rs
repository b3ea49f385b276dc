//! Feature registry and per-run feature configuration.
//!
//! A feature is a cross-cutting capability (progress, checkpoints, data
//! output, metrics) that reacts to scope lifecycle events. Features are
//! registered explicitly, once, in a [`FeatureRegistry`] that is handed to
//! the run. Their per-run state lives in the root scope: a
//! [`FeatureConfig`] bag for callbacks and variables, and a bound context
//! object (see [`crate::RootScope::feature_context`]).

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::scope::{ScopeNode, ScopeValue};

/// Stable identity of a feature.
pub type FeatureId = &'static str;

/// Lifecycle hooks of a feature. All hooks are synchronous.
pub trait Feature: Send + Sync + 'static {
    /// Stable identity of the feature.
    fn id(&self) -> FeatureId;

    /// The root scope of a run was entered, before any work runs.
    fn on_root_scope_enter(&self, _root: &Arc<ScopeNode>) {}

    /// A non-root scope was entered.
    fn on_scope_enter(&self, _scope: &Arc<ScopeNode>) {}

    /// A scope exited normally. For the root this fires on every outcome.
    fn on_scope_exit(&self, _scope: &Arc<ScopeNode>) {}

    /// An error raised in `origin` is propagating through `scope`.
    fn on_scope_error(
        &self,
        _scope: &Arc<ScopeNode>,
        _origin: &Arc<ScopeNode>,
        _cause: &anyhow::Error,
    ) {
    }
}

/// Ordered set of features, unique by id.
#[derive(Clone, Default)]
pub struct FeatureRegistry {
    features: Vec<Arc<dyn Feature>>,
}

impl FeatureRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`FeatureRegistry::register`].
    pub fn with(mut self, feature: impl Feature) -> Self {
        self.register(feature);
        self
    }

    /// Register a feature, replacing any feature with the same id.
    pub fn register(&mut self, feature: impl Feature) {
        let feature: Arc<dyn Feature> = Arc::new(feature);
        match self.features.iter().position(|f| f.id() == feature.id()) {
            Some(idx) => self.features[idx] = feature,
            None => self.features.push(feature),
        }
    }

    /// Register a feature only if no feature with the same id exists.
    pub fn register_default(&mut self, feature: impl Feature) {
        if !self.contains(feature.id()) {
            self.register(feature);
        }
    }

    /// Is a feature with `id` registered?
    pub fn contains(&self, id: FeatureId) -> bool {
        self.features.iter().any(|f| f.id() == id)
    }

    /// Ids of all registered features, in registration order.
    pub fn ids(&self) -> Vec<FeatureId> {
        self.features.iter().map(|f| f.id()).collect()
    }

    /// Notify features that the root scope was entered.
    pub fn root_scope_entered(&self, root: &Arc<ScopeNode>) {
        for feature in &self.features {
            feature.on_root_scope_enter(root);
        }
    }

    /// Notify features that a scope was entered.
    pub fn scope_entered(&self, scope: &Arc<ScopeNode>) {
        for feature in &self.features {
            feature.on_scope_enter(scope);
        }
    }

    /// Notify features that a scope exited.
    pub fn scope_exited(&self, scope: &Arc<ScopeNode>) {
        for feature in &self.features {
            feature.on_scope_exit(scope);
        }
    }

    /// Notify features that an error is propagating through `scope`.
    pub fn scope_errored(
        &self,
        scope: &Arc<ScopeNode>,
        origin: &Arc<ScopeNode>,
        cause: &anyhow::Error,
    ) {
        for feature in &self.features {
            feature.on_scope_error(scope, origin, cause);
        }
    }
}

type ErasedCallback = Arc<dyn Fn(&dyn Any, &Arc<ScopeNode>) + Send + Sync>;

/// Mutable per-run bag of a feature: named callbacks and named variables.
#[derive(Default)]
pub struct FeatureConfig {
    callbacks: Mutex<HashMap<String, ErasedCallback>>,
    vars: Mutex<HashMap<String, ScopeValue>>,
}

impl FeatureConfig {
    /// Assign the callback `id`, replacing a previous assignment.
    ///
    /// The callback receives the invocation arguments and the invoking scope.
    pub fn assign_callback<A, F>(&self, id: impl Into<String>, f: F)
    where
        A: Any,
        F: Fn(&A, &Arc<ScopeNode>) + Send + Sync + 'static,
    {
        let id = id.into();
        let name = id.clone();
        let erased: ErasedCallback = Arc::new(move |args: &dyn Any, scope: &Arc<ScopeNode>| {
            match args.downcast_ref::<A>() {
                Some(args) => f(args, scope),
                None => warn!(callback = %name, "callback invoked with unexpected argument type"),
            }
        });
        self.callbacks.lock().insert(id, erased);
    }

    /// Invoke the callback `id` if one is assigned; otherwise do nothing.
    pub fn invoke_callback<A: Any>(&self, id: &str, scope: &Arc<ScopeNode>, args: &A) {
        let callback = self.callbacks.lock().get(id).cloned();
        match callback {
            Some(callback) => callback(args, scope),
            None => trace!(callback = id, "no callback assigned"),
        }
    }

    /// Is a callback assigned under `id`?
    pub fn has_callback(&self, id: &str) -> bool {
        self.callbacks.lock().contains_key(id)
    }

    /// Set a named variable.
    pub fn set_var<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.vars.lock().insert(key.into(), Arc::new(value));
    }

    /// Read a named variable of type `T`.
    pub fn get_var<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.vars.lock().get(key)?.clone().downcast::<T>().ok()
    }
}
