//! Scope tree: the hierarchical execution context of a run.
//!
//! Every unit of work executes inside a [`ScopeNode`]. Nodes form a tree
//! rooted at a single root node per run; each node points to its parent and
//! to the run-wide [`RootScope`] state, never to its children.
//!
//! Variables come in two flavours:
//! - *local* variables are visible only to the node that set them;
//! - *inherited* variables are copied into a child when the child is created.
//!   Later writes on either side are not observed by the other (pure snapshot).

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::warn;

use crate::cancel::CancelSignal;
use crate::feature::{FeatureConfig, FeatureId, FeatureRegistry};
use crate::id::RunId;
use crate::label::execution_label;

/// Type-erased value stored in scope variables and feature bags.
pub type ScopeValue = Arc<dyn Any + Send + Sync>;

/// Run-wide state shared by every node of one scope tree.
pub struct RootScope {
    run_id: RunId,
    owner: String,
    cancel: CancelSignal,
    features: FeatureRegistry,
    configs: Mutex<HashMap<FeatureId, Arc<FeatureConfig>>>,
    contexts: Mutex<HashMap<FeatureId, ScopeValue>>,
}

impl RootScope {
    /// Create run state owned by the job `owner`.
    pub fn new(owner: impl Into<String>, features: FeatureRegistry) -> Self {
        Self {
            run_id: RunId::new(),
            owner: owner.into(),
            cancel: CancelSignal::new(),
            features,
            configs: Mutex::new(HashMap::new()),
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Identifier of this run.
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Name of the job that owns this run.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Cancellation signal shared by all scopes of the run.
    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Has the run been cancelled?
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Features registered for this run.
    pub fn features(&self) -> &FeatureRegistry {
        &self.features
    }

    /// Per-run configuration bag of a feature, created on first access.
    pub fn feature_config(&self, id: FeatureId) -> Arc<FeatureConfig> {
        self.configs
            .lock()
            .entry(id)
            .or_insert_with(|| Arc::new(FeatureConfig::default()))
            .clone()
    }

    /// Bound API of a feature for this run.
    ///
    /// The first call creates it with `init`; every later call for the same
    /// feature returns the same object.
    pub fn feature_context<T, F>(&self, id: FeatureId, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut contexts = self.contexts.lock();
        if let Some(existing) = contexts.get(id) {
            match existing.clone().downcast::<T>() {
                Ok(context) => return context,
                Err(_) => warn!(feature = id, "feature context registered with a different type, replacing"),
            }
        }
        let context = Arc::new(init());
        contexts.insert(id, context.clone());
        context
    }
}

/// Kind of a scope node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Top-level node of a run
    Root,
    /// A named unit of work created by a scoped call
    Named,
    /// Per-item branch created by an executor; shares its parent's names
    Iteration,
}

/// Wall-clock end and duration of a scope that exited normally.
#[derive(Debug, Clone, Copy)]
pub struct ScopeTiming {
    /// When the scope exited
    pub ended_at: DateTime<Utc>,
    /// Time spent inside the scope
    pub duration: Duration,
}

/// A node in the execution-context tree.
pub struct ScopeNode {
    kind: ScopeKind,
    name: String,
    full_name: String,
    execution_label: String,
    full_execution_label: String,
    parent: Option<Arc<ScopeNode>>,
    root: Arc<RootScope>,
    local_vars: Mutex<HashMap<String, ScopeValue>>,
    inherited_vars: Mutex<HashMap<String, ScopeValue>>,
    started_at: DateTime<Utc>,
    started: Instant,
    timing: Mutex<Option<ScopeTiming>>,
}

impl ScopeNode {
    /// Create a root node backed by a fresh run state with no features.
    pub fn new_root(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        let root = Arc::new(RootScope::new(name.clone(), FeatureRegistry::new()));
        Self::root_with(name, root)
    }

    /// Create the root node of the run described by `root`.
    pub fn root_with(name: impl Into<String>, root: Arc<RootScope>) -> Arc<Self> {
        let name = name.into();
        Arc::new(Self {
            kind: ScopeKind::Root,
            full_name: name.clone(),
            execution_label: name.clone(),
            full_execution_label: name.clone(),
            name,
            parent: None,
            root,
            local_vars: Mutex::new(HashMap::new()),
            inherited_vars: Mutex::new(HashMap::new()),
            started_at: Utc::now(),
            started: Instant::now(),
            timing: Mutex::new(None),
        })
    }

    /// Create a named child; `formatted_args` is the rendered argument list.
    pub fn child(self: &Arc<Self>, name: impl Into<String>, formatted_args: &str) -> Arc<Self> {
        let name = name.into();
        let label = execution_label(&name, formatted_args);
        Arc::new(Self {
            kind: ScopeKind::Named,
            full_name: format!("{}.{}", self.full_name, name),
            full_execution_label: format!("{}.{}", self.full_execution_label, label),
            execution_label: label,
            name,
            parent: Some(self.clone()),
            root: self.root.clone(),
            local_vars: Mutex::new(HashMap::new()),
            inherited_vars: Mutex::new(self.inherited_vars.lock().clone()),
            started_at: Utc::now(),
            started: Instant::now(),
            timing: Mutex::new(None),
        })
    }

    /// Create a transparent per-item branch of this node.
    ///
    /// The branch keeps this node's names and labels, starts with empty
    /// locals and a snapshot of this node's inherited variables.
    pub fn iteration(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            kind: ScopeKind::Iteration,
            name: self.name.clone(),
            full_name: self.full_name.clone(),
            execution_label: self.execution_label.clone(),
            full_execution_label: self.full_execution_label.clone(),
            parent: Some(self.clone()),
            root: self.root.clone(),
            local_vars: Mutex::new(HashMap::new()),
            inherited_vars: Mutex::new(self.inherited_vars.lock().clone()),
            started_at: Utc::now(),
            started: Instant::now(),
            timing: Mutex::new(None),
        })
    }

    /// Short label of this unit, e.g. `page`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dot-joined path from the root, e.g. `run.category.page`.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Name with rendered arguments, e.g. `page(url="/a",page=2)`.
    pub fn execution_label(&self) -> &str {
        &self.execution_label
    }

    /// Dot-joined execution labels from the root.
    pub fn full_execution_label(&self) -> &str {
        &self.full_execution_label
    }

    /// Kind of this node.
    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    /// Is this the root node of the run?
    pub fn is_root(&self) -> bool {
        self.kind == ScopeKind::Root
    }

    /// Enclosing node; `None` for the root.
    pub fn parent(&self) -> Option<&Arc<ScopeNode>> {
        self.parent.as_ref()
    }

    /// Run-wide state.
    pub fn root(&self) -> &Arc<RootScope> {
        &self.root
    }

    /// The nearest enclosing node that is not an iteration branch.
    pub fn named(self: &Arc<Self>) -> Arc<Self> {
        let mut node = self.clone();
        while node.kind == ScopeKind::Iteration {
            match node.parent.clone() {
                Some(parent) => node = parent,
                None => break,
            }
        }
        node
    }

    /// When the scope was entered.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Time since the scope was entered.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// End time and duration, once the scope exited normally.
    pub fn timing(&self) -> Option<ScopeTiming> {
        *self.timing.lock()
    }

    /// Record the normal exit of this scope. Only the first call has effect.
    pub fn mark_exited(&self) -> ScopeTiming {
        *self.timing.lock().get_or_insert_with(|| ScopeTiming {
            ended_at: Utc::now(),
            duration: self.started.elapsed(),
        })
    }

    /// Resolve a variable: local first, then inherited.
    pub fn get_value(&self, key: &str) -> Option<ScopeValue> {
        if let Some(value) = self.local_vars.lock().get(key) {
            return Some(value.clone());
        }
        self.inherited_vars.lock().get(key).cloned()
    }

    /// Typed variant of [`ScopeNode::get_value`].
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.get_value(key)?.downcast::<T>().ok()
    }

    /// Set an inherited variable on this node.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.set_value(key, Arc::new(value));
    }

    /// Set an inherited variable from an already shared value.
    pub fn set_value(&self, key: impl Into<String>, value: ScopeValue) {
        self.inherited_vars.lock().insert(key.into(), value);
    }

    /// Remove an inherited variable from this node.
    pub fn unset(&self, key: &str) -> Option<ScopeValue> {
        self.inherited_vars.lock().remove(key)
    }

    /// Set a variable visible to this node only.
    pub fn set_local<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.local_vars.lock().insert(key.into(), Arc::new(value));
    }

    /// Remove a local variable.
    pub fn unset_local(&self, key: &str) -> Option<ScopeValue> {
        self.local_vars.lock().remove(key)
    }

    /// Local variable of type `T`, created with `init` if absent.
    pub fn local_or_insert_with<T, F>(&self, key: &str, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut locals = self.local_vars.lock();
        if let Some(existing) = locals.get(key) {
            if let Ok(value) = existing.clone().downcast::<T>() {
                return value;
            }
            warn!(key, scope = %self.full_name, "local variable has a different type, replacing");
        }
        let value = Arc::new(init());
        locals.insert(key.to_string(), value.clone());
        value
    }

    /// Iterate from this node up to the root.
    pub fn ancestors(self: &Arc<Self>) -> impl Iterator<Item = Arc<ScopeNode>> {
        let mut next = Some(self.clone());
        std::iter::from_fn(move || {
            let node = next.take()?;
            next = node.parent.clone();
            Some(node)
        })
    }

    /// Per-run configuration bag of a feature.
    pub fn feature_config(&self, id: FeatureId) -> Arc<FeatureConfig> {
        self.root.feature_config(id)
    }
}

impl std::fmt::Debug for ScopeNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeNode")
            .field("kind", &self.kind)
            .field("full_execution_label", &self.full_execution_label)
            .finish()
    }
}
