//! Checkpoints: stable ids for units of work and the set of finished ones.
//!
//! Every executor owns a [`CheckpointContainer`] whose id is derived from
//! its scope: `"{parentId}.{scopeName}[{ordinal}]"`, or
//! `"{scopeName}[{ordinal}]"` at the top. Items get
//! `"{containerId}[{json(item)}]"`. The run keeps a [`CheckpointStore`] of
//! finished ids; marking an id finished drops every id nested under it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use harvester_core::{Feature, FeatureId, RootScope, ScopeNode};
use indexmap::IndexSet;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

/// Inherited scope variable holding the checkpoint id of the enclosing unit.
pub(crate) const CHECKPOINT_ID_VAR: &str = "checkpoint.id";
const ORDINAL_VAR: &str = "checkpoint.ordinal";
const RESTORE_VAR: &str = "restore";
const ON_UPDATE: &str = "on_checkpoint_update";

/// Is `id` nested under `ancestor`?
fn is_descendant(id: &str, ancestor: &str) -> bool {
    id.len() > ancestor.len()
        && id.starts_with(ancestor)
        && matches!(id.as_bytes()[ancestor.len()], b'.' | b'[')
}

/// Per-run set of finished checkpoint ids, in insertion order.
pub struct CheckpointStore {
    finished: Mutex<IndexSet<String>>,
}

impl CheckpointStore {
    fn new() -> Self {
        Self {
            finished: Mutex::new(IndexSet::new()),
        }
    }

    /// Was `id` marked finished?
    pub fn is_finished(&self, id: &str) -> bool {
        self.finished.lock().contains(id)
    }

    /// Mark `id` finished, dropping ids nested under it, then notify
    /// `on_checkpoint_update` with the resulting list.
    pub fn mark_finished(&self, id: &str, scope: &Arc<ScopeNode>) {
        let snapshot = {
            let mut finished = self.finished.lock();
            finished.retain(|existing| !is_descendant(existing, id));
            finished.insert(id.to_string());
            finished.iter().cloned().collect::<Vec<_>>()
        };
        debug!(checkpoint = id, "checkpoint finished");
        scope
            .feature_config(CheckpointFeature::ID)
            .invoke_callback(ON_UPDATE, scope, &snapshot);
    }

    /// Record `entry` in place of every id starting with `prefix`, then
    /// notify `on_checkpoint_update`. Nothing changes if `entry` is already
    /// the only such id.
    fn replace_prefixed(&self, prefix: &str, entry: String, scope: &Arc<ScopeNode>) {
        let snapshot = {
            let mut finished = self.finished.lock();
            let stale: Vec<String> = finished
                .iter()
                .filter(|id| id.starts_with(prefix) && **id != entry)
                .cloned()
                .collect();
            if stale.is_empty() && finished.contains(&entry) {
                return;
            }
            for id in &stale {
                finished.shift_remove(id);
            }
            finished.insert(entry.clone());
            finished.iter().cloned().collect::<Vec<_>>()
        };
        debug!(checkpoint = %entry, "checkpoint recorded");
        scope
            .feature_config(CheckpointFeature::ID)
            .invoke_callback(ON_UPDATE, scope, &snapshot);
    }

    /// Replace the finished set with `checkpoints`.
    pub fn restore(&self, checkpoints: impl IntoIterator<Item = String>) {
        let mut finished = self.finished.lock();
        finished.clear();
        finished.extend(checkpoints);
    }

    /// Finished ids in insertion order.
    pub fn snapshot(&self) -> Vec<String> {
        self.finished.lock().iter().cloned().collect()
    }

    /// Number of finished ids.
    pub fn len(&self) -> usize {
        self.finished.lock().len()
    }

    /// Is the set empty?
    pub fn is_empty(&self) -> bool {
        self.finished.lock().is_empty()
    }
}

/// Id namespace of one executor.
#[derive(Clone)]
pub struct CheckpointContainer {
    id: String,
    store: Arc<CheckpointStore>,
}

impl CheckpointContainer {
    /// The container's own id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id of `item` inside this container.
    pub fn item_id<T: Serialize + ?Sized>(&self, item: &T) -> harvester_core::Result<String> {
        Ok(format!("{}[{}]", self.id, serde_json::to_string(item)?))
    }

    /// Was the item id finished in this or a previous run?
    pub fn is_finished(&self, item_id: &str) -> bool {
        self.store.is_finished(item_id)
    }

    /// Mark an item id finished.
    pub fn mark_finished(&self, item_id: &str, scope: &Arc<ScopeNode>) {
        self.store.mark_finished(item_id, scope)
    }

    /// Loop bound recorded by this container, in this or a previous run.
    pub fn upper_bound(&self) -> Option<i64> {
        let prefix = self.bound_prefix();
        self.store
            .finished
            .lock()
            .iter()
            .rev()
            .find_map(|id| id.strip_prefix(&prefix)?.strip_suffix(']')?.parse().ok())
    }

    /// Record the loop bound as `"{id}.max[{max}]"`. The entry lives next to
    /// the finished items and is dropped with them when the enclosing unit
    /// finishes.
    pub fn set_upper_bound(&self, max: i64, scope: &Arc<ScopeNode>) {
        let prefix = self.bound_prefix();
        let entry = format!("{}{}]", prefix, max);
        self.store.replace_prefixed(&prefix, entry, scope)
    }

    fn bound_prefix(&self) -> String {
        format!("{}.max[", self.id)
    }
}

impl std::fmt::Debug for CheckpointContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointContainer").field("id", &self.id).finish()
    }
}

/// Resumable checkpoints.
///
/// Configuration lives in the run's feature bag: a list to restore
/// ([`CheckpointFeature::restore`]) and the `on_checkpoint_update` callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct CheckpointFeature;

impl CheckpointFeature {
    /// Feature id.
    pub const ID: FeatureId = "checkpoint";

    /// Finished set of the run.
    pub fn store(root: &RootScope) -> Arc<CheckpointStore> {
        root.feature_context(Self::ID, CheckpointStore::new)
    }

    /// Seed the finished set with `checkpoints` when the run starts.
    pub fn restore(root: &RootScope, checkpoints: Vec<String>) {
        root.feature_config(Self::ID).set_var(RESTORE_VAR, checkpoints);
    }

    /// Called with the full finished list after every change.
    pub fn on_checkpoint_update<F>(root: &RootScope, f: F)
    where
        F: Fn(&[String]) + Send + Sync + 'static,
    {
        root.feature_config(Self::ID)
            .assign_callback(ON_UPDATE, move |list: &Vec<String>, _: &Arc<ScopeNode>| f(list.as_slice()));
    }

    /// Finished ids of the run.
    pub fn checkpoints(root: &RootScope) -> Vec<String> {
        Self::store(root).snapshot()
    }

    /// Allocate a new container bound to `scope`.
    pub fn container(scope: &Arc<ScopeNode>) -> CheckpointContainer {
        let ordinal = scope
            .local_or_insert_with(ORDINAL_VAR, || AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst);
        let id = match scope.get::<String>(CHECKPOINT_ID_VAR) {
            Some(parent) => format!("{}.{}[{}]", parent, scope.name(), ordinal),
            None => format!("{}[{}]", scope.name(), ordinal),
        };
        CheckpointContainer {
            id,
            store: Self::store(scope.root()),
        }
    }
}

impl Feature for CheckpointFeature {
    fn id(&self) -> FeatureId {
        Self::ID
    }

    fn on_root_scope_enter(&self, root: &Arc<ScopeNode>) {
        let restore = root
            .feature_config(Self::ID)
            .get_var::<Vec<String>>(RESTORE_VAR);
        match restore {
            Some(list) if !list.is_empty() => {
                info!(count = list.len(), "restoring checkpoints");
                Self::store(root.root()).restore(list.iter().cloned());
            }
            _ => {}
        }
    }
}
