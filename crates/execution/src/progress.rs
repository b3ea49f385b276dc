//! Live progress of tracked loops, mirrored into a per-run tree.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use harvester_core::{EngineError, Feature, FeatureId, RootScope, ScopeNode, ScopeValue};
use harvester_progress::{render_tree, NodeId, ProgressStatus, ProgressTracker, ScopeTree};
use parking_lot::Mutex;
use tracing::debug;

/// Inherited: tree node under which new trackers attach.
const NODE_VAR: &str = "progress.node";
/// Local: tree node of the tracker owned by this scope.
const ACTIVE_VAR: &str = "progress.active";
const ORDINAL_VAR: &str = "progress.ordinal";
const ON_PROGRESS: &str = "on_progress";

/// Options of a new tracker.
#[derive(Debug, Clone, Default)]
pub struct TrackerOptions {
    /// Base name; the tracker is named `"{name}[{n}]"`
    pub name: Option<String>,
    /// Initial counter value
    pub start: i64,
    /// Upper bound, if known
    pub max: Option<i64>,
}

/// Tree of the live trackers of a run.
pub struct ProgressBoard {
    tree: Mutex<ScopeTree<Arc<ProgressTracker>>>,
}

impl ProgressBoard {
    fn new(root_label: &str) -> Self {
        Self {
            tree: Mutex::new(ScopeTree::new(root_label)),
        }
    }

    /// Text rendering of every live tracker, in hierarchy order.
    pub fn render(&self) -> String {
        render_tree(&self.tree.lock())
    }

    /// Status of every live tracker, in hierarchy order.
    pub fn live(&self) -> Vec<ProgressStatus> {
        self.tree
            .lock()
            .walk()
            .into_iter()
            .filter_map(|(_, node)| node.data.as_ref().map(|t| t.status()))
            .collect()
    }

    fn remove(&self, node: NodeId) {
        self.tree.lock().remove(node);
    }
}

/// Progress trackers for executor loops.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProgressFeature;

impl ProgressFeature {
    /// Feature id.
    pub const ID: FeatureId = "progress";

    /// Tracker tree of the run.
    pub fn board(root: &RootScope) -> Arc<ProgressBoard> {
        root.feature_context(Self::ID, || ProgressBoard::new(root.owner()))
    }

    /// Called with the tracker status and owning scope on every update.
    pub fn on_progress<F>(root: &RootScope, f: F)
    where
        F: Fn(&ProgressStatus, &Arc<ScopeNode>) + Send + Sync + 'static,
    {
        root.feature_config(Self::ID)
            .assign_callback::<ProgressStatus, _>(ON_PROGRESS, f);
    }

    /// Create a tracker owned by `scope`, attached under the nearest tracker
    /// visible from it. The tracker leaves the tree when it finishes.
    ///
    /// Fails with [`EngineError::TrackerAlreadyActive`] while `scope`
    /// already owns a live tracker.
    pub fn create(
        scope: &Arc<ScopeNode>,
        options: TrackerOptions,
    ) -> harvester_core::Result<Arc<ProgressTracker>> {
        let board = Self::board(scope.root());
        if active_node(&board, scope).is_some() {
            return Err(EngineError::TrackerAlreadyActive(
                scope.full_execution_label().to_string(),
            ));
        }
        Ok(attach(scope, &board, options, None).tracker)
    }

    /// Tracker of an executor loop running in `scope`.
    ///
    /// The first live loop of a scope owns it like [`ProgressFeature::create`].
    /// Loops started while the scope already owns a live tracker become
    /// siblings of that tracker and leave the scope's variables alone.
    pub(crate) fn create_for_loop(scope: &Arc<ScopeNode>, options: TrackerOptions) -> LoopTracker {
        let board = Self::board(scope.root());
        let sibling_of = active_node(&board, scope);
        attach(scope, &board, options, sibling_of)
    }
}

/// Tracker of an executor loop and its node on the board.
pub(crate) struct LoopTracker {
    pub(crate) tracker: Arc<ProgressTracker>,
    node: NodeId,
}

impl LoopTracker {
    /// Attach trackers created inside `branch` under this loop.
    pub(crate) fn adopt(&self, branch: &ScopeNode) {
        branch.set(NODE_VAR, self.node);
    }
}

/// Live tracker node owned by `scope`, if any.
fn active_node(board: &ProgressBoard, scope: &ScopeNode) -> Option<NodeId> {
    let active = *scope.get::<NodeId>(ACTIVE_VAR)?;
    board.tree.lock().contains(active).then_some(active)
}

/// How a tracker hangs off its scope.
enum Attachment {
    /// Owns the scope's tracker slot; restores `previous` attachment point
    Owner { previous: Option<ScopeValue> },
    /// Shares the scope with its live owner
    Sibling,
}

fn attach(
    scope: &Arc<ScopeNode>,
    board: &Arc<ProgressBoard>,
    options: TrackerOptions,
    sibling_of: Option<NodeId>,
) -> LoopTracker {
    let ordinal = scope
        .local_or_insert_with(ORDINAL_VAR, || AtomicU64::new(0))
        .fetch_add(1, Ordering::SeqCst);
    let base = options
        .name
        .unwrap_or_else(|| scope.execution_label().to_string());
    let name = format!("{}[{}]", base, ordinal);

    let attachment = match sibling_of {
        Some(_) => Attachment::Sibling,
        None => Attachment::Owner {
            previous: scope.get_value(NODE_VAR),
        },
    };
    let slot = Arc::new(OnceLock::new());
    let weak_board = Arc::downgrade(board);
    let weak_scope = Arc::downgrade(scope);
    let own_slot = slot.clone();
    let tracker = Arc::new(
        ProgressTracker::new(options.start, options.max)
            .with_name(name)
            .with_on_update(move |tracker| {
                on_tracker_update(tracker, &weak_board, &weak_scope, &own_slot, &attachment)
            }),
    );

    let node = {
        let mut tree = board.tree.lock();
        let parent = match sibling_of {
            Some(active) => tree.get(active).and_then(|n| n.parent()),
            None => scope.get::<NodeId>(NODE_VAR).map(|n| *n),
        }
        .unwrap_or_else(|| tree.root());
        tree.insert(parent, scope.full_execution_label(), tracker.clone())
    };
    let _ = slot.set(node);
    if sibling_of.is_none() {
        scope.set(NODE_VAR, node);
        scope.set_local(ACTIVE_VAR, node);
    }
    debug!(tracker = tracker.name().unwrap_or_default(), scope = %scope.full_execution_label(), "tracker created");

    LoopTracker { tracker, node }
}

fn on_tracker_update(
    tracker: &ProgressTracker,
    board: &Weak<ProgressBoard>,
    scope: &Weak<ScopeNode>,
    node: &OnceLock<NodeId>,
    attachment: &Attachment,
) {
    let Some(scope) = scope.upgrade() else {
        return;
    };
    scope
        .feature_config(ProgressFeature::ID)
        .invoke_callback(ON_PROGRESS, &scope, &tracker.status());

    if !tracker.is_finished() {
        return;
    }
    let Some(node) = node.get().copied() else {
        return;
    };
    if let Some(board) = board.upgrade() {
        board.remove(node);
    }
    if let Attachment::Owner { previous } = attachment {
        scope.unset_local(ACTIVE_VAR);
        match previous {
            Some(value) => scope.set_value(NODE_VAR, value.clone()),
            None => {
                scope.unset(NODE_VAR);
            }
        }
    }
    debug!(tracker = tracker.name().unwrap_or_default(), "tracker finished");
}

impl Feature for ProgressFeature {
    fn id(&self) -> FeatureId {
        Self::ID
    }

    fn on_root_scope_enter(&self, root: &Arc<ScopeNode>) {
        Self::board(root.root());
    }
}
