//! Scope-keyed tree mirroring the nesting of tracked loops.
//!
//! The root node always exists. Nodes are created under any existing node
//! and removed together with their subtree.

use std::collections::HashMap;

use serde::Serialize;
use tracing::trace;

/// Identifier of a node in a [`ScopeTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(u64);

/// A node of a [`ScopeTree`].
#[derive(Debug)]
pub struct TreeNode<T> {
    /// Execution label of the scope that created the node
    pub scope: String,
    /// Payload; `None` for the root
    pub data: Option<T>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl<T> TreeNode<T> {
    /// Parent node; `None` for the root.
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Child nodes in insertion order.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

/// Arena-backed tree of scope payloads.
#[derive(Debug)]
pub struct ScopeTree<T> {
    nodes: HashMap<NodeId, TreeNode<T>>,
    root: NodeId,
    next_id: u64,
}

impl<T> ScopeTree<T> {
    /// Create a tree whose root node belongs to `root_scope`.
    pub fn new(root_scope: impl Into<String>) -> Self {
        let root = NodeId(0);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            TreeNode {
                scope: root_scope.into(),
                data: None,
                parent: None,
                children: Vec::new(),
            },
        );
        Self {
            nodes,
            root,
            next_id: 1,
        }
    }

    /// The root node.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Number of nodes including the root.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Does the tree hold only its root?
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Is `id` a live node?
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Look up a node.
    pub fn get(&self, id: NodeId) -> Option<&TreeNode<T>> {
        self.nodes.get(&id)
    }

    /// Attach a new node under `parent`, or under the root if `parent` was removed.
    pub fn insert(&mut self, parent: NodeId, scope: impl Into<String>, data: T) -> NodeId {
        let parent = if self.contains(parent) { parent } else { self.root };
        let id = NodeId(self.next_id);
        self.next_id += 1;

        self.nodes.insert(
            id,
            TreeNode {
                scope: scope.into(),
                data: Some(data),
                parent: Some(parent),
                children: Vec::new(),
            },
        );
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children.push(id);
        }
        id
    }

    /// Detach `id` and its whole subtree, returning the node's payload.
    ///
    /// The root cannot be removed.
    pub fn remove(&mut self, id: NodeId) -> Option<T> {
        if id == self.root {
            return None;
        }
        let Some(node) = self.nodes.remove(&id) else {
            trace!(node = ?id, "tree node already removed");
            return None;
        };
        if let Some(parent) = node.parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.retain(|child| *child != id);
        }

        let mut pending = node.children;
        while let Some(child) = pending.pop() {
            if let Some(removed) = self.nodes.remove(&child) {
                pending.extend(removed.children);
            }
        }
        node.data
    }

    /// All nodes in hierarchy (pre-)order with their depth; the root has depth 0.
    pub fn walk(&self) -> Vec<(usize, &TreeNode<T>)> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(0usize, self.root)];
        while let Some((depth, id)) = stack.pop() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            out.push((depth, node));
            for child in node.children.iter().rev() {
                stack.push((depth + 1, *child));
            }
        }
        out
    }
}
