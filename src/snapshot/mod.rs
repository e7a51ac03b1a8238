//! Immutable snapshots of a live component tree.
//!
//! A rebuild walks a root's node graph and keeps only the nodes a developer
//! cares about (components, plus platform nodes when asked). Children of
//! skipped nodes are hoisted to the nearest kept ancestor, so the snapshot
//! reads as a component hierarchy. Snapshots are plain values with no
//! back-references; ids resolve to live nodes through the [`SnapshotBuilder`].

pub mod ids;
pub mod scheduler;

use std::collections::HashSet;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::host::{children, display_name, kind_of, NodeHandle, NodeIdentity, NodeKind};
use crate::sync::lock;
use ids::IdRegistry;

pub use scheduler::{spawn_commit_pump, RebuildScheduler, SnapshotListener};

/// One node of a snapshot.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotNode {
    /// Stable id, valid while the node lives.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Decoded node kind.
    pub kind: NodeKind,
    /// Included children in sibling order.
    pub children: Vec<SnapshotNode>,
}

impl SnapshotNode {
    /// Depth-first search for `id`.
    pub fn find(&self, id: &str) -> Option<&SnapshotNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    /// Number of nodes in this subtree, including itself.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(SnapshotNode::count).sum::<usize>()
    }
}

/// Snapshot of one root.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotTree {
    /// Id of the root node.
    pub root_id: String,
    /// Top-level included nodes under the root.
    pub nodes: Vec<SnapshotNode>,
}

impl SnapshotTree {
    /// Find a node anywhere in the tree.
    pub fn find(&self, id: &str) -> Option<&SnapshotNode> {
        self.nodes.iter().find_map(|node| node.find(id))
    }

    /// Total number of included nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.iter().map(SnapshotNode::count).sum()
    }

    /// True when no node was included.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// What a rebuild includes.
#[derive(Clone, Debug)]
pub struct BuildOptions {
    /// Keep platform nodes (elements, text) and structural nodes too.
    pub include_host_nodes: bool,
    /// Recursion guard against corrupted parent/child links.
    pub max_depth: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            include_host_nodes: false,
            max_depth: 1_000,
        }
    }
}

/// Builds snapshots and owns the id registry they are keyed by.
#[derive(Debug)]
pub struct SnapshotBuilder {
    options: BuildOptions,
    ids: Mutex<IdRegistry>,
}

impl SnapshotBuilder {
    /// Builder with `options`.
    pub fn new(options: BuildOptions) -> Self {
        Self {
            options,
            ids: Mutex::new(IdRegistry::new()),
        }
    }

    /// Build options in effect.
    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// Build a fresh snapshot of `root`.
    ///
    /// Ids of nodes under `root` that this rebuild no longer reaches are
    /// released.
    pub fn build(&self, root: &NodeHandle) -> SnapshotTree {
        let root_identity = root.identity();
        let mut ids = lock(&self.ids);
        let mut seen = HashSet::new();

        let root_id = ids.assign(root_identity, root);
        seen.insert(root_id.clone());

        let mut nodes = Vec::new();
        for child in children(root) {
            self.visit(&child, root_identity, 0, &mut ids, &mut seen, &mut nodes);
        }

        ids.retain(root_identity, &seen);
        SnapshotTree { root_id, nodes }
    }

    fn visit(
        &self,
        node: &NodeHandle,
        root: NodeIdentity,
        depth: usize,
        ids: &mut IdRegistry,
        seen: &mut HashSet<String>,
        out: &mut Vec<SnapshotNode>,
    ) {
        if depth >= self.options.max_depth {
            log::warn!("Snapshot depth limit {} reached at '{}'", self.options.max_depth, display_name(node));
            return;
        }

        let kind = kind_of(node);
        let included = self.options.include_host_nodes || kind.is_meaningful();

        if included {
            let id = ids.assign(root, node);
            seen.insert(id.clone());
            let mut own_children = Vec::new();
            for child in children(node) {
                self.visit(&child, root, depth + 1, ids, seen, &mut own_children);
            }
            out.push(SnapshotNode {
                id,
                name: display_name(node),
                kind,
                children: own_children,
            });
        } else {
            // Hoist: the skipped node's children land in the parent's list.
            for child in children(node) {
                self.visit(&child, root, depth + 1, ids, seen, out);
            }
        }
    }

    /// Live node behind a snapshot id.
    pub fn resolve(&self, id: &str) -> Option<NodeHandle> {
        lock(&self.ids).resolve(id)
    }

    /// Snapshot id of a live node, if it has been snapshotted.
    pub fn id_of(&self, node: &NodeHandle) -> Option<String> {
        lock(&self.ids).id_of(node.identity()).map(String::from)
    }

    /// Release every id of `root`.
    pub fn forget_root(&self, root: &NodeHandle) {
        lock(&self.ids).forget_root(root.identity());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryNode;
    use std::sync::Arc;

    fn names(nodes: &[SnapshotNode]) -> Vec<String> {
        nodes.iter().map(|n| n.name.clone()).collect()
    }

    #[test]
    fn test_host_nodes_are_skipped_and_children_hoisted() {
        let root = MemoryNode::root();
        let app = MemoryNode::component("App");
        let div = MemoryNode::element("div");
        let header = MemoryNode::component("Header");
        let footer = MemoryNode::component("Footer");
        root.append_child(&app);
        app.append_child(&div);
        div.append_child(&header);
        div.append_child(&footer);

        let tree = SnapshotBuilder::new(BuildOptions::default()).build(&root.handle());

        assert_eq!(names(&tree.nodes), vec!["App"]);
        assert_eq!(names(&tree.nodes[0].children), vec!["Header", "Footer"]);
        assert_eq!(tree.node_count(), 3);
    }

    #[test]
    fn test_include_host_nodes_keeps_everything() {
        let root = MemoryNode::root();
        let app = MemoryNode::component("App");
        let div = MemoryNode::element("div");
        root.append_child(&app);
        app.append_child(&div);
        div.append_child(&MemoryNode::new(NodeKind::HostText, None));

        let builder = SnapshotBuilder::new(BuildOptions {
            include_host_nodes: true,
            ..BuildOptions::default()
        });
        let tree = builder.build(&root.handle());

        let div_node = &tree.nodes[0].children[0];
        assert_eq!(div_node.name, "div");
        assert_eq!(div_node.children[0].name, "#text");
        assert_eq!(div_node.children[0].kind, NodeKind::HostText);
    }

    #[test]
    fn test_rebuild_of_unchanged_tree_is_equal() {
        let root = MemoryNode::root();
        let app = MemoryNode::component("App");
        root.append_child(&app);
        app.append_child(&MemoryNode::component("Child"));

        let builder = SnapshotBuilder::new(BuildOptions::default());
        let first = builder.build(&root.handle());
        let second = builder.build(&root.handle());
        assert_eq!(first, second);
    }

    #[test]
    fn test_surviving_node_keeps_id_after_mutation() {
        // [A, B[C]] -> [A, B'[C, D]]
        let root = MemoryNode::root();
        let a = MemoryNode::component("A");
        let b = MemoryNode::component("B");
        let c = MemoryNode::component("C");
        root.set_children(vec![Arc::clone(&a), Arc::clone(&b)]);
        b.append_child(&c);

        let builder = SnapshotBuilder::new(BuildOptions::default());
        let before = builder.build(&root.handle());
        let c_id = before.nodes[1].children[0].id.clone();

        let b2 = MemoryNode::component("B");
        let d = MemoryNode::component("D");
        b2.set_children(vec![Arc::clone(&c), Arc::clone(&d)]);
        root.set_children(vec![Arc::clone(&a), Arc::clone(&b2)]);

        let after = builder.build(&root.handle());
        assert_eq!(after.nodes[1].children[0].id, c_id);
        assert_eq!(after.nodes[1].children.len(), 2);
        assert_ne!(after.nodes[1].id, before.nodes[1].id);
        assert!(builder.resolve(&before.nodes[1].id).is_none());
    }

    #[test]
    fn test_empty_root_yields_empty_tree() {
        let root = MemoryNode::root();
        let tree = SnapshotBuilder::new(BuildOptions::default()).build(&root.handle());
        assert!(tree.is_empty());
        assert!(!tree.root_id.is_empty());
    }

    #[test]
    fn test_find_and_resolve_by_id() {
        let root = MemoryNode::root();
        let app = MemoryNode::component("App");
        root.append_child(&app);

        let builder = SnapshotBuilder::new(BuildOptions::default());
        let tree = builder.build(&root.handle());
        let id = &tree.nodes[0].id;

        assert_eq!(tree.find(id).map(|n| n.name.as_str()), Some("App"));
        let live = builder.resolve(id).unwrap();
        assert_eq!(live.identity(), app.handle().identity());
        assert_eq!(builder.id_of(&app.handle()).as_deref(), Some(id.as_str()));
    }
}
