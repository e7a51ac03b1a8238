//! Stable snapshot ids for live nodes.
//!
//! Ids are derived from node identity, so a node that survives a rebuild keeps
//! its id. Runtimes with double-buffered nodes commit the alternate twin every
//! other render; either identity maps to the same id. Ids are tracked per root
//! and pruned when a rebuild of that root no longer reaches them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use crate::host::{NodeHandle, NodeIdentity, RuntimeNode};

#[derive(Debug)]
struct Entry {
    identities: Vec<NodeIdentity>,
    node: Weak<dyn RuntimeNode>,
}

/// Bidirectional map between node identities and snapshot ids.
#[derive(Default)]
pub struct IdRegistry {
    by_identity: HashMap<NodeIdentity, String>,
    nodes: HashMap<String, Entry>,
    members: HashMap<NodeIdentity, HashSet<String>>,
    next_id: u64,
}

impl std::fmt::Debug for IdRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdRegistry")
            .field("ids", &self.nodes.len())
            .field("roots", &self.members.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl IdRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for `node` within `root`, assigning one on first sight.
    pub fn assign(&mut self, root: NodeIdentity, node: &NodeHandle) -> String {
        let identity = node.identity();
        let existing = self
            .by_identity
            .get(&identity)
            .or_else(|| node.alternate().and_then(|alt| self.by_identity.get(&alt)))
            .cloned();

        let id = match existing {
            Some(id) => id,
            None => {
                self.next_id += 1;
                format!("n{}", self.next_id)
            }
        };

        self.by_identity.insert(identity, id.clone());
        let weak = Arc::downgrade(node);
        let entry = self.nodes.entry(id.clone()).or_insert_with(|| Entry {
            identities: Vec::new(),
            node: Weak::clone(&weak),
        });
        if !entry.identities.contains(&identity) {
            entry.identities.push(identity);
        }
        // Latest committed handle wins.
        entry.node = weak;

        self.members.entry(root).or_default().insert(id.clone());
        id
    }

    /// Id already assigned to `identity`.
    pub fn id_of(&self, identity: NodeIdentity) -> Option<&str> {
        self.by_identity.get(&identity).map(String::as_str)
    }

    /// Live node behind `id`, if it is still alive.
    pub fn resolve(&self, id: &str) -> Option<NodeHandle> {
        self.nodes.get(id)?.node.upgrade()
    }

    /// Drop ids of `root` that are not in `seen`.
    pub fn retain(&mut self, root: NodeIdentity, seen: &HashSet<String>) {
        let Some(members) = self.members.get_mut(&root) else {
            return;
        };
        let stale: Vec<String> = members.difference(seen).cloned().collect();
        members.retain(|id| seen.contains(id));

        for id in stale {
            if let Some(entry) = self.nodes.remove(&id) {
                for identity in entry.identities {
                    self.by_identity.remove(&identity);
                }
            }
        }
    }

    /// Forget every id of `root`.
    pub fn forget_root(&mut self, root: NodeIdentity) {
        self.retain(root, &HashSet::new());
        self.members.remove(&root);
    }

    /// Number of live ids.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when no ids are assigned.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryNode;
    use crate::host::{HostValue, NodeKind};

    struct Twin {
        identity: NodeIdentity,
        alternate: NodeIdentity,
    }

    impl RuntimeNode for Twin {
        fn identity(&self) -> NodeIdentity {
            self.identity
        }
        fn alternate(&self) -> Option<NodeIdentity> {
            Some(self.alternate)
        }
        fn tag(&self) -> u32 {
            NodeKind::FunctionComponent.tag()
        }
        fn type_name(&self) -> Option<String> {
            Some("Twin".to_string())
        }
        fn parent(&self) -> Option<NodeHandle> {
            None
        }
        fn first_child(&self) -> Option<NodeHandle> {
            None
        }
        fn next_sibling(&self) -> Option<NodeHandle> {
            None
        }
        fn props(&self) -> HostValue {
            HostValue::Undefined
        }
    }

    #[test]
    fn test_same_identity_keeps_id() {
        let mut ids = IdRegistry::new();
        let node = MemoryNode::component("A").handle();
        let first = ids.assign(1, &node);
        let second = ids.assign(1, &node);
        assert_eq!(first, second);
        assert!(ids.resolve(&first).is_some());
    }

    #[test]
    fn test_alternate_identity_maps_to_same_id() {
        let mut ids = IdRegistry::new();
        let current: NodeHandle = Arc::new(Twin {
            identity: 100,
            alternate: 200,
        });
        let work_in_progress: NodeHandle = Arc::new(Twin {
            identity: 200,
            alternate: 100,
        });

        let a = ids.assign(1, &current);
        let b = ids.assign(1, &work_in_progress);
        assert_eq!(a, b);
        assert_eq!(ids.id_of(200), Some(a.as_str()));
    }

    #[test]
    fn test_retain_prunes_unseen_ids() {
        let mut ids = IdRegistry::new();
        let keep = MemoryNode::component("Keep").handle();
        let gone = MemoryNode::component("Gone").handle();
        let keep_id = ids.assign(1, &keep);
        let gone_id = ids.assign(1, &gone);

        ids.retain(1, &HashSet::from([keep_id.clone()]));

        assert!(ids.resolve(&keep_id).is_some());
        assert!(ids.resolve(&gone_id).is_none());
        assert_eq!(ids.id_of(gone.identity()), None);
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn test_dropped_node_no_longer_resolves() {
        let mut ids = IdRegistry::new();
        let id = {
            let node = MemoryNode::component("Temp").handle();
            ids.assign(1, &node)
        };
        assert!(ids.resolve(&id).is_none());
    }
}
