//! In-memory host runtime.
//!
//! `MemoryNode` is a plain, mutable node tree implementing [`RuntimeNode`].
//! The demo binary renders with it, and tests use it to mutate a live tree
//! between commits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use super::value::HostValue;
use super::{HookSlot, HostError, NodeHandle, NodeIdentity, NodeKind, RuntimeNode, SourceLocation};
use crate::sync::{read, write};

static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

/// A node of the in-memory runtime.
#[derive(Debug)]
pub struct MemoryNode {
    identity: NodeIdentity,
    tag: u32,
    name: RwLock<Option<String>>,
    props: RwLock<HostValue>,
    state: RwLock<HostValue>,
    hooks: RwLock<Vec<HookSlot>>,
    debug_hook_types: RwLock<Option<Vec<String>>>,
    source: RwLock<Option<SourceLocation>>,
    parent: RwLock<Weak<MemoryNode>>,
    children: RwLock<Vec<Arc<MemoryNode>>>,
}

impl MemoryNode {
    /// Create a detached node of `kind`.
    pub fn new(kind: NodeKind, name: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            identity: NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed),
            tag: kind.tag(),
            name: RwLock::new(name.map(String::from)),
            props: RwLock::new(HostValue::object(Vec::<(String, HostValue)>::new())),
            state: RwLock::new(HostValue::Undefined),
            hooks: RwLock::new(Vec::new()),
            debug_hook_types: RwLock::new(None),
            source: RwLock::new(None),
            parent: RwLock::new(Weak::new()),
            children: RwLock::new(Vec::new()),
        })
    }

    /// Create a root node.
    pub fn root() -> Arc<Self> {
        Self::new(NodeKind::HostRoot, None)
    }

    /// Create a function component node.
    pub fn component(name: &str) -> Arc<Self> {
        Self::new(NodeKind::FunctionComponent, Some(name))
    }

    /// Create a platform element node.
    pub fn element(tag_name: &str) -> Arc<Self> {
        Self::new(NodeKind::HostComponent, Some(tag_name))
    }

    /// Type-erased handle.
    pub fn handle(self: &Arc<Self>) -> NodeHandle {
        Arc::clone(self) as NodeHandle
    }

    /// Append a child.
    pub fn append_child(self: &Arc<Self>, child: &Arc<MemoryNode>) {
        *write(&child.parent) = Arc::downgrade(self);
        write(&self.children).push(Arc::clone(child));
    }

    /// Replace all children. Nodes kept across the replacement keep their
    /// identity; dropped nodes are detached.
    pub fn set_children(self: &Arc<Self>, children: Vec<Arc<MemoryNode>>) {
        let previous = std::mem::take(&mut *write(&self.children));
        for old in &previous {
            if !children.iter().any(|c| Arc::ptr_eq(c, old)) {
                *write(&old.parent) = Weak::new();
            }
        }
        for child in &children {
            *write(&child.parent) = Arc::downgrade(self);
        }
        *write(&self.children) = children;
    }

    /// Current children.
    pub fn child_nodes(&self) -> Vec<Arc<MemoryNode>> {
        read(&self.children).clone()
    }

    /// Rename the node's type.
    pub fn set_name(&self, name: &str) {
        *write(&self.name) = Some(name.to_string());
    }

    /// Replace props.
    pub fn set_props(&self, props: HostValue) {
        *write(&self.props) = props;
    }

    /// Replace instance state.
    pub fn set_state(&self, state: HostValue) {
        *write(&self.state) = state;
    }

    /// Replace hook slots.
    pub fn set_hooks(&self, hooks: Vec<HookSlot>) {
        *write(&self.hooks) = hooks;
    }

    /// Record debug hook-type names.
    pub fn set_debug_hook_types(&self, names: Option<Vec<String>>) {
        *write(&self.debug_hook_types) = names;
    }

    /// Record the definition site.
    pub fn set_source(&self, source: Option<SourceLocation>) {
        *write(&self.source) = source;
    }

    fn parent_node(&self) -> Option<Arc<MemoryNode>> {
        read(&self.parent).upgrade()
    }
}

impl RuntimeNode for MemoryNode {
    fn identity(&self) -> NodeIdentity {
        self.identity
    }

    fn tag(&self) -> u32 {
        self.tag
    }

    fn type_name(&self) -> Option<String> {
        read(&self.name).clone()
    }

    fn parent(&self) -> Option<NodeHandle> {
        self.parent_node().map(|p| p as NodeHandle)
    }

    fn first_child(&self) -> Option<NodeHandle> {
        read(&self.children).first().map(|c| Arc::clone(c) as NodeHandle)
    }

    fn next_sibling(&self) -> Option<NodeHandle> {
        let parent = self.parent_node()?;
        let siblings = read(&parent.children);
        let index = siblings
            .iter()
            .position(|s| std::ptr::eq(Arc::as_ptr(s), self))?;
        siblings.get(index + 1).map(|s| Arc::clone(s) as NodeHandle)
    }

    fn props(&self) -> HostValue {
        read(&self.props).clone()
    }

    fn state(&self) -> HostValue {
        read(&self.state).clone()
    }

    fn hook_slots(&self) -> Vec<HookSlot> {
        read(&self.hooks).clone()
    }

    fn debug_hook_types(&self) -> Option<Vec<String>> {
        read(&self.debug_hook_types).clone()
    }

    fn debug_source(&self) -> Option<SourceLocation> {
        read(&self.source).clone()
    }

    fn override_prop(&self, path: &[String], value: HostValue) -> Result<(), HostError> {
        let (last, parents) = path
            .split_last()
            .ok_or_else(|| HostError::Thrown("empty prop path".to_string()))?;

        let mut target = read(&self.props).clone();
        for segment in parents {
            target = target.get(segment).ok_or_else(|| {
                HostError::Thrown(format!("cannot read property '{segment}' of undefined"))
            })?;
        }

        match target {
            HostValue::Object(object) => {
                object.set(last.clone(), value);
                Ok(())
            }
            other => Err(HostError::Thrown(format!(
                "cannot set property '{last}' on {}",
                other.type_name()
            ))),
        }
    }
}
