//! Model of the inspected host runtime.
//!
//! The inspector never owns runtime nodes. It reaches them through the
//! [`RuntimeNode`] trait, which mirrors what a tree-shaped UI runtime keeps
//! per instantiated element: an identity, a raw type tag, parent/child/sibling
//! links, props, state, hook slots and optional debug metadata.
//!
//! # Submodules
//!
//! - [`value`] - host values (shared, mutable, possibly cyclic)
//! - [`dom`] - the document the runtime renders into
//! - [`memory`] - an in-memory runtime used by the demo and tests
//! - [`hook`] - the global hook object and its commit-handler decorator
//! - [`adapter`] - attaches to the hook and discovers running roots

pub mod adapter;
pub mod dom;
pub mod hook;
pub mod memory;
pub mod value;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use value::{HostArray, HostObject, HostValue, PropertySlot};

/// Upper bound on links followed in one direction, in case a host hands us a
/// corrupted (cyclic) sibling or parent chain.
pub const MAX_LINK_WALK: usize = 100_000;

/// Stable identity of a live node, assigned by the host.
pub type NodeIdentity = u64;

/// Shared handle to a live node.
pub type NodeHandle = Arc<dyn RuntimeNode>;

/// Error raised by the host while the inspector touches it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    /// The host threw while running its own code.
    #[error("host threw: {0}")]
    Thrown(String),
    /// The runtime does not expose the requested write path.
    #[error("not supported by this runtime: {0}")]
    Unsupported(String),
}

/// Where a component was defined.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceLocation {
    /// Source file path.
    pub file_name: String,
    /// 1-based line.
    pub line: u32,
    /// 1-based column, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

/// One entry of a node's hook list.
#[derive(Clone, Debug)]
pub struct HookSlot {
    /// The memoized state stored for the hook.
    pub memoized_state: HostValue,
    /// Update queue, present for stateful hooks.
    pub queue: Option<HostValue>,
}

impl HookSlot {
    /// Slot with memoized state and no queue.
    pub fn new(memoized_state: HostValue) -> Self {
        Self {
            memoized_state,
            queue: None,
        }
    }

    /// Slot with memoized state and an update queue.
    pub fn with_queue(memoized_state: HostValue, queue: HostValue) -> Self {
        Self {
            memoized_state,
            queue: Some(queue),
        }
    }
}

/// Decoded node type tag.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Function component.
    FunctionComponent,
    /// Class component.
    ClassComponent,
    /// Root of a rendered tree.
    HostRoot,
    /// Platform element (e.g. `div`).
    HostComponent,
    /// Platform text node.
    HostText,
    /// Fragment.
    Fragment,
    /// Mode boundary (strict mode and friends).
    Mode,
    /// Context consumer.
    ContextConsumer,
    /// Context provider.
    ContextProvider,
    /// Forward-ref wrapper.
    ForwardRef,
    /// Profiler boundary.
    Profiler,
    /// Suspense boundary.
    Suspense,
    /// Memo wrapper.
    Memo,
    /// Memo wrapper around a plain function.
    SimpleMemo,
    /// Lazy component.
    Lazy,
    /// Tag this build does not know.
    Unknown(u32),
}

impl NodeKind {
    /// Decode a raw tag.
    pub fn from_tag(tag: u32) -> Self {
        match tag {
            0 => Self::FunctionComponent,
            1 => Self::ClassComponent,
            3 => Self::HostRoot,
            5 => Self::HostComponent,
            6 => Self::HostText,
            7 => Self::Fragment,
            8 => Self::Mode,
            9 => Self::ContextConsumer,
            10 => Self::ContextProvider,
            11 => Self::ForwardRef,
            12 => Self::Profiler,
            13 => Self::Suspense,
            14 => Self::Memo,
            15 => Self::SimpleMemo,
            16 => Self::Lazy,
            other => Self::Unknown(other),
        }
    }

    /// Raw tag for this kind.
    pub fn tag(self) -> u32 {
        match self {
            Self::FunctionComponent => 0,
            Self::ClassComponent => 1,
            Self::HostRoot => 3,
            Self::HostComponent => 5,
            Self::HostText => 6,
            Self::Fragment => 7,
            Self::Mode => 8,
            Self::ContextConsumer => 9,
            Self::ContextProvider => 10,
            Self::ForwardRef => 11,
            Self::Profiler => 12,
            Self::Suspense => 13,
            Self::Memo => 14,
            Self::SimpleMemo => 15,
            Self::Lazy => 16,
            Self::Unknown(tag) => tag,
        }
    }

    /// Whether nodes of this kind are user-level components.
    pub fn is_meaningful(self) -> bool {
        matches!(
            self,
            Self::FunctionComponent
                | Self::ClassComponent
                | Self::ForwardRef
                | Self::Memo
                | Self::SimpleMemo
        )
    }

    /// Whether nodes of this kind are platform (host) nodes.
    pub fn is_host(self) -> bool {
        matches!(self, Self::HostComponent | Self::HostText)
    }

    fn fallback_name(self) -> &'static str {
        match self {
            Self::HostRoot => "Root",
            Self::HostText => "#text",
            Self::Fragment => "Fragment",
            Self::Mode => "Mode",
            Self::ContextConsumer => "Context.Consumer",
            Self::ContextProvider => "Context.Provider",
            Self::Profiler => "Profiler",
            Self::Suspense => "Suspense",
            Self::Lazy => "Lazy",
            _ => "Anonymous",
        }
    }
}

/// A live node of the host runtime.
///
/// Every method is a read of host-owned memory except [`override_prop`],
/// the single write path, which hosts may refuse.
///
/// [`override_prop`]: RuntimeNode::override_prop
pub trait RuntimeNode: Send + Sync {
    /// Stable identity for as long as the node lives.
    fn identity(&self) -> NodeIdentity;

    /// Identity of the node's double-buffered twin, if the runtime keeps one.
    fn alternate(&self) -> Option<NodeIdentity> {
        None
    }

    /// Raw type tag.
    fn tag(&self) -> u32;

    /// Component or element type name, when the runtime knows it.
    fn type_name(&self) -> Option<String>;

    /// Parent node.
    fn parent(&self) -> Option<NodeHandle>;

    /// First child node.
    fn first_child(&self) -> Option<NodeHandle>;

    /// Next sibling node.
    fn next_sibling(&self) -> Option<NodeHandle>;

    /// Current props.
    fn props(&self) -> HostValue;

    /// Current instance state (class components); `Undefined` otherwise.
    fn state(&self) -> HostValue {
        HostValue::Undefined
    }

    /// Hook slots in call order.
    fn hook_slots(&self) -> Vec<HookSlot> {
        Vec::new()
    }

    /// Hook type names recorded by the runtime in debug builds.
    fn debug_hook_types(&self) -> Option<Vec<String>> {
        None
    }

    /// Source coordinate retained by the runtime in debug builds.
    fn debug_source(&self) -> Option<SourceLocation> {
        None
    }

    /// Overwrite one prop at `path`. Fragile: the host decides whether and
    /// when the change is rendered.
    fn override_prop(&self, path: &[String], value: HostValue) -> Result<(), HostError> {
        let _ = (path, value);
        Err(HostError::Unsupported("override_prop".to_string()))
    }
}

/// Decoded kind of a node.
pub fn kind_of(node: &NodeHandle) -> NodeKind {
    NodeKind::from_tag(node.tag())
}

/// Human-readable name of a node.
pub fn display_name(node: &NodeHandle) -> String {
    node.type_name()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| kind_of(node).fallback_name().to_string())
}

/// Direct children of `node` in sibling order.
pub fn children(node: &NodeHandle) -> Vec<NodeHandle> {
    let mut out = Vec::new();
    let mut current = node.first_child();
    while let Some(child) = current {
        if out.len() >= MAX_LINK_WALK {
            log::warn!("Sibling chain under '{}' exceeds {} links, truncating", display_name(node), MAX_LINK_WALK);
            break;
        }
        current = child.next_sibling();
        out.push(child);
    }
    out
}

/// Topmost ancestor of `node` (the node itself when it has no parent).
pub fn root_of(node: &NodeHandle) -> NodeHandle {
    let mut current = Arc::clone(node);
    for _ in 0..MAX_LINK_WALK {
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }
    current
}
