//! Per-component detail extraction.

use std::collections::HashMap;

use serde::Serialize;

use super::hooks::{classify, HookKind};
use super::serialize::{SerializedValue, ValueSerializer};
use crate::host::{display_name, kind_of, NodeHandle, NodeKind, SourceLocation, MAX_LINK_WALK};
use crate::snapshot::SnapshotBuilder;

/// How a hook's kind was determined.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "by", content = "predicate")]
pub enum HookResolution {
    /// Runtime debug metadata named the hook.
    DebugMetadata,
    /// A shape predicate matched.
    Predicate(String),
    /// Nothing matched.
    Unresolved,
}

/// One hook of a component.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HookInfo {
    /// Call-order index.
    pub index: usize,
    /// Classified kind.
    pub kind: HookKind,
    /// Display name.
    pub name: String,
    /// Classification source.
    pub resolved_by: HookResolution,
    /// Rendered memoized state.
    pub value: SerializedValue,
}

/// A meaningful ancestor of a component.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AncestorInfo {
    /// Snapshot id, when the ancestor has been snapshotted.
    pub id: Option<String>,
    /// Display name.
    pub name: String,
    /// Node kind.
    pub kind: NodeKind,
}

/// Everything the panel shows for one selected component.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDetails {
    /// Snapshot id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Node kind.
    pub kind: NodeKind,
    /// Rendered props.
    pub props: SerializedValue,
    /// Rendered instance state.
    pub state: SerializedValue,
    /// Hooks in call order.
    pub hooks: Vec<HookInfo>,
    /// Meaningful ancestors, nearest first.
    pub ancestors: Vec<AncestorInfo>,
    /// Definition site, if known.
    pub source: Option<SourceLocation>,
}

/// Source coordinates supplied by the build tool, keyed by component name.
#[derive(Clone, Debug, Default)]
pub struct SourceHints {
    by_component: HashMap<String, SourceLocation>,
}

impl SourceHints {
    /// Empty hints.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record where `component` is defined.
    pub fn insert(&mut self, component: impl Into<String>, location: SourceLocation) {
        self.by_component.insert(component.into(), location);
    }

    /// Location of `component`.
    pub fn get(&self, component: &str) -> Option<&SourceLocation> {
        self.by_component.get(component)
    }

    /// Number of hinted components.
    pub fn len(&self) -> usize {
        self.by_component.len()
    }

    /// True when no hints are known.
    pub fn is_empty(&self) -> bool {
        self.by_component.is_empty()
    }
}

/// Builds [`ComponentDetails`] for live nodes.
#[derive(Clone, Debug)]
pub struct DetailExtractor {
    serializer: ValueSerializer,
    ancestor_depth: usize,
    hints: SourceHints,
}

impl DetailExtractor {
    /// Extractor rendering values with `serializer` and walking at most
    /// `ancestor_depth` parents.
    pub fn new(serializer: ValueSerializer, ancestor_depth: usize, hints: SourceHints) -> Self {
        Self {
            serializer,
            ancestor_depth,
            hints,
        }
    }

    /// Details of `node`, known to the panel as `id`.
    pub fn extract(&self, id: &str, node: &NodeHandle, builder: &SnapshotBuilder) -> ComponentDetails {
        let name = display_name(node);
        let source = node.debug_source().or_else(|| self.hints.get(&name).cloned());

        ComponentDetails {
            id: id.to_string(),
            kind: kind_of(node),
            props: self.serializer.serialize(&node.props()),
            state: self.serializer.serialize(&node.state()),
            hooks: self.hooks(node),
            ancestors: self.ancestors(node, builder),
            source,
            name,
        }
    }

    fn hooks(&self, node: &NodeHandle) -> Vec<HookInfo> {
        let debug_names = node.debug_hook_types();
        node.hook_slots()
            .iter()
            .enumerate()
            .map(|(index, slot)| {
                let from_debug = debug_names
                    .as_ref()
                    .and_then(|names| names.get(index))
                    .map(|name| HookKind::from_debug_name(name));

                let (kind, resolved_by) = match from_debug {
                    Some(kind) => (kind, HookResolution::DebugMetadata),
                    None => match classify(slot) {
                        Some(predicate) => (
                            predicate.kind,
                            HookResolution::Predicate(predicate.name.to_string()),
                        ),
                        None => (HookKind::Unknown, HookResolution::Unresolved),
                    },
                };

                HookInfo {
                    index,
                    kind,
                    name: kind.hook_name().to_string(),
                    resolved_by,
                    value: self.serializer.serialize(&slot.memoized_state),
                }
            })
            .collect()
    }

    fn ancestors(&self, node: &NodeHandle, builder: &SnapshotBuilder) -> Vec<AncestorInfo> {
        let mut out = Vec::new();
        let mut current = node.parent();
        let mut walked = 0;
        while let Some(parent) = current {
            if walked >= self.ancestor_depth || walked >= MAX_LINK_WALK {
                break;
            }
            walked += 1;
            let kind = kind_of(&parent);
            if kind.is_meaningful() {
                out.push(AncestorInfo {
                    id: builder.id_of(&parent),
                    name: display_name(&parent),
                    kind,
                });
            }
            current = parent.parent();
        }
        out
    }
}
