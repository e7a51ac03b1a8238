//! Value rendering and per-component details.
//!
//! - [`serialize`] - bounded serialization of host values
//! - [`hooks`] - hook classification
//! - [`details`] - props, state, hooks, ancestors and source of one node

pub mod details;
pub mod hooks;
pub mod serialize;

pub use details::{AncestorInfo, ComponentDetails, DetailExtractor, HookInfo, HookResolution, SourceHints};
pub use hooks::{HookKind, HookPredicate, HOOK_PREDICATES};
pub use serialize::{Entries, SerializedValue, SerializerOptions, ValueKind, ValueSerializer};
