//! Typed publish/subscribe bus shared by the core and plugins.
//!
//! Handlers are invoked synchronously, in registration order, outside the bus
//! lock. Each handler is isolated: an error or panic in one is logged and the
//! remaining handlers still run.
//!
//! # Events
//!
//! - `tree_updated`: a snapshot was rebuilt; payload is the snapshot tree
//! - `node_selected`: the panel selected a node; payload `{id}`
//! - `prop_changed`: a prop was edited; payload `{id, path, value}`
//! - `plugin_registered` / `plugin_unregistered`: payload `{id, name}`
//! - anything else is a custom event named by the emitter

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sync::lock;

/// Unique identifier for an event subscription.
pub type EventSubscriptionId = String;

/// Event handler. Returning an error only logs it.
pub type EventHandler = Arc<dyn Fn(&DevtoolsEvent) -> anyhow::Result<()> + Send + Sync>;

/// What happened.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    /// A snapshot was rebuilt.
    TreeUpdated,
    /// A node was selected.
    NodeSelected,
    /// A prop was edited.
    PropChanged,
    /// A plugin finished registering.
    PluginRegistered,
    /// A plugin was removed.
    PluginUnregistered,
    /// Plugin-defined event.
    Custom(String),
}

impl EventKind {
    /// Wire name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::TreeUpdated => "tree_updated",
            Self::NodeSelected => "node_selected",
            Self::PropChanged => "prop_changed",
            Self::PluginRegistered => "plugin_registered",
            Self::PluginUnregistered => "plugin_unregistered",
            Self::Custom(name) => name,
        }
    }
}

impl From<&str> for EventKind {
    fn from(name: &str) -> Self {
        match name {
            "tree_updated" => Self::TreeUpdated,
            "node_selected" => Self::NodeSelected,
            "prop_changed" => Self::PropChanged,
            "plugin_registered" => Self::PluginRegistered,
            "plugin_unregistered" => Self::PluginUnregistered,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<String> for EventKind {
    fn from(name: String) -> Self {
        Self::from(name.as_str())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One published event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DevtoolsEvent {
    /// Event kind.
    pub kind: EventKind,
    /// Event data.
    pub payload: Value,
    /// Emitter: `core` or a plugin id.
    pub source: String,
}

impl DevtoolsEvent {
    /// Build an event.
    pub fn new(kind: EventKind, payload: Value, source: impl Into<String>) -> Self {
        Self {
            kind,
            payload,
            source: source.into(),
        }
    }
}

struct Registered {
    id: EventSubscriptionId,
    owner: Option<String>,
    handler: EventHandler,
}

#[derive(Default)]
struct BusState {
    handlers: HashMap<EventKind, Vec<Registered>>,
    next_id: u64,
}

/// The event bus.
#[derive(Default)]
pub struct EventBus {
    state: Mutex<BusState>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("EventBus")
            .field("event_count", &state.handlers.len())
            .field("next_id", &state.next_id)
            .finish()
    }
}

impl EventBus {
    /// Empty shared bus.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe to `kind`.
    ///
    /// # Returns
    ///
    /// A unique id that can be passed to [`EventBus::off`].
    pub fn on(&self, kind: EventKind, handler: EventHandler) -> EventSubscriptionId {
        self.insert(kind, None, handler)
    }

    /// Subscribe on behalf of `owner`, so [`EventBus::off_owner`] can remove it.
    pub fn on_owned(&self, kind: EventKind, owner: &str, handler: EventHandler) -> EventSubscriptionId {
        self.insert(kind, Some(owner.to_string()), handler)
    }

    fn insert(&self, kind: EventKind, owner: Option<String>, handler: EventHandler) -> EventSubscriptionId {
        let mut state = lock(&self.state);
        let id = format!("evt_{}", state.next_id);
        state.next_id += 1;
        log::debug!("Registered event handler '{}' for '{}'", id, kind);
        state.handlers.entry(kind).or_default().push(Registered {
            id: id.clone(),
            owner,
            handler,
        });
        id
    }

    /// Remove a subscription. Unknown ids are a no-op.
    pub fn off(&self, id: &str) -> bool {
        let mut state = lock(&self.state);
        let mut removed = false;
        for handlers in state.handlers.values_mut() {
            let before = handlers.len();
            handlers.retain(|h| h.id != id);
            removed |= handlers.len() != before;
        }
        state.handlers.retain(|_, v| !v.is_empty());
        removed
    }

    /// Remove every subscription made on behalf of `owner`.
    ///
    /// # Returns
    ///
    /// The number of removed handlers.
    pub fn off_owner(&self, owner: &str) -> usize {
        let mut state = lock(&self.state);
        let mut removed = 0;
        for handlers in state.handlers.values_mut() {
            let before = handlers.len();
            handlers.retain(|h| h.owner.as_deref() != Some(owner));
            removed += before - handlers.len();
        }
        state.handlers.retain(|_, v| !v.is_empty());
        if removed > 0 {
            log::debug!("Removed {} event handler(s) owned by '{}'", removed, owner);
        }
        removed
    }

    /// Deliver `event` to every handler of its kind.
    ///
    /// # Returns
    ///
    /// The number of handlers that completed without error.
    pub fn emit(&self, event: &DevtoolsEvent) -> usize {
        let handlers: Vec<(EventSubscriptionId, EventHandler)> = lock(&self.state)
            .handlers
            .get(&event.kind)
            .map(|v| v.iter().map(|h| (h.id.clone(), Arc::clone(&h.handler))).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => log::warn!("Event handler '{}' for '{}' failed: {:#}", id, event.kind, e),
                Err(_) => log::error!("Event handler '{}' for '{}' panicked", id, event.kind),
            }
        }
        delivered
    }

    /// Whether anything listens to `kind`.
    pub fn has_handlers(&self, kind: &EventKind) -> bool {
        lock(&self.state)
            .handlers
            .get(kind)
            .is_some_and(|v| !v.is_empty())
    }

    /// Total handlers across all kinds.
    pub fn handler_count(&self) -> usize {
        lock(&self.state).handlers.values().map(Vec::len).sum()
    }

    /// Kinds with at least one handler.
    pub fn registered_kinds(&self) -> Vec<EventKind> {
        lock(&self.state).handlers.keys().cloned().collect()
    }

    /// Drop every handler.
    pub fn clear(&self) {
        lock(&self.state).handlers.clear();
    }
}
