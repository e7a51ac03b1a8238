//! The capability handle handed to a plugin.
//!
//! A [`PluginContext`] is built fresh for every registration. It only exposes
//! read access to the component tree, event emit/subscribe scoped to the
//! plugin, and RPC registration under the plugin's namespace. Everything the
//! plugin registers through it is recorded in a [`Footprint`] so unregistering
//! can remove exactly that.

use std::sync::{Arc, Mutex};

use serde_json::Value;

use super::events::{DevtoolsEvent, EventBus, EventHandler, EventKind, EventSubscriptionId};
use crate::inspect::ComponentDetails;
use crate::rpc::{RpcError, RpcHandler, RpcTable};
use crate::snapshot::SnapshotNode;
use crate::sync::lock;

/// Read access to the inspected component tree.
pub trait ComponentSource: Send + Sync {
    /// Root nodes of every known snapshot.
    fn component_tree(&self) -> Vec<SnapshotNode>;

    /// Details of the node known as `id`, if it is still live.
    fn component_details(&self, id: &str) -> Option<ComponentDetails>;
}

/// What one plugin registered.
#[derive(Debug, Default)]
pub struct Footprint {
    rpc_methods: Vec<String>,
    event_handlers: Vec<EventSubscriptionId>,
}

impl Footprint {
    /// Fully qualified RPC names.
    pub fn rpc_methods(&self) -> &[String] {
        &self.rpc_methods
    }

    /// Event subscription ids.
    pub fn event_handlers(&self) -> &[EventSubscriptionId] {
        &self.event_handlers
    }

    /// Forget everything and return the RPC names to remove.
    pub(crate) fn take_rpc_methods(&mut self) -> Vec<String> {
        self.event_handlers.clear();
        std::mem::take(&mut self.rpc_methods)
    }
}

pub(crate) type SharedFootprint = Arc<Mutex<Footprint>>;

/// Tree and detail reads.
#[derive(Clone)]
pub struct TreeAccess {
    source: Arc<dyn ComponentSource>,
}

impl std::fmt::Debug for TreeAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeAccess").finish_non_exhaustive()
    }
}

impl TreeAccess {
    /// Root nodes of every known snapshot.
    pub fn get_component_tree(&self) -> Vec<SnapshotNode> {
        self.source.component_tree()
    }

    /// Details for `id`.
    pub fn get_component_details(&self, id: &str) -> Option<ComponentDetails> {
        self.source.component_details(id)
    }
}

/// Event access attributed to one plugin.
#[derive(Clone, Debug)]
pub struct EventScope {
    plugin_id: String,
    bus: Arc<EventBus>,
    footprint: SharedFootprint,
}

impl EventScope {
    /// Publish `payload` as `kind`, attributed to this plugin.
    pub fn emit(&self, kind: EventKind, payload: Value) -> usize {
        self.bus
            .emit(&DevtoolsEvent::new(kind, payload, self.plugin_id.clone()))
    }

    /// Subscribe to `kind`. Removed automatically when the plugin goes away.
    pub fn on(&self, kind: EventKind, handler: EventHandler) -> EventSubscriptionId {
        let id = self.bus.on_owned(kind, &self.plugin_id, handler);
        lock(&self.footprint).event_handlers.push(id.clone());
        id
    }
}

/// RPC access namespaced under one plugin id.
#[derive(Clone, Debug)]
pub struct RpcScope {
    plugin_id: String,
    table: Arc<RpcTable>,
    footprint: SharedFootprint,
}

impl RpcScope {
    /// Fully qualified name of a local method.
    pub fn qualify(&self, name: &str) -> String {
        format!("{}.{}", self.plugin_id, name)
    }

    /// Register `name` as `"{plugin_id}.{name}"`.
    ///
    /// # Returns
    ///
    /// The fully qualified name.
    pub fn register_rpc(&self, name: &str, handler: RpcHandler) -> Result<String, RpcError> {
        let qualified = self.qualify(name);
        self.table.register(&qualified, handler)?;
        lock(&self.footprint).rpc_methods.push(qualified.clone());
        Ok(qualified)
    }

    /// Invoke any registered method by its fully qualified name.
    pub async fn call_rpc(&self, name: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.table.invoke(name, args).await
    }
}

/// Everything a plugin can reach.
#[derive(Clone, Debug)]
pub struct PluginContext {
    plugin_id: String,
    /// Tree reads.
    pub tree: TreeAccess,
    /// Events.
    pub events: EventScope,
    /// RPC.
    pub rpc: RpcScope,
}

impl PluginContext {
    pub(crate) fn new(
        plugin_id: &str,
        source: Arc<dyn ComponentSource>,
        bus: Arc<EventBus>,
        table: Arc<RpcTable>,
        footprint: SharedFootprint,
    ) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            tree: TreeAccess { source },
            events: EventScope {
                plugin_id: plugin_id.to_string(),
                bus,
                footprint: Arc::clone(&footprint),
            },
            rpc: RpcScope {
                plugin_id: plugin_id.to_string(),
                table,
                footprint,
            },
        }
    }

    /// Id of the plugin this context belongs to.
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// See [`TreeAccess::get_component_tree`].
    pub fn get_component_tree(&self) -> Vec<SnapshotNode> {
        self.tree.get_component_tree()
    }

    /// See [`TreeAccess::get_component_details`].
    pub fn get_component_details(&self, id: &str) -> Option<ComponentDetails> {
        self.tree.get_component_details(id)
    }

    /// See [`EventScope::emit`].
    pub fn emit(&self, kind: EventKind, payload: Value) -> usize {
        self.events.emit(kind, payload)
    }

    /// See [`EventScope::on`].
    pub fn on(&self, kind: EventKind, handler: EventHandler) -> EventSubscriptionId {
        self.events.on(kind, handler)
    }

    /// See [`RpcScope::register_rpc`].
    pub fn register_rpc(&self, name: &str, handler: RpcHandler) -> Result<String, RpcError> {
        self.rpc.register_rpc(name, handler)
    }

    /// See [`RpcScope::call_rpc`].
    pub async fn call_rpc(&self, name: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.rpc.call_rpc(name, args).await
    }
}
