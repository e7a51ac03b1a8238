//! Third-party extensions.
//!
//! A [`Plugin`] is a definition: id, name, optional async `setup`/`teardown`,
//! and RPC methods and event handlers to attach. The [`PluginManager`] attaches
//! a plugin through a fresh [`PluginContext`] and tracks its footprint, so a
//! failed setup, a disable, or an unregister removes exactly what that plugin
//! added and nothing else.
//!
//! # Lifecycle
//!
//! ```text
//! register ──► attach (rpc, on, setup) ──ok──► enabled
//!                  │                             │  set_enabled(false)
//!                  └─err──► rolled back          ▼
//!                                             disabled ──set_enabled(true)──► attach
//! unregister: teardown (errors logged) ──► detach ──► removed
//! ```

pub mod context;
pub mod events;

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::json;

use crate::rpc::{RpcError, RpcHandler, RpcTable};
use crate::sync::lock;

pub use context::{ComponentSource, EventScope, Footprint, PluginContext, RpcScope, TreeAccess};
pub use events::{DevtoolsEvent, EventBus, EventHandler, EventKind, EventSubscriptionId};

use context::SharedFootprint;

/// Id reserved for the inspector's own methods and events.
pub const CORE_ID: &str = "core";

/// Async setup hook.
pub type SetupFn = Arc<dyn Fn(PluginContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Async teardown hook.
pub type TeardownFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Plugin manager errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PluginError {
    /// A plugin with this id is already registered.
    #[error("plugin '{0}' is already registered")]
    AlreadyRegistered(String),
    /// The id belongs to the inspector itself.
    #[error("plugin id '{0}' is reserved")]
    ReservedId(String),
    /// No plugin with this id.
    #[error("plugin '{0}' not found")]
    NotFound(String),
    /// Setup failed; the registration was rolled back.
    #[error("plugin '{id}' setup failed: {message}")]
    Setup {
        /// Plugin id.
        id: String,
        /// Setup error.
        message: String,
    },
    /// Attaching an RPC method failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// A plugin definition.
pub struct Plugin {
    id: String,
    name: String,
    setup: Option<SetupFn>,
    teardown: Option<TeardownFn>,
    rpc: Vec<(String, RpcHandler)>,
    on: Vec<(EventKind, EventHandler)>,
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let methods: Vec<&str> = self.rpc.iter().map(|(name, _)| name.as_str()).collect();
        let events: Vec<&EventKind> = self.on.iter().map(|(kind, _)| kind).collect();
        f.debug_struct("Plugin")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("rpc", &methods)
            .field("on", &events)
            .field("has_setup", &self.setup.is_some())
            .field("has_teardown", &self.teardown.is_some())
            .finish()
    }
}

impl Plugin {
    /// Start defining a plugin.
    pub fn builder(id: impl Into<String>, name: impl Into<String>) -> PluginBuilder {
        PluginBuilder {
            plugin: Plugin {
                id: id.into(),
                name: name.into(),
                setup: None,
                teardown: None,
                rpc: Vec::new(),
                on: Vec::new(),
            },
        }
    }

    /// Plugin id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Builder for [`Plugin`].
#[derive(Debug)]
pub struct PluginBuilder {
    plugin: Plugin,
}

impl PluginBuilder {
    /// Run `f` each time the plugin is attached.
    pub fn setup<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.plugin.setup = Some(Arc::new(
            move |ctx: PluginContext| -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(f(ctx)) },
        ));
        self
    }

    /// Run `f` each time the plugin is detached.
    pub fn teardown<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.plugin.teardown = Some(Arc::new(move || -> BoxFuture<'static, anyhow::Result<()>> {
            Box::pin(f())
        }));
        self
    }

    /// Expose `name` as `"{id}.{name}"`.
    pub fn rpc(mut self, name: impl Into<String>, handler: RpcHandler) -> Self {
        self.plugin.rpc.push((name.into(), handler));
        self
    }

    /// Subscribe to `kind`.
    pub fn on(mut self, kind: EventKind, handler: EventHandler) -> Self {
        self.plugin.on.push((kind, handler));
        self
    }

    /// Finish the definition.
    pub fn build(self) -> Plugin {
        self.plugin
    }
}

/// A registered plugin as listed to the panel.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct PluginInfo {
    /// Plugin id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Whether the plugin is attached.
    pub enabled: bool,
}

struct Entry {
    plugin: Arc<Plugin>,
    enabled: bool,
    footprint: SharedFootprint,
}

/// Registers, toggles and removes plugins.
pub struct PluginManager {
    entries: Mutex<Vec<Entry>>,
    source: Arc<dyn ComponentSource>,
    bus: Arc<EventBus>,
    table: Arc<RpcTable>,
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins", &self.get_all())
            .field("bus", &self.bus)
            .finish()
    }
}

impl PluginManager {
    /// Manager attaching plugins to `bus` and `table`, reading from `source`.
    pub fn new(source: Arc<dyn ComponentSource>, bus: Arc<EventBus>, table: Arc<RpcTable>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            source,
            bus,
            table,
        }
    }

    /// Shared event bus.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Shared RPC table.
    pub fn table(&self) -> &Arc<RpcTable> {
        &self.table
    }

    /// Register and attach `plugin`.
    ///
    /// # Errors
    ///
    /// - [`PluginError::ReservedId`] for the `core` id
    /// - [`PluginError::AlreadyRegistered`] if the id is taken; the existing
    ///   plugin is left untouched
    /// - [`PluginError::Setup`] or [`PluginError::Rpc`] if attaching fails;
    ///   nothing the plugin added survives
    pub async fn register(&self, plugin: Plugin) -> Result<(), PluginError> {
        if plugin.id == CORE_ID {
            return Err(PluginError::ReservedId(plugin.id));
        }

        let plugin = Arc::new(plugin);
        let footprint = SharedFootprint::default();
        {
            let mut entries = lock(&self.entries);
            if entries.iter().any(|e| e.plugin.id == plugin.id) {
                log::warn!("Plugin '{}' is already registered", plugin.id);
                return Err(PluginError::AlreadyRegistered(plugin.id.clone()));
            }
            entries.push(Entry {
                plugin: Arc::clone(&plugin),
                enabled: true,
                footprint: Arc::clone(&footprint),
            });
        }

        if let Err(e) = self.attach(&plugin, &footprint).await {
            self.detach(&plugin.id, &footprint);
            lock(&self.entries).retain(|e| !Arc::ptr_eq(&e.plugin, &plugin));
            log::warn!("Plugin '{}' registration rolled back: {}", plugin.id, e);
            return Err(e);
        }

        log::info!("Registered plugin '{}' ({})", plugin.id, plugin.name);
        self.bus.emit(&DevtoolsEvent::new(
            EventKind::PluginRegistered,
            json!({ "id": plugin.id, "name": plugin.name }),
            CORE_ID,
        ));
        Ok(())
    }

    /// Tear down and remove `id`.
    pub async fn unregister(&self, id: &str) -> Result<(), PluginError> {
        let entry = {
            let mut entries = lock(&self.entries);
            let index = entries
                .iter()
                .position(|e| e.plugin.id == id)
                .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
            entries.remove(index)
        };

        if entry.enabled {
            run_teardown(&entry.plugin).await;
            self.detach(id, &entry.footprint);
        }

        log::info!("Unregistered plugin '{}'", id);
        self.bus.emit(&DevtoolsEvent::new(
            EventKind::PluginUnregistered,
            json!({ "id": entry.plugin.id, "name": entry.plugin.name }),
            CORE_ID,
        ));
        Ok(())
    }

    /// Attach or detach `id` while keeping it registered.
    ///
    /// Re-enabling runs setup again; if that fails the plugin stays disabled.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), PluginError> {
        let (plugin, footprint) = {
            let mut entries = lock(&self.entries);
            let entry = entries
                .iter_mut()
                .find(|e| e.plugin.id == id)
                .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
            if entry.enabled == enabled {
                return Ok(());
            }
            entry.enabled = enabled;
            (Arc::clone(&entry.plugin), Arc::clone(&entry.footprint))
        };

        if enabled {
            if let Err(e) = self.attach(&plugin, &footprint).await {
                self.detach(id, &footprint);
                self.mark(id, false);
                log::warn!("Plugin '{}' could not be re-enabled: {}", id, e);
                return Err(e);
            }
            log::info!("Enabled plugin '{}'", id);
        } else {
            run_teardown(&plugin).await;
            self.detach(id, &footprint);
            log::info!("Disabled plugin '{}'", id);
        }
        Ok(())
    }

    /// Registered plugins in registration order.
    pub fn get_all(&self) -> Vec<PluginInfo> {
        lock(&self.entries)
            .iter()
            .map(|e| PluginInfo {
                id: e.plugin.id.clone(),
                name: e.plugin.name.clone(),
                enabled: e.enabled,
            })
            .collect()
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        lock(&self.entries).iter().any(|e| e.plugin.id == id)
    }

    /// Unregister every plugin, then clear the bus and the RPC table.
    pub async fn teardown_all(&self) {
        let ids: Vec<String> = self.get_all().into_iter().map(|info| info.id).collect();
        for id in ids {
            if let Err(e) = self.unregister(&id).await {
                log::warn!("Failed to unregister plugin '{}': {}", id, e);
            }
        }
        self.bus.clear();
        self.table.clear();
    }

    fn context_for(&self, plugin_id: &str, footprint: &SharedFootprint) -> PluginContext {
        PluginContext::new(
            plugin_id,
            Arc::clone(&self.source),
            Arc::clone(&self.bus),
            Arc::clone(&self.table),
            Arc::clone(footprint),
        )
    }

    async fn attach(&self, plugin: &Plugin, footprint: &SharedFootprint) -> Result<(), PluginError> {
        let ctx = self.context_for(&plugin.id, footprint);
        for (name, handler) in &plugin.rpc {
            ctx.register_rpc(name, Arc::clone(handler))?;
        }
        for (kind, handler) in &plugin.on {
            ctx.on(kind.clone(), Arc::clone(handler));
        }
        if let Some(setup) = &plugin.setup {
            setup(ctx).await.map_err(|e| PluginError::Setup {
                id: plugin.id.clone(),
                message: format!("{e:#}"),
            })?;
        }
        Ok(())
    }

    fn detach(&self, plugin_id: &str, footprint: &SharedFootprint) {
        let methods = lock(footprint).take_rpc_methods();
        for method in &methods {
            self.table.unregister(method);
        }
        let handlers = self.bus.off_owner(plugin_id);
        log::debug!(
            "Detached plugin '{}': {} method(s), {} handler(s)",
            plugin_id,
            methods.len(),
            handlers
        );
    }

    fn mark(&self, id: &str, enabled: bool) {
        if let Some(entry) = lock(&self.entries).iter_mut().find(|e| e.plugin.id == id) {
            entry.enabled = enabled;
        }
    }
}

async fn run_teardown(plugin: &Plugin) {
    if let Some(teardown) = &plugin.teardown {
        if let Err(e) = teardown().await {
            log::warn!("Plugin '{}' teardown failed: {:#}", plugin.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::ComponentDetails;
    use crate::rpc::handler;
    use crate::snapshot::SnapshotNode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoTree;

    impl ComponentSource for NoTree {
        fn component_tree(&self) -> Vec<SnapshotNode> {
            Vec::new()
        }
        fn component_details(&self, _id: &str) -> Option<ComponentDetails> {
            None
        }
    }

    fn manager() -> PluginManager {
        PluginManager::new(Arc::new(NoTree), EventBus::new(), RpcTable::new())
    }

    #[tokio::test]
    async fn test_reserved_id_is_rejected() {
        let pm = manager();
        let err = pm.register(Plugin::builder("core", "Impostor").build()).await.unwrap_err();
        assert_eq!(err, PluginError::ReservedId("core".to_string()));
    }

    #[tokio::test]
    async fn test_disable_detaches_and_enable_reattaches() {
        let pm = manager();
        let setups = Arc::new(AtomicUsize::new(0));
        let teardowns = Arc::new(AtomicUsize::new(0));
        let (s, t) = (Arc::clone(&setups), Arc::clone(&teardowns));
        let plugin = Plugin::builder("perf", "Performance")
            .rpc("stats", handler(|_| async { Ok(json!(1)) }))
            .on(EventKind::TreeUpdated, Arc::new(|_| Ok(())))
            .setup(move |_ctx| {
                let s = Arc::clone(&s);
                async move {
                    s.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .teardown(move || {
                let t = Arc::clone(&t);
                async move {
                    t.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build();
        pm.register(plugin).await.unwrap();

        pm.set_enabled("perf", false).await.unwrap();
        assert!(!pm.table().contains("perf.stats"));
        assert_eq!(pm.bus().handler_count(), 0);
        assert!(!pm.get_all()[0].enabled);

        pm.set_enabled("perf", true).await.unwrap();
        assert!(pm.table().contains("perf.stats"));
        assert_eq!(setups.load(Ordering::SeqCst), 2);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_reenable_leaves_plugin_disabled() {
        let pm = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let plugin = Plugin::builder("flaky", "Flaky")
            .rpc("ping", handler(|_| async { Ok(json!("pong")) }))
            .setup(move |_ctx| {
                let n = c.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Ok(())
                    } else {
                        Err(anyhow::anyhow!("second setup fails"))
                    }
                }
            })
            .build();
        pm.register(plugin).await.unwrap();
        pm.set_enabled("flaky", false).await.unwrap();

        let err = pm.set_enabled("flaky", true).await.unwrap_err();
        assert!(matches!(err, PluginError::Setup { .. }));
        assert_eq!(
            pm.get_all(),
            vec![PluginInfo {
                id: "flaky".to_string(),
                name: "Flaky".to_string(),
                enabled: false
            }]
        );
        assert!(!pm.table().contains("flaky.ping"));
    }

    #[tokio::test]
    async fn test_unregister_unknown_is_not_found() {
        let pm = manager();
        assert_eq!(
            pm.unregister("ghost").await,
            Err(PluginError::NotFound("ghost".to_string()))
        );
        assert_eq!(
            pm.set_enabled("ghost", true).await,
            Err(PluginError::NotFound("ghost".to_string()))
        );
    }

    #[tokio::test]
    async fn test_lifecycle_events_are_emitted() {
        let pm = manager();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in [EventKind::PluginRegistered, EventKind::PluginUnregistered] {
            let sink = Arc::clone(&seen);
            pm.bus().on(
                kind,
                Arc::new(move |e: &DevtoolsEvent| {
                    lock(&sink).push((e.kind.clone(), e.payload["id"].clone()));
                    Ok(())
                }),
            );
        }

        pm.register(Plugin::builder("a11y", "Accessibility").build()).await.unwrap();
        pm.unregister("a11y").await.unwrap();

        let seen = lock(&seen).clone();
        assert_eq!(
            seen,
            vec![
                (EventKind::PluginRegistered, json!("a11y")),
                (EventKind::PluginUnregistered, json!("a11y")),
            ]
        );
    }
}
