//! One inspection session.
//!
//! [`Inspector`] owns everything that used to be ambient: the hook adapter,
//! the rebuild scheduler, the detail extractor, the RPC table, the event bus
//! and the plugin manager. Panels attach through [`Inspector::attach_channel`]
//! and drive the session through the `core.*` methods:
//!
//! | method | args | result |
//! |---|---|---|
//! | `core.getTree` | none | array of snapshot nodes |
//! | `core.getDetails` | `[id]` | component details |
//! | `core.selectNode` | `[id]` | `true` if the node is live |
//! | `core.setProp` | `[id, path, value]` | `null` |
//! | `core.listPlugins` | none | array of `{id, name, enabled}` |
//! | `core.togglePlugin` | `[id, enabled]` | `null` |
//! | `core.openInEditor` | `[id]` | `null` |
//!
//! Every snapshot is published as `tree_updated` on the bus and pushed to each
//! attached panel as a `panel.treeUpdated` notification.

use std::fmt;
use std::future::Future;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::Context;
use serde_json::{json, Value};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::Channel;
use crate::config::Config;
use crate::host::adapter::HookAdapter;
use crate::host::dom::DomElement;
use crate::host::hook::HostEnvironment;
use crate::host::{root_of, HostValue, NodeHandle, SourceLocation};
use crate::inspect::{ComponentDetails, DetailExtractor, SourceHints, ValueSerializer};
use crate::plugin::{
    ComponentSource, DevtoolsEvent, EventBus, EventKind, Plugin, PluginError, PluginInfo, PluginManager, CORE_ID,
};
use crate::rpc::{handler, RpcHandler, RpcPeer, RpcTable};
use crate::snapshot::{spawn_commit_pump, RebuildScheduler, SnapshotBuilder, SnapshotNode, SnapshotTree};
use crate::sync::lock;

/// Notification carrying a fresh snapshot to panels.
pub const TREE_UPDATED_NOTIFICATION: &str = "panel.treeUpdated";

/// Opens a source location in the developer's editor.
pub trait EditorLauncher: Send + Sync {
    /// Open `location`.
    fn open(&self, location: &SourceLocation) -> anyhow::Result<()>;
}

/// Launches an external command with `file:line[:column]` as its last argument.
#[derive(Clone, Debug)]
pub struct CommandEditor {
    program: String,
    args: Vec<String>,
}

impl CommandEditor {
    /// Run `program args... file:line[:column]`.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from `$VISUAL` or `$EDITOR`, split on whitespace.
    pub fn from_env() -> Option<Self> {
        let command = std::env::var("VISUAL").or_else(|_| std::env::var("EDITOR")).ok()?;
        let mut parts = command.split_whitespace().map(String::from);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    /// The argument naming `location`.
    pub fn target(location: &SourceLocation) -> String {
        match location.column {
            Some(column) => format!("{}:{}:{}", location.file_name, location.line, column),
            None => format!("{}:{}", location.file_name, location.line),
        }
    }

    /// Start the editor on `location` and reap it in the background.
    ///
    /// The returned task resolves to the exit status once the editor quits,
    /// or `None` if waiting on it failed. Must be called within a tokio
    /// runtime.
    pub fn launch(&self, location: &SourceLocation) -> anyhow::Result<JoinHandle<Option<ExitStatus>>> {
        let target = Self::target(location);
        log::info!("Opening {} in {}", target, self.program);
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&target)
            .spawn()
            .with_context(|| format!("Failed to launch editor '{}'", self.program))?;

        let program = self.program.clone();
        Ok(tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    if !status.success() {
                        log::warn!("Editor '{}' exited with {}", program, status);
                    }
                    Some(status)
                }
                Err(e) => {
                    log::warn!("Failed to wait for editor '{}': {}", program, e);
                    None
                }
            }
        }))
    }
}

impl EditorLauncher for CommandEditor {
    fn open(&self, location: &SourceLocation) -> anyhow::Result<()> {
        // The reaper task runs on without us.
        self.launch(location)?;
        Ok(())
    }
}

/// Tree reads shared by the core methods and every plugin context.
struct TreeReader {
    scheduler: Arc<RebuildScheduler>,
    extractor: DetailExtractor,
}

impl TreeReader {
    fn resolve(&self, id: &str) -> Option<NodeHandle> {
        self.scheduler.builder().resolve(id)
    }
}

impl ComponentSource for TreeReader {
    fn component_tree(&self) -> Vec<SnapshotNode> {
        self.scheduler.forest()
    }

    fn component_details(&self, id: &str) -> Option<ComponentDetails> {
        let node = self.resolve(id)?;
        Some(self.extractor.extract(id, &node, self.scheduler.builder()))
    }
}

/// Configures and starts an [`Inspector`].
pub struct InspectorBuilder {
    env: Arc<HostEnvironment>,
    config: Config,
    hints: SourceHints,
    editor: Option<Arc<dyn EditorLauncher>>,
    own_container: Option<Arc<DomElement>>,
}

impl fmt::Debug for InspectorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InspectorBuilder")
            .field("config", &self.config)
            .field("hints", &self.hints.len())
            .field("editor", &self.editor.is_some())
            .finish_non_exhaustive()
    }
}

impl InspectorBuilder {
    /// Use `config` instead of the defaults.
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Source coordinates supplied by the build tool.
    #[must_use]
    pub fn source_hints(mut self, hints: SourceHints) -> Self {
        self.hints = hints;
        self
    }

    /// Editor used by `core.openInEditor`.
    #[must_use]
    pub fn editor(mut self, editor: Arc<dyn EditorLauncher>) -> Self {
        self.editor = Some(editor);
        self
    }

    /// The inspector's own UI container, never treated as an app root.
    #[must_use]
    pub fn own_container(mut self, container: Arc<DomElement>) -> Self {
        self.own_container = Some(container);
        self
    }

    /// Install the hook and start the session.
    ///
    /// Must be called within a tokio runtime. Root discovery is left to
    /// [`Inspector::discover_roots`] so callers choose whether to wait for it.
    pub fn start(self) -> anyhow::Result<Arc<Inspector>> {
        let config = self.config;
        let (commit_tx, commit_rx) = mpsc::unbounded_channel();

        let mut adapter = HookAdapter::new(Arc::clone(&self.env), commit_tx);
        if let Some(container) = self.own_container {
            adapter = adapter.with_own_container(container);
        }
        let adapter = Arc::new(adapter);
        adapter.install();

        let scheduler = RebuildScheduler::new(SnapshotBuilder::new(config.build_options()), config.debounce());
        let pump = spawn_commit_pump(Arc::clone(&scheduler), commit_rx);

        let reader = Arc::new(TreeReader {
            scheduler: Arc::clone(&scheduler),
            extractor: DetailExtractor::new(
                ValueSerializer::new(config.serializer_options()),
                config.ancestor_depth,
                self.hints,
            ),
        });

        let bus = EventBus::new();
        let table = RpcTable::new();
        let plugins = PluginManager::new(
            Arc::clone(&reader) as Arc<dyn ComponentSource>,
            Arc::clone(&bus),
            Arc::clone(&table),
        );

        let peers: Arc<Mutex<Vec<Arc<RpcPeer>>>> = Arc::default();
        let listener_id = scheduler.add_listener(publish_snapshots(Arc::clone(&bus), Arc::clone(&peers)));

        let inspector = Arc::new(Inspector {
            config,
            env: self.env,
            adapter,
            scheduler,
            reader,
            bus,
            table,
            plugins,
            peers,
            selected: Mutex::new(None),
            editor: self.editor,
            pump: Mutex::new(Some(pump)),
            listener_id,
            shut_down: AtomicBool::new(false),
        });
        inspector.register_core_methods()?;
        log::info!("Inspector started ({} core methods)", inspector.table.len());
        Ok(inspector)
    }
}

fn publish_snapshots(
    bus: Arc<EventBus>,
    peers: Arc<Mutex<Vec<Arc<RpcPeer>>>>,
) -> crate::snapshot::SnapshotListener {
    Arc::new(move |tree: &Arc<SnapshotTree>| {
        let payload = serde_json::to_value(&**tree)?;
        bus.emit(&DevtoolsEvent::new(EventKind::TreeUpdated, payload.clone(), CORE_ID));

        let peers: Vec<Arc<RpcPeer>> = {
            let mut peers = lock(&peers);
            peers.retain(|peer| !peer.is_closed());
            peers.clone()
        };
        for peer in peers {
            if let Err(e) = peer.notify(TREE_UPDATED_NOTIFICATION, vec![payload.clone()]) {
                log::debug!("Dropping snapshot for a panel: {}", e);
            }
        }
        Ok(())
    })
}

/// A running inspection session.
pub struct Inspector {
    config: Config,
    env: Arc<HostEnvironment>,
    adapter: Arc<HookAdapter>,
    scheduler: Arc<RebuildScheduler>,
    reader: Arc<TreeReader>,
    bus: Arc<EventBus>,
    table: Arc<RpcTable>,
    plugins: PluginManager,
    peers: Arc<Mutex<Vec<Arc<RpcPeer>>>>,
    selected: Mutex<Option<String>>,
    editor: Option<Arc<dyn EditorLauncher>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    listener_id: u64,
    shut_down: AtomicBool,
}

impl fmt::Debug for Inspector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inspector")
            .field("adapter", &self.adapter)
            .field("scheduler", &self.scheduler)
            .field("plugins", &self.plugins)
            .field("peers", &lock(&self.peers).len())
            .field("selected", &*lock(&self.selected))
            .finish_non_exhaustive()
    }
}

impl Inspector {
    /// Session builder over `env`.
    pub fn builder(env: Arc<HostEnvironment>) -> InspectorBuilder {
        InspectorBuilder {
            env,
            config: Config::default(),
            hints: SourceHints::new(),
            editor: None,
            own_container: None,
        }
    }

    /// Effective configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The inspected environment.
    pub fn env(&self) -> &Arc<HostEnvironment> {
        &self.env
    }

    /// Snapshot scheduler.
    pub fn scheduler(&self) -> &Arc<RebuildScheduler> {
        &self.scheduler
    }

    /// Event bus shared with plugins.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// RPC table answering panel requests.
    pub fn table(&self) -> &Arc<RpcTable> {
        &self.table
    }

    /// Plugin manager.
    pub fn plugins(&self) -> &PluginManager {
        &self.plugins
    }

    /// Register a plugin with this session.
    pub async fn register_plugin(&self, plugin: Plugin) -> Result<(), PluginError> {
        self.plugins.register(plugin).await
    }

    /// Search the document for already mounted roots and schedule their
    /// first snapshots. Returns the roots found, possibly none.
    pub async fn discover_roots(&self) -> Vec<NodeHandle> {
        self.adapter.discover_roots(&self.config.discovery_policy()).await
    }

    /// Serve RPC over `channel`. The panel receives snapshot notifications
    /// until the channel closes.
    pub fn attach_channel(&self, channel: Arc<dyn Channel>) -> Arc<RpcPeer> {
        let peer = RpcPeer::new(channel, Arc::clone(&self.table), self.config.rpc_timeout());
        let mut peers = lock(&self.peers);
        peers.retain(|p| !p.is_closed());
        peers.push(Arc::clone(&peer));
        log::info!("Panel attached over {} ({} total)", peer.channel().transport(), peers.len());
        peer
    }

    /// Attached panels that are still open.
    pub fn peer_count(&self) -> usize {
        lock(&self.peers).iter().filter(|p| !p.is_closed()).count()
    }

    /// Top-level nodes of every root's latest snapshot.
    pub fn component_tree(&self) -> Vec<SnapshotNode> {
        self.reader.component_tree()
    }

    /// Details of a live node.
    pub fn component_details(&self, id: &str) -> Option<ComponentDetails> {
        self.reader.component_details(id)
    }

    /// Currently selected node id.
    pub fn selected(&self) -> Option<String> {
        lock(&self.selected).clone()
    }

    /// Select `id` if it names a live node.
    ///
    /// # Returns
    ///
    /// Whether the node was found.
    pub fn select(&self, id: &str) -> bool {
        if self.reader.resolve(id).is_none() {
            log::debug!("Ignoring selection of unknown node {}", id);
            return false;
        }
        *lock(&self.selected) = Some(id.to_string());
        self.bus.emit(&DevtoolsEvent::new(EventKind::NodeSelected, json!({ "id": id }), CORE_ID));
        true
    }

    /// Overwrite the prop at `path` of node `id` and schedule a rebuild of
    /// its root. Best effort: the host may refuse or ignore the write.
    pub fn set_prop(&self, id: &str, path: &[String], value: &Value) -> anyhow::Result<()> {
        let node = self
            .reader
            .resolve(id)
            .with_context(|| format!("No live component '{id}'"))?;
        node.override_prop(path, HostValue::from_json(value))?;
        log::debug!("Set prop {} of {} to {}", path.join("."), id, value);

        self.bus.emit(&DevtoolsEvent::new(
            EventKind::PropChanged,
            json!({ "id": id, "path": path, "value": value }),
            CORE_ID,
        ));
        self.scheduler.request(root_of(&node));
        Ok(())
    }

    /// Open the definition of node `id` in the configured editor.
    pub fn open_in_editor(&self, id: &str) -> anyhow::Result<()> {
        let editor = self.editor.as_ref().context("No editor configured")?;
        let details = self
            .component_details(id)
            .with_context(|| format!("No live component '{id}'"))?;
        let source = details
            .source
            .with_context(|| format!("No source location known for '{}'", details.name))?;
        editor.open(&source)
    }

    /// Stop observing the host, tear down plugins and close every panel.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.adapter.uninstall();
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        self.scheduler.remove_listener(self.listener_id);
        self.scheduler.cancel_all();
        self.plugins.teardown_all().await;

        let peers: Vec<Arc<RpcPeer>> = lock(&self.peers).drain(..).collect();
        for peer in peers {
            peer.close().await;
        }
        log::info!("Inspector shut down");
    }

    fn register_core_methods(self: &Arc<Self>) -> anyhow::Result<()> {
        let weak = Arc::downgrade(self);
        let methods: Vec<(&str, RpcHandler)> = vec![
            ("getTree", core_method(&weak, |i, _| async move { i.rpc_get_tree() })),
            ("getDetails", core_method(&weak, |i, args| async move { i.rpc_get_details(&args) })),
            ("selectNode", core_method(&weak, |i, args| async move { i.rpc_select_node(&args) })),
            ("setProp", core_method(&weak, |i, args| async move { i.rpc_set_prop(&args) })),
            ("listPlugins", core_method(&weak, |i, _| async move { i.rpc_list_plugins() })),
            ("togglePlugin", core_method(&weak, |i, args| async move { i.rpc_toggle_plugin(&args).await })),
            ("openInEditor", core_method(&weak, |i, args| async move { i.rpc_open_in_editor(&args) })),
        ];
        for (name, method) in methods {
            self.table.register(&format!("{CORE_ID}.{name}"), method)?;
        }
        Ok(())
    }

    fn rpc_get_tree(&self) -> anyhow::Result<Value> {
        Ok(serde_json::to_value(self.component_tree())?)
    }

    fn rpc_get_details(&self, args: &[Value]) -> anyhow::Result<Value> {
        let id = string_arg(args, 0, "id")?;
        let details = self
            .component_details(id)
            .with_context(|| format!("No live component '{id}'"))?;
        Ok(serde_json::to_value(details)?)
    }

    fn rpc_select_node(&self, args: &[Value]) -> anyhow::Result<Value> {
        let id = string_arg(args, 0, "id")?;
        Ok(Value::Bool(self.select(id)))
    }

    fn rpc_set_prop(&self, args: &[Value]) -> anyhow::Result<Value> {
        let id = string_arg(args, 0, "id")?;
        let path: Vec<String> = args
            .get(1)
            .context("Missing argument 'path'")?
            .as_array()
            .context("Argument 'path' must be an array")?
            .iter()
            .map(|segment| match segment {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        let value = args.get(2).cloned().unwrap_or(Value::Null);
        self.set_prop(id, &path, &value)?;
        Ok(Value::Null)
    }

    fn rpc_list_plugins(&self) -> anyhow::Result<Value> {
        let plugins: Vec<PluginInfo> = self.plugins.get_all();
        Ok(serde_json::to_value(plugins)?)
    }

    async fn rpc_toggle_plugin(&self, args: &[Value]) -> anyhow::Result<Value> {
        let id = string_arg(args, 0, "id")?;
        let enabled = args
            .get(1)
            .and_then(Value::as_bool)
            .context("Argument 'enabled' must be a boolean")?;
        self.plugins.set_enabled(id, enabled).await?;
        Ok(Value::Null)
    }

    fn rpc_open_in_editor(&self, args: &[Value]) -> anyhow::Result<Value> {
        let id = string_arg(args, 0, "id")?;
        self.open_in_editor(id)?;
        Ok(Value::Null)
    }
}

fn core_method<F, Fut>(inspector: &Weak<Inspector>, f: F) -> RpcHandler
where
    F: Fn(Arc<Inspector>, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    let inspector = Weak::clone(inspector);
    handler(move |args: Vec<Value>| {
        let call = inspector.upgrade().map(|i| f(i, args));
        async move {
            match call {
                Some(call) => call.await,
                None => Err(anyhow::anyhow!("Inspector has shut down")),
            }
        }
    })
}

fn string_arg<'a>(args: &'a [Value], index: usize, name: &str) -> anyhow::Result<&'a str> {
    args.get(index)
        .with_context(|| format!("Missing argument '{name}'"))?
        .as_str()
        .with_context(|| format!("Argument '{name}' must be a string"))
}
