//! fiberlens CLI - run a demo host runtime or inspect one remotely.
//!
//! This is the main binary entry point. See the `fiberlens` library for the
//! core functionality.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fiberlens::channel::{ChannelError, ChannelFactory, ConnectionEvent, SocketChannel, SocketListener};
use fiberlens::host::dom::{Document, DomElement};
use fiberlens::host::hook::RendererInfo;
use fiberlens::host::memory::MemoryNode;
use fiberlens::host::HookSlot;
use fiberlens::inspector::{CommandEditor, TREE_UPDATED_NOTIFICATION};
use fiberlens::plugin::{DevtoolsEvent, EventKind};
use fiberlens::rpc::handler;
use fiberlens::{
    Channel, Config, ConnectionManager, HostEnvironment, HostValue, Inspector, Plugin, RpcPeer, RpcTable,
    SnapshotNode, SnapshotTree,
};
use futures_util::future::BoxFuture;
use mimalloc::MiMalloc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// CLI
#[derive(Parser)]
#[command(name = "fiberlens")]
#[command(version = VERSION)]
#[command(about = "Live component-tree inspector for tree-shaped UI runtimes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-memory host runtime and serve panels over WebSocket
    Demo {
        /// Address to listen on (defaults to the configured listen_addr)
        #[arg(long)]
        listen: Option<String>,
        /// Milliseconds between simulated commits
        #[arg(long, default_value_t = 1000)]
        tick_ms: u64,
    },
    /// Connect to a running host as a panel and print its tree
    Inspect {
        /// WebSocket URL (defaults to the configured socket_url)
        #[arg(long)]
        url: Option<String>,
        /// Print the details of this node instead of the tree
        #[arg(long)]
        details: Option<String>,
        /// Print raw JSON
        #[arg(long)]
        json: bool,
        /// Keep printing trees as the host pushes them, until Ctrl-C
        #[arg(long)]
        watch: bool,
    },
    /// Print the effective configuration
    Config {
        /// Also write it to the config file
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Demo { listen, tick_ms } => {
            let listen = listen.unwrap_or_else(|| config.listen_addr.clone());
            run_demo(config, &listen, Duration::from_millis(tick_ms.max(1))).await?;
        }
        Commands::Inspect {
            url,
            details,
            json,
            watch,
        } => {
            let url = url.unwrap_or_else(|| config.socket_url.clone());
            run_inspect(&config, url, details, json, watch).await?;
        }
        Commands::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                config.save()?;
                println!("Saved to {}", Config::config_dir()?.join("config.json").display());
            }
        }
    }

    Ok(())
}

/// The demo application: a todo list whose length and state change on
/// every tick.
struct DemoApp {
    root: Arc<MemoryNode>,
    app: Arc<MemoryNode>,
    list: Arc<MemoryNode>,
}

impl DemoApp {
    fn mount() -> Self {
        let root = MemoryNode::root();
        let app = MemoryNode::component("App");
        let header = MemoryNode::component("Header");
        header.set_props(HostValue::object([("title", HostValue::from("fiberlens demo"))]));
        let list = MemoryNode::component("TodoList");
        let footer = MemoryNode::element("footer");

        root.append_child(&app);
        app.set_children(vec![header, Arc::clone(&list), footer]);
        Self { root, app, list }
    }

    fn tick(&self, tick: u64) {
        let count = 2 + (tick % 3) as usize;
        let items: Vec<Arc<MemoryNode>> = (0..count)
            .map(|i| {
                let item = MemoryNode::component("TodoItem");
                item.set_props(HostValue::object([
                    ("label", HostValue::from(format!("task {i}").as_str())),
                    ("done", HostValue::from(i % 2 == 0)),
                ]));
                let wrapper = MemoryNode::element("li");
                wrapper.append_child(&item);
                wrapper
            })
            .collect();
        self.list.set_children(items);
        self.app
            .set_hooks(vec![HookSlot::new(HostValue::from(tick as f64))]);
        self.app.set_debug_hook_types(Some(vec!["State".to_string()]));
    }
}

fn stats_plugin() -> Plugin {
    let updates = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&updates);
    Plugin::builder("stats", "Tree statistics")
        .on(
            EventKind::TreeUpdated,
            Arc::new(move |_: &DevtoolsEvent| -> anyhow::Result<()> {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }),
        )
        .rpc(
            "summary",
            handler(move |_| {
                let updates = updates.load(Ordering::Relaxed);
                async move { Ok(json!({ "treeUpdates": updates })) }
            }),
        )
        .build()
}

async fn run_demo(config: Config, listen: &str, tick: Duration) -> Result<()> {
    let demo = DemoApp::mount();
    let document = Document::new();
    let container = DomElement::with_id("div", "root");
    document.body().append_child(&container);
    container.define_property("__reactContainer$demo", HostValue::Node(demo.root.handle()), false);

    let env = HostEnvironment::new(document);
    let mut builder = Inspector::builder(Arc::clone(&env)).config(config);
    if let Some(editor) = CommandEditor::from_env() {
        builder = builder.editor(Arc::new(editor));
    }
    let inspector = builder.start()?;
    inspector.register_plugin(stats_plugin()).await?;
    inspector.discover_roots().await;

    let hook = env.hook().context("Devtools hook missing after start")?;
    let renderer = hook.inject(RendererInfo {
        name: "fiberlens-demo".to_string(),
        version: VERSION.to_string(),
    });

    let listener = SocketListener::bind(listen).await?;
    log::info!("Serving panels on ws://{}", listener.local_addr()?);

    let mut ticker = tokio::time::interval(tick);
    let mut ticks = 0u64;
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(channel) => {
                    inspector.attach_channel(channel);
                }
                Err(e) => log::warn!("Rejected panel connection: {}", e),
            },
            _ = ticker.tick() => {
                ticks += 1;
                demo.tick(ticks);
                if let Err(e) = hook.on_commit_root(renderer, &demo.root.handle()) {
                    log::warn!("Commit handler failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Shutting down");
                break;
            }
        }
    }

    inspector.shutdown().await;
    Ok(())
}

async fn run_inspect(config: &Config, url: String, details: Option<String>, json: bool, watch: bool) -> Result<()> {
    let manager = ConnectionManager::new(config.backoff_policy());
    let _events = manager.observe(Arc::new(|event: &ConnectionEvent| match event {
        ConnectionEvent::Reconnecting { attempt, delay, .. } => {
            log::warn!("Attempt {} failed, retrying in {:?}", attempt, delay)
        }
        other => log::info!("{:?}", other),
    }));

    let factory: ChannelFactory = Arc::new(move || -> BoxFuture<'static, Result<Arc<dyn Channel>, ChannelError>> {
        let url = url.clone();
        Box::pin(async move {
            let channel: Arc<dyn Channel> = SocketChannel::connect(&url).await?;
            Ok(channel)
        })
    });
    let channel = manager.connect("panel", factory).await?;

    let table = RpcTable::new();
    if watch {
        table.register(
            TREE_UPDATED_NOTIFICATION,
            handler(move |args| async move { print_pushed_tree(args, json) }),
        )?;
    }
    let peer = RpcPeer::new(channel, table, config.rpc_timeout());

    match details {
        Some(id) => {
            let details = peer.call("core.getDetails", vec![json!(id)]).await?;
            println!("{}", serde_json::to_string_pretty(&details)?);
        }
        None => {
            let result = peer.call("core.getTree", vec![]).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                let nodes: Vec<SnapshotNode> = serde_json::from_value(result)?;
                print_tree(&nodes, 0);
            }
        }
    }

    if watch {
        tokio::signal::ctrl_c().await?;
    }
    peer.close().await;
    manager.close_all().await;
    Ok(())
}

fn print_pushed_tree(args: Vec<Value>, json: bool) -> Result<Value> {
    let tree: SnapshotTree = serde_json::from_value(args.into_iter().next().unwrap_or(Value::Null))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&tree)?);
    } else {
        println!("--- root {} ({} nodes)", tree.root_id, tree.node_count());
        print_tree(&tree.nodes, 0);
    }
    Ok(Value::Null)
}

fn print_tree(nodes: &[SnapshotNode], depth: usize) {
    for node in nodes {
        println!("{}{} [{}]", "  ".repeat(depth), node.name, node.id);
        print_tree(&node.children, depth + 1);
    }
}
