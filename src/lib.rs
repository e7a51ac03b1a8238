//! fiberlens - live component-tree inspector for tree-shaped UI runtimes.
//!
//! The crate attaches to a running host runtime, keeps debounced snapshots of
//! its component tree, and serves them, together with remote-control methods,
//! to an observer panel over any of several transports. Third-party plugins
//! extend the session with their own RPC methods and event handlers.
//!
//! # Architecture
//!
//! ```text
//! host runtime ──commit──► HookAdapter ──► RebuildScheduler ──► listeners
//!                                                  │               │
//!                                           DetailExtractor      RpcPeer ──► Channel ──► panel
//!                                                  ▲               │
//!                                      core.* / plugin RPC ◄───────┘
//! ```
//!
//! # Modules
//!
//! - [`host`] - Host runtime model, hook adapter and root discovery
//! - [`snapshot`] - Snapshot builder, id registry and debounced scheduler
//! - [`inspect`] - Value serializer, hook classifier and detail extractor
//! - [`channel`] - Transports and the reconnecting connection manager
//! - [`rpc`] - Request/response layer over any channel
//! - [`plugin`] - Plugin manager, contexts and the event bus
//! - [`inspector`] - The session wiring all of the above together
//! - [`config`] - Configuration loading/saving

pub mod channel;
pub mod config;
pub mod host;
pub mod inspect;
pub mod inspector;
pub mod plugin;
pub mod rpc;
pub mod snapshot;

pub(crate) mod sync;

// Re-export commonly used types
pub use channel::{Channel, ConnectionManager, ConnectionState, Message, TransportKind, TransportSpec};
pub use config::Config;
pub use host::hook::HostEnvironment;
pub use host::{HostValue, NodeHandle, RuntimeNode};
pub use inspect::{ComponentDetails, SerializedValue, ValueSerializer};
pub use inspector::{EditorLauncher, Inspector};
pub use plugin::{Plugin, PluginContext, PluginManager};
pub use rpc::{RpcError, RpcPeer, RpcTable};
pub use snapshot::{SnapshotNode, SnapshotTree};
