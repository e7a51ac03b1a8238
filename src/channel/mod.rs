//! Transport-agnostic message channels.
//!
//! Every transport moves the same JSON [`Message`] envelope and exposes the
//! same [`Channel`] trait, so the RPC layer never knows whether it is talking
//! to a panel in the same page, another frame, another tab or another process.
//!
//! # Architecture
//!
//! ```text
//! Channel (trait)
//!     │
//!     ├── LocalChannel      in-page bus shared by both sides
//!     ├── FrameChannel      cross-frame postMessage with origin checks
//!     ├── BroadcastChannel  named cross-tab broadcast, own echoes dropped
//!     └── SocketChannel     WebSocket, client or accepted connection
//!
//! ConnectionManager
//!     └── named channels built from factories, reconnected with backoff
//! ```
//!
//! All transports deliver inbound messages from one task per channel, in
//! arrival order. `send` after `close` is a silent no-op.
//!
//! Rust guideline compliant 2025-01

pub mod broadcast;
pub mod frame;
pub mod local;
pub mod mailbox;
pub mod manager;
pub mod socket;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

pub use broadcast::{BroadcastChannel, BroadcastHub};
pub use frame::{FrameChannel, FrameWindow};
pub use local::{LocalBus, LocalChannel};
pub use mailbox::{Handler, Handlers, Mailbox, Subscription};
pub use manager::{BackoffPolicy, ChannelFactory, ConnectionEvent, ConnectionManager};
pub use socket::{SocketChannel, SocketListener};

/// Machine-readable error code carried on the wire.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No handler is registered under the requested method.
    MethodNotFound,
    /// The handler ran and failed.
    HandlerError,
    /// No response arrived in time.
    Timeout,
    /// The channel closed before a response arrived.
    Closed,
    /// The message could not be understood.
    InvalidRequest,
}

/// Error payload of a failed response.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct WireError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl WireError {
    /// Build a wire error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// The one envelope every transport carries.
///
/// A message with a `method` is a request (or a notification nobody answers);
/// a message without one is a response to the request with the same `id`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    /// Correlation id.
    pub id: String,
    /// Method name, on requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Positional arguments, on requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    /// Result, on successful responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error, on failed responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Message {
    /// Request message.
    pub fn request(id: impl Into<String>, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            id: id.into(),
            method: Some(method.into()),
            args: Some(args),
            result: None,
            error: None,
        }
    }

    /// Successful response.
    pub fn response(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            method: None,
            args: None,
            result: Some(result),
            error: None,
        }
    }

    /// Failed response.
    pub fn failure(id: impl Into<String>, error: WireError) -> Self {
        Self {
            id: id.into(),
            method: None,
            args: None,
            result: None,
            error: Some(error),
        }
    }

    /// Whether this message asks for something.
    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }

    /// Encode as JSON text.
    pub fn encode(&self) -> Result<String, ChannelError> {
        serde_json::to_string(self).map_err(|e| ChannelError::Codec(e.to_string()))
    }

    /// Decode from JSON text.
    pub fn decode(text: &str) -> Result<Self, ChannelError> {
        serde_json::from_str(text).map_err(|e| ChannelError::Codec(e.to_string()))
    }
}

/// Connection state for a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected, or closed locally.
    #[default]
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Reconnecting after a failure.
    Reconnecting {
        /// Current reconnection attempt number.
        attempt: u32,
        /// Milliseconds until the next retry.
        next_retry_ms: u64,
    },
    /// The transport failed or the peer went away.
    Error(String),
}

impl ConnectionState {
    /// Whether the channel can no longer carry messages.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error(_))
    }
}

/// Errors raised by channels.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Failed to establish the connection.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// Failed to hand a message to the transport.
    #[error("send failed: {0}")]
    SendFailed(String),
    /// JSON encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),
    /// The channel was closed.
    #[error("channel closed")]
    Closed,
    /// The requested transport cannot be opened with the media at hand.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Callback for inbound messages.
pub type MessageHandler = Handler<Message>;

/// A bidirectional, ordered message channel.
#[async_trait]
pub trait Channel: Send + Sync + fmt::Debug {
    /// Which transport this is.
    fn transport(&self) -> TransportKind;

    /// Queue `message` for the peer. A no-op once the channel is closed.
    fn send(&self, message: &Message) -> Result<(), ChannelError>;

    /// Register an inbound message handler.
    fn on_message(&self, handler: MessageHandler) -> Subscription;

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Subscribe to connection state changes.
    fn watch_state(&self) -> watch::Receiver<ConnectionState>;

    /// Close the channel. Idempotent.
    async fn close(&self);
}

/// State and handler bookkeeping shared by all transports.
pub(crate) struct ChannelCore {
    handlers: Arc<Handlers<Message>>,
    state: watch::Sender<ConnectionState>,
    closed: AtomicBool,
}

impl fmt::Debug for ChannelCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCore")
            .field("state", &*self.state.borrow())
            .field("handlers", &self.handlers.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ChannelCore {
    pub(crate) fn new(initial: ConnectionState) -> Arc<Self> {
        let (state, _) = watch::channel(initial);
        Arc::new(Self {
            handlers: Handlers::new(),
            state,
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn dispatch(&self, message: &Message) {
        if !self.is_closed() {
            self.handlers.dispatch(message);
        }
    }

    pub(crate) fn subscribe(&self, handler: MessageHandler) -> Subscription {
        self.handlers.add(handler)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed; `true` only for the first caller.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

/// Transport selector.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// In-page bus.
    Local,
    /// Cross-frame messaging.
    Frame,
    /// Named cross-tab broadcast.
    Broadcast,
    /// WebSocket.
    Socket,
}

impl TransportKind {
    /// Whether every participant on the medium sees every message.
    ///
    /// Peers on a shared medium overhear requests meant for someone else, so
    /// they only answer the ones they have a handler for.
    pub fn is_shared(self) -> bool {
        matches!(self, Self::Local | Self::Broadcast)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Local => "local",
            Self::Frame => "frame",
            Self::Broadcast => "broadcast",
            Self::Socket => "socket",
        };
        f.write_str(name)
    }
}

impl FromStr for TransportKind {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "frame" | "iframe" => Ok(Self::Frame),
            "broadcast" => Ok(Self::Broadcast),
            "socket" | "websocket" | "ws" => Ok(Self::Socket),
            other => Err(ChannelError::Unavailable(format!("unknown transport '{other}'"))),
        }
    }
}

/// Everything needed to open one channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportSpec {
    /// Attach to the in-page bus.
    Local,
    /// Talk to the peer window, addressing `target_origin`.
    Frame {
        /// Origin messages are addressed to (`*` for any).
        target_origin: String,
    },
    /// Join the named broadcast channel.
    Broadcast {
        /// Channel name shared by every participant.
        name: String,
    },
    /// Connect to a WebSocket server.
    Socket {
        /// `ws://` or `wss://` URL.
        url: String,
    },
}

impl TransportSpec {
    /// Transport this spec opens.
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Local => TransportKind::Local,
            Self::Frame { .. } => TransportKind::Frame,
            Self::Broadcast { .. } => TransportKind::Broadcast,
            Self::Socket { .. } => TransportKind::Socket,
        }
    }
}

/// Shared in-process media the in-page transports attach to.
#[derive(Clone, Debug, Default)]
pub struct TransportMedia {
    /// In-page bus.
    pub bus: Option<Arc<LocalBus>>,
    /// This side's window.
    pub window: Option<Arc<FrameWindow>>,
    /// The peer's window.
    pub peer_window: Option<Arc<FrameWindow>>,
    /// Broadcast hub.
    pub broadcast: Option<Arc<BroadcastHub>>,
}

/// Open the channel described by `spec`.
pub async fn open(spec: &TransportSpec, media: &TransportMedia) -> Result<Arc<dyn Channel>, ChannelError> {
    log::debug!("Opening {} channel", spec.kind());
    let channel: Arc<dyn Channel> = match spec {
        TransportSpec::Local => {
            let bus = media
                .bus
                .as_ref()
                .ok_or_else(|| ChannelError::Unavailable("no local bus".to_string()))?;
            LocalChannel::open(bus)
        }
        TransportSpec::Frame { target_origin } => {
            let (Some(window), Some(peer)) = (&media.window, &media.peer_window) else {
                return Err(ChannelError::Unavailable("no frame windows".to_string()));
            };
            FrameChannel::open(Arc::clone(window), Arc::clone(peer), target_origin.clone())
        }
        TransportSpec::Broadcast { name } => {
            let hub = media
                .broadcast
                .as_ref()
                .ok_or_else(|| ChannelError::Unavailable("no broadcast hub".to_string()))?;
            BroadcastChannel::open(hub, name)
        }
        TransportSpec::Socket { url } => SocketChannel::connect(url).await?,
    };
    Ok(channel)
}
