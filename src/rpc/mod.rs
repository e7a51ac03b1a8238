//! Request/response correlation over a [`Channel`].
//!
//! An [`RpcPeer`] sits on one channel. Outbound calls get a fresh UUID, are
//! tracked as [`PendingCall`]s until the matching response arrives, and are
//! rejected on timeout or when the channel reaches a terminal state. Inbound
//! requests are dispatched to a shared [`RpcTable`] and answered with the
//! request's id. Requests with an empty id are notifications and get no reply.
//!
//! On a shared medium ([`crate::channel::TransportKind::is_shared`]) every peer overhears
//! every request, so a peer only answers methods it implements. A call nobody
//! implements there ends in a timeout rather than `method_not_found`.

pub mod table;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::channel::{Channel, ChannelError, ConnectionState, ErrorCode, Message, Subscription, WireError};
use crate::sync::lock;

pub use table::{handler, RpcHandler, RpcTable};

/// Default time a call waits for its response.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// RPC failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// No handler for the method.
    #[error("method not found: {0}")]
    MethodNotFound(String),
    /// The method name is already registered.
    #[error("method already registered: {0}")]
    DuplicateMethod(String),
    /// No response in time.
    #[error("call to {method} timed out after {timeout:?}")]
    Timeout {
        /// Called method.
        method: String,
        /// Configured timeout.
        timeout: Duration,
    },
    /// The channel closed before a response arrived.
    #[error("channel closed")]
    Closed,
    /// The peer answered with an error.
    #[error("remote error: {}", .0.message)]
    Remote(WireError),
    /// A local handler failed.
    #[error("handler failed: {0}")]
    Handler(String),
    /// The request could not be handed to the transport.
    #[error(transparent)]
    Transport(#[from] ChannelError),
}

impl RpcError {
    /// Wire code for this error. Remote errors keep the peer's code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MethodNotFound(_) => ErrorCode::MethodNotFound,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Closed => ErrorCode::Closed,
            Self::Remote(wire) => wire.code,
            Self::DuplicateMethod(_) | Self::Handler(_) | Self::Transport(_) => ErrorCode::HandlerError,
        }
    }

    /// Error payload to answer a request with.
    pub fn to_wire(&self) -> WireError {
        match self {
            Self::Remote(wire) => wire.clone(),
            Self::Handler(message) => WireError::new(ErrorCode::HandlerError, message.clone()),
            other => WireError::new(other.code(), other.to_string()),
        }
    }
}

/// A call waiting for its response.
pub struct PendingCall {
    method: String,
    resolve: oneshot::Sender<Result<Value, RpcError>>,
    timer: JoinHandle<()>,
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("method", &self.method)
            .finish()
    }
}

impl PendingCall {
    fn settle(self, outcome: Result<Value, RpcError>) {
        self.timer.abort();
        // The caller may have given up on the future.
        let _ = self.resolve.send(outcome);
    }
}

/// One end of an RPC conversation.
pub struct RpcPeer {
    channel: Arc<dyn Channel>,
    table: Arc<RpcTable>,
    timeout: Duration,
    pending: Mutex<HashMap<String, PendingCall>>,
    listener: Mutex<Option<Subscription>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl fmt::Debug for RpcPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcPeer")
            .field("channel", &self.channel)
            .field("timeout", &self.timeout)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl RpcPeer {
    /// Attach to `channel`, answering requests from `table`.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(channel: Arc<dyn Channel>, table: Arc<RpcTable>, timeout: Duration) -> Arc<Self> {
        let peer = Arc::new(Self {
            channel: Arc::clone(&channel),
            table,
            timeout,
            pending: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            watcher: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&peer);
        let listener = channel.on_message(Arc::new(move |message: &Message| {
            if let Some(peer) = weak.upgrade() {
                peer.handle_message(message);
            }
        }));
        *lock(&peer.listener) = Some(listener);

        let weak: Weak<Self> = Arc::downgrade(&peer);
        let mut state = channel.watch_state();
        let watcher = tokio::spawn(async move {
            // An error here means the channel itself is gone.
            let _ = state.wait_for(ConnectionState::is_terminal).await;
            if let Some(peer) = weak.upgrade() {
                peer.reject_all();
            }
        });
        *lock(&peer.watcher) = Some(watcher);

        peer
    }

    /// Underlying channel.
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Method table answering inbound requests.
    pub fn table(&self) -> &Arc<RpcTable> {
        &self.table
    }

    /// Call `method` on the other side and wait for its result.
    pub async fn call(self: &Arc<Self>, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }

        let id = Uuid::new_v4().to_string();
        let (resolve, outcome) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            let timer = self.spawn_timer(id.clone(), method.to_string());
            pending.insert(
                id.clone(),
                PendingCall {
                    method: method.to_string(),
                    resolve,
                    timer,
                },
            );
        }

        if let Err(e) = self.channel.send(&Message::request(id.clone(), method, args)) {
            if let Some(call) = lock(&self.pending).remove(&id) {
                call.timer.abort();
            }
            return Err(e.into());
        }

        match outcome.await {
            Ok(result) => result,
            // Sender dropped without settling: the peer went away.
            Err(_) => Err(RpcError::Closed),
        }
    }

    /// Send `method` without waiting for, or expecting, a reply.
    pub fn notify(&self, method: &str, args: Vec<Value>) -> Result<(), RpcError> {
        if self.is_closed() {
            return Ok(());
        }
        self.channel
            .send(&Message::request(String::new(), method, args))
            .map_err(RpcError::from)
    }

    /// Calls awaiting a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Whether this peer can no longer make calls.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.channel.state().is_terminal()
    }

    /// Reject every pending call, detach from the channel and close it.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(listener) = lock(&self.listener).take() {
            listener.unsubscribe();
        }
        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.abort();
        }
        self.reject_all();
        self.channel.close().await;
    }

    fn spawn_timer(self: &Arc<Self>, id: String, method: String) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(peer) = weak.upgrade() else {
                return;
            };
            let call = lock(&peer.pending).remove(&id);
            if let Some(call) = call {
                log::warn!("RPC {} ({}) timed out after {:?}", method, id, timeout);
                // Settling would abort this very task; resolve directly.
                let _ = call.resolve.send(Err(RpcError::Timeout { method, timeout }));
            }
        })
    }

    fn reject_all(&self) {
        let calls: Vec<PendingCall> = lock(&self.pending).drain().map(|(_, call)| call).collect();
        if !calls.is_empty() {
            log::info!("Rejecting {} pending RPC call(s): channel closed", calls.len());
        }
        for call in calls {
            call.settle(Err(RpcError::Closed));
        }
    }

    fn handle_message(&self, message: &Message) {
        let Some(method) = message.method.clone() else {
            self.handle_response(message);
            return;
        };
        if self.channel.transport().is_shared() && !self.table.contains(&method) {
            log::trace!("Ignoring overheard request for {}", method);
            return;
        }

        let table = Arc::clone(&self.table);
        let channel = Arc::clone(&self.channel);
        let id = message.id.clone();
        let args = message.args.clone().unwrap_or_default();
        tokio::spawn(async move {
            let outcome = table.invoke(&method, args).await;
            if id.is_empty() {
                if let Err(e) = outcome {
                    log::debug!("Notification {} failed: {}", method, e);
                }
                return;
            }
            let reply = match outcome {
                Ok(result) => Message::response(id, result),
                Err(e) => {
                    log::debug!("RPC {} failed: {}", method, e);
                    Message::failure(id, e.to_wire())
                }
            };
            if let Err(e) = channel.send(&reply) {
                log::warn!("Failed to answer {}: {}", method, e);
            }
        });
    }

    fn handle_response(&self, message: &Message) {
        let call = lock(&self.pending).remove(&message.id);
        let Some(call) = call else {
            log::debug!("Dropping response to unknown call {}", message.id);
            return;
        };
        let outcome = match &message.error {
            Some(error) => Err(RpcError::Remote(error.clone())),
            None => Ok(message.result.clone().unwrap_or(Value::Null)),
        };
        call.settle(outcome);
    }
}

impl Drop for RpcPeer {
    fn drop(&mut self) {
        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.abort();
        }
        for (_, call) in lock(&self.pending).drain() {
            call.timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{FrameChannel, FrameWindow, LocalBus, LocalChannel};
    use serde_json::json;

    fn pair(timeout: Duration) -> (Arc<RpcPeer>, Arc<RpcPeer>) {
        let bus = LocalBus::new();
        let a = RpcPeer::new(LocalChannel::open(&bus), RpcTable::new(), timeout);
        let b = RpcPeer::new(LocalChannel::open(&bus), RpcTable::new(), timeout);
        (a, b)
    }

    #[tokio::test]
    async fn test_call_resolves_with_remote_value() {
        let (a, b) = pair(DEFAULT_TIMEOUT);
        b.table()
            .register("echo.twice", handler(|args| async move {
                let n = args.first().and_then(Value::as_i64).unwrap_or_default();
                Ok(json!(n * 2))
            }))
            .unwrap();

        assert_eq!(a.call("echo.twice", vec![json!(21)]).await.unwrap(), json!(42));
        assert_eq!(a.pending_count(), 0);
    }

    fn frame_pair(timeout: Duration) -> (Arc<RpcPeer>, Arc<RpcPeer>) {
        let host = FrameWindow::new("https://host.test");
        let panel = FrameWindow::new("https://panel.test");
        let a = RpcPeer::new(
            FrameChannel::open(Arc::clone(&panel), Arc::clone(&host), "https://host.test".to_string()),
            RpcTable::new(),
            timeout,
        );
        let b = RpcPeer::new(
            FrameChannel::open(host, panel, "https://panel.test".to_string()),
            RpcTable::new(),
            timeout,
        );
        (a, b)
    }

    #[tokio::test]
    async fn test_unknown_method_rejects_with_method_not_found() {
        let (a, _b) = frame_pair(DEFAULT_TIMEOUT);
        let err = a.call("nobody.home", vec![]).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MethodNotFound);
        assert!(matches!(err, RpcError::Remote(_)));
    }

    #[tokio::test]
    async fn test_bystander_on_shared_bus_stays_silent() {
        let bus = LocalBus::new();
        // Joins first, so its reply would win the race if it answered.
        let bystander = RpcPeer::new(LocalChannel::open(&bus), RpcTable::new(), DEFAULT_TIMEOUT);
        let host = RpcPeer::new(LocalChannel::open(&bus), RpcTable::new(), DEFAULT_TIMEOUT);
        host.table()
            .register("core.getTree", handler(|_| async { Ok(json!([])) }))
            .unwrap();
        let panel = RpcPeer::new(LocalChannel::open(&bus), RpcTable::new(), DEFAULT_TIMEOUT);

        for _ in 0..5 {
            assert_eq!(panel.call("core.getTree", vec![]).await.unwrap(), json!([]));
        }
        assert_eq!(bystander.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unimplemented_method_on_shared_bus_times_out() {
        let (a, _b) = pair(Duration::from_secs(2));
        let err = a.call("nobody.home", vec![]).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Timeout);
        assert_eq!(a.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_answers_handler_error() {
        let (a, b) = frame_pair(Duration::from_secs(2));
        b.table()
            .register("p.boom", handler(|_| async {
                let missing: Option<Value> = None;
                Ok(missing.expect("boom"))
            }))
            .unwrap();

        let started = tokio::time::Instant::now();
        let err = a.call("p.boom", vec![]).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::HandlerError);
        assert!(err.to_wire().message.contains("boom"));
        assert!(started.elapsed() < Duration::from_secs(2));

        b.table().register("p.fine", handler(|_| async { Ok(json!(1)) })).unwrap();
        assert_eq!(a.call("p.fine", vec![]).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_handler_error_reaches_caller() {
        let (a, b) = pair(DEFAULT_TIMEOUT);
        b.table()
            .register("x.fail", handler(|_| async { Err(anyhow::anyhow!("no luck")) }))
            .unwrap();
        let err = a.call("x.fail", vec![]).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::HandlerError);
        assert_eq!(err.to_wire().message, "no luck");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_times_out_and_is_forgotten() {
        let bus = LocalBus::new();
        let a = RpcPeer::new(LocalChannel::open(&bus), RpcTable::new(), Duration::from_secs(30));
        // A silent listener that never answers.
        let _silent = LocalChannel::open(&bus);

        let started = tokio::time::Instant::now();
        let err = a.call("slow.op", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout { ref method, .. } if method == "slow.op"));
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(a.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_rejects_all_pending_calls() {
        let bus = LocalBus::new();
        let channel: Arc<dyn Channel> = LocalChannel::open(&bus);
        let a = RpcPeer::new(Arc::clone(&channel), RpcTable::new(), DEFAULT_TIMEOUT);

        let first = tokio::spawn({
            let a = Arc::clone(&a);
            async move { a.call("p.one", vec![]).await }
        });
        let second = tokio::spawn({
            let a = Arc::clone(&a);
            async move { a.call("p.two", vec![]).await }
        });
        while a.pending_count() < 2 {
            tokio::task::yield_now().await;
        }

        channel.close().await;
        assert_eq!(first.await.unwrap(), Err(RpcError::Closed));
        assert_eq!(second.await.unwrap(), Err(RpcError::Closed));
        assert_eq!(a.pending_count(), 0);
        assert!(channel.send(&Message::response("late", json!(null))).is_ok());
        assert_eq!(a.call("p.three", vec![]).await, Err(RpcError::Closed));
    }

    #[tokio::test]
    async fn test_notify_gets_no_reply() {
        let (a, b) = pair(DEFAULT_TIMEOUT);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        b.table()
            .register("panel.treeUpdated", handler(move |args| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(args);
                    Ok(Value::Null)
                }
            }))
            .unwrap();

        a.notify("panel.treeUpdated", vec![json!({"rootId": "n1"})]).unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![json!({"rootId": "n1"})]);
        assert_eq!(a.pending_count(), 0);
        assert_eq!(b.pending_count(), 0);
    }
}
