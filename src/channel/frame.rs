//! Cross-frame transport.
//!
//! Windows deliver posted data to their own listeners, dropping anything whose
//! target origin does not match. On top of that, a [`FrameChannel`] only
//! accepts data that came from its peer's origin and that carries the inspector
//! envelope, since a page's windows also carry unrelated traffic.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;

use super::mailbox::{Mailbox, Subscription};
use super::{Channel, ChannelCore, ChannelError, ConnectionState, Message, MessageHandler, TransportKind};
use crate::sync::lock;

/// Value of the `source` field of every inspector envelope.
pub const ENVELOPE_SOURCE: &str = "fiberlens";

/// Wildcard target origin.
pub const ANY_ORIGIN: &str = "*";

/// Data delivered to a window.
#[derive(Clone, Debug)]
pub struct PostedMessage {
    /// Origin of the posting window.
    pub origin: String,
    /// Posted data.
    pub data: Value,
}

/// A browsing context that can receive posted messages.
#[derive(Debug)]
pub struct FrameWindow {
    origin: String,
    mailbox: Mailbox<PostedMessage>,
}

impl FrameWindow {
    /// Window at `origin`. Must be called within a tokio runtime.
    pub fn new(origin: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            origin: origin.into(),
            mailbox: Mailbox::new(),
        })
    }

    /// This window's origin.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Deliver `data` to this window if `target_origin` admits it.
    ///
    /// Returns whether the data was queued.
    pub fn post_message(&self, data: Value, target_origin: &str, sender_origin: &str) -> bool {
        if target_origin != ANY_ORIGIN && target_origin != self.origin {
            log::debug!(
                "Dropped message for {} at window {}",
                target_origin,
                self.origin
            );
            return false;
        }
        self.mailbox.post(PostedMessage {
            origin: sender_origin.to_string(),
            data,
        })
    }

    /// Listen to everything delivered to this window.
    pub fn add_listener(&self, handler: Arc<dyn Fn(&PostedMessage) + Send + Sync>) -> Subscription {
        self.mailbox.subscribe(handler)
    }
}

/// Channel between two windows.
#[derive(Debug)]
pub struct FrameChannel {
    local: Arc<FrameWindow>,
    remote: Arc<FrameWindow>,
    target_origin: String,
    core: Arc<ChannelCore>,
    listener: Mutex<Option<Subscription>>,
}

impl FrameChannel {
    /// Open a channel from `local` to `remote`, addressing messages to
    /// `target_origin`.
    pub fn open(local: Arc<FrameWindow>, remote: Arc<FrameWindow>, target_origin: String) -> Arc<Self> {
        let core = ChannelCore::new(ConnectionState::Connected);
        let expected_origin = remote.origin().to_string();

        let inbound = Arc::clone(&core);
        let listener = local.add_listener(Arc::new(move |posted: &PostedMessage| {
            if posted.origin != expected_origin {
                log::debug!("Ignoring message from unexpected origin {}", posted.origin);
                return;
            }
            match unwrap_envelope(&posted.data) {
                Some(Ok(message)) => inbound.dispatch(&message),
                Some(Err(e)) => log::warn!("Malformed frame message from {}: {}", posted.origin, e),
                // Someone else's traffic.
                None => {}
            }
        }));

        Arc::new(Self {
            local,
            remote,
            target_origin,
            core,
            listener: Mutex::new(Some(listener)),
        })
    }
}

fn unwrap_envelope(data: &Value) -> Option<Result<Message, ChannelError>> {
    if data.get("source").and_then(Value::as_str) != Some(ENVELOPE_SOURCE) {
        return None;
    }
    let payload = data.get("payload")?.clone();
    Some(serde_json::from_value(payload).map_err(|e| ChannelError::Codec(e.to_string())))
}

#[async_trait]
impl Channel for FrameChannel {
    fn transport(&self) -> TransportKind {
        TransportKind::Frame
    }

    fn send(&self, message: &Message) -> Result<(), ChannelError> {
        if self.core.is_closed() {
            return Ok(());
        }
        let payload = serde_json::to_value(message).map_err(|e| ChannelError::Codec(e.to_string()))?;
        let envelope = json!({ "source": ENVELOPE_SOURCE, "payload": payload });
        self.remote
            .post_message(envelope, &self.target_origin, self.local.origin());
        Ok(())
    }

    fn on_message(&self, handler: MessageHandler) -> Subscription {
        self.core.subscribe(handler)
    }

    fn state(&self) -> ConnectionState {
        self.core.state()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.core.watch_state()
    }

    async fn close(&self) {
        if !self.core.mark_closed() {
            return;
        }
        if let Some(listener) = lock(&self.listener).take() {
            listener.unsubscribe();
        }
        self.core.set_state(ConnectionState::Disconnected);
    }
}
