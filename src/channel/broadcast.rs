//! Named cross-tab broadcast transport.
//!
//! Every participant joined to the same name on a [`BroadcastHub`] sees every
//! frame posted under that name, including its own; the receive task drops
//! frames carrying its own sender id.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::mailbox::Subscription;
use super::{Channel, ChannelCore, ChannelError, ConnectionState, Message, MessageHandler, TransportKind};
use crate::sync::lock;

/// Frames buffered per name before slow receivers start lagging.
const HUB_CAPACITY: usize = 256;

/// A frame as it travels through the hub. Payloads are encoded text, the way
/// they would cross a real tab boundary.
#[derive(Clone, Debug)]
pub struct BroadcastFrame {
    /// Posting participant.
    pub sender: Uuid,
    /// Encoded [`Message`].
    pub payload: String,
}

/// Registry of named broadcast channels.
pub struct BroadcastHub {
    senders: Mutex<HashMap<String, broadcast::Sender<BroadcastFrame>>>,
}

impl fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("names", &lock(&self.senders).len())
            .finish()
    }
}

impl BroadcastHub {
    /// Empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            senders: Mutex::new(HashMap::new()),
        })
    }

    /// Sender for `name`, created on first use.
    pub fn sender(&self, name: &str) -> broadcast::Sender<BroadcastFrame> {
        lock(&self.senders)
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(HUB_CAPACITY).0)
            .clone()
    }

    /// Number of live receivers on `name`.
    pub fn receiver_count(&self, name: &str) -> usize {
        lock(&self.senders)
            .get(name)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

/// One participant of a named broadcast.
#[derive(Debug)]
pub struct BroadcastChannel {
    id: Uuid,
    name: String,
    sender: broadcast::Sender<BroadcastFrame>,
    core: Arc<ChannelCore>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl BroadcastChannel {
    /// Join `name` on `hub`. Must be called within a tokio runtime.
    pub fn open(hub: &Arc<BroadcastHub>, name: &str) -> Arc<Self> {
        let id = Uuid::new_v4();
        let sender = hub.sender(name);
        let mut rx = sender.subscribe();
        let core = ChannelCore::new(ConnectionState::Connected);

        let inbound = Arc::clone(&core);
        let channel_name = name.to_string();
        let receiver = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) if frame.sender == id => {}
                    Ok(frame) => match Message::decode(&frame.payload) {
                        Ok(message) => inbound.dispatch(&message),
                        Err(e) => log::warn!("Bad frame on broadcast '{}': {}", channel_name, e),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Broadcast '{}' lagged, {} frames lost", channel_name, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Arc::new(Self {
            id,
            name: name.to_string(),
            sender,
            core,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    /// Broadcast name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Channel for BroadcastChannel {
    fn transport(&self) -> TransportKind {
        TransportKind::Broadcast
    }

    fn send(&self, message: &Message) -> Result<(), ChannelError> {
        if self.core.is_closed() {
            return Ok(());
        }
        let frame = BroadcastFrame {
            sender: self.id,
            payload: message.encode()?,
        };
        // Only our own receiver is listening: nobody to deliver to.
        if self.sender.send(frame).is_err() {
            log::debug!("No listeners on broadcast '{}'", self.name);
        }
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
        if let Some(receiver) = lock(&self.receiver).take() {
            receiver.abort();
        }
        self.core.set_state(ConnectionState::Disconnected);
        log::debug!("Left broadcast '{}'", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn collect(channel: &BroadcastChannel) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        channel.on_message(Arc::new(move |m: &Message| {
            let _ = tx.send(m.clone());
        }));
        rx
    }

    #[tokio::test]
    async fn test_own_echo_is_filtered() {
        let hub = BroadcastHub::new();
        let a = BroadcastChannel::open(&hub, "fiberlens");
        let b = BroadcastChannel::open(&hub, "fiberlens");
        let mut a_rx = collect(&a);
        let mut b_rx = collect(&b);

        a.send(&Message::response("from-a", json!(1))).unwrap();
        b.send(&Message::response("from-b", json!(2))).unwrap();

        assert_eq!(b_rx.recv().await.unwrap().id, "from-a");
        assert_eq!(a_rx.recv().await.unwrap().id, "from-b");
        tokio::task::yield_now().await;
        assert!(a_rx.try_recv().is_err());
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_names_are_isolated() {
        let hub = BroadcastHub::new();
        let a = BroadcastChannel::open(&hub, "one");
        let b = BroadcastChannel::open(&hub, "two");
        let mut b_rx = collect(&b);

        a.send(&Message::response("x", json!(null))).unwrap();
        tokio::task::yield_now().await;
        assert!(b_rx.try_recv().is_err());
        assert_eq!(hub.receiver_count("one"), 1);
    }

    #[tokio::test]
    async fn test_close_leaves_the_broadcast() {
        let hub = BroadcastHub::new();
        let a = BroadcastChannel::open(&hub, "fiberlens");
        let _b = BroadcastChannel::open(&hub, "fiberlens");
        assert_eq!(hub.receiver_count("fiberlens"), 2);

        a.close().await;
        a.close().await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(hub.receiver_count("fiberlens"), 1);
        assert_eq!(a.state(), ConnectionState::Disconnected);
        assert!(a.send(&Message::response("x", json!(null))).is_ok());
    }
}
