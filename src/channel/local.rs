//! In-page event bus transport.
//!
//! Both ends of a local channel share one [`LocalBus`]. Every message posted
//! on the bus reaches every attached channel except its sender.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use super::mailbox::{Mailbox, Subscription};
use super::{Channel, ChannelCore, ChannelError, ConnectionState, Message, MessageHandler, TransportKind};
use crate::sync::lock;

/// A message on the bus, tagged with the channel that posted it.
#[derive(Clone, Debug)]
pub struct BusEnvelope {
    /// Posting channel.
    pub sender: Uuid,
    /// Payload.
    pub message: Message,
}

/// Shared in-page bus.
#[derive(Debug, Default)]
pub struct LocalBus {
    mailbox: Mailbox<BusEnvelope>,
}

impl LocalBus {
    /// Create a bus. Must be called within a tokio runtime.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mailbox: Mailbox::new(),
        })
    }

    /// Number of attached listeners.
    pub fn listener_count(&self) -> usize {
        self.mailbox.subscriber_count()
    }
}

/// One participant on a [`LocalBus`].
#[derive(Debug)]
pub struct LocalChannel {
    id: Uuid,
    bus: Arc<LocalBus>,
    core: Arc<ChannelCore>,
    listener: Mutex<Option<Subscription>>,
}

impl LocalChannel {
    /// Attach a new participant to `bus`.
    pub fn open(bus: &Arc<LocalBus>) -> Arc<Self> {
        let id = Uuid::new_v4();
        let core = ChannelCore::new(ConnectionState::Connected);

        let inbound = Arc::clone(&core);
        let listener = bus.mailbox.subscribe(Arc::new(move |envelope: &BusEnvelope| {
            if envelope.sender != id {
                inbound.dispatch(&envelope.message);
            }
        }));

        log::debug!("Local channel {} attached", id);
        Arc::new(Self {
            id,
            bus: Arc::clone(bus),
            core,
            listener: Mutex::new(Some(listener)),
        })
    }

    /// This participant's id.
    pub fn id(&self) -> Uuid {
        self.id
    }
}

#[async_trait]
impl Channel for LocalChannel {
    fn transport(&self) -> TransportKind {
        TransportKind::Local
    }

    fn send(&self, message: &Message) -> Result<(), ChannelError> {
        if self.core.is_closed() {
            return Ok(());
        }
        let envelope = BusEnvelope {
            sender: self.id,
            message: message.clone(),
        };
        if self.bus.mailbox.post(envelope) {
            Ok(())
        } else {
            Err(ChannelError::SendFailed("local bus is gone".to_string()))
        }
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
        log::debug!("Local channel {} closed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn collect(channel: &LocalChannel) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        channel.on_message(Arc::new(move |m: &Message| {
            let _ = tx.send(m.clone());
        }));
        rx
    }

    #[tokio::test]
    async fn test_peer_receives_and_sender_does_not() {
        let bus = LocalBus::new();
        let a = LocalChannel::open(&bus);
        let b = LocalChannel::open(&bus);
        let mut a_rx = collect(&a);
        let mut b_rx = collect(&b);

        a.send(&Message::response("1", json!(1))).unwrap();
        b.send(&Message::response("2", json!(2))).unwrap();

        assert_eq!(b_rx.recv().await.unwrap().id, "1");
        assert_eq!(a_rx.recv().await.unwrap().id, "2");
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_after_close_is_noop() {
        let bus = LocalBus::new();
        let a = LocalChannel::open(&bus);
        let b = LocalChannel::open(&bus);
        let mut b_rx = collect(&b);

        a.close().await;
        assert_eq!(a.state(), ConnectionState::Disconnected);
        assert!(a.send(&Message::response("x", json!(null))).is_ok());
        assert_eq!(bus.listener_count(), 1);

        b.send(&Message::response("y", json!(null))).unwrap();
        tokio::task::yield_now().await;
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_order_is_preserved() {
        let bus = LocalBus::new();
        let a = LocalChannel::open(&bus);
        let b = LocalChannel::open(&bus);
        let mut b_rx = collect(&b);

        for i in 0..20 {
            a.send(&Message::response(i.to_string(), json!(i))).unwrap();
        }
        for i in 0..20 {
            assert_eq!(b_rx.recv().await.unwrap().id, i.to_string());
        }
    }
}
