//! Handler lists and ordered in-process delivery.
//!
//! [`Handlers`] is a list of callbacks that can be added and removed while it
//! is being dispatched to. Dispatch snapshots the list and runs the callbacks
//! without holding the lock, so a callback may subscribe or unsubscribe.
//!
//! [`Mailbox`] puts a queue and a single pump task in front of a handler list.
//! Posting never runs handlers inline; the pump delivers in post order, one
//! message at a time.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc::{self, UnboundedSender};

use crate::sync::lock;

/// Callback type stored in a [`Handlers`] list.
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Something a [`Subscription`] can be removed from.
pub trait Unsubscribe: Send + Sync {
    /// Remove the handler registered under `id`.
    fn unsubscribe(&self, id: u64);
}

/// Handle to a registered handler.
///
/// Dropping the handle keeps the handler registered; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    id: u64,
    target: Weak<dyn Unsubscribe>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("live", &(self.target.strong_count() > 0))
            .finish()
    }
}

impl Subscription {
    /// Handler id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the handler. A no-op if the list is gone.
    pub fn unsubscribe(self) {
        if let Some(target) = self.target.upgrade() {
            target.unsubscribe(self.id);
        }
    }
}

/// A dispatchable list of handlers.
pub struct Handlers<T> {
    entries: Mutex<Vec<(u64, Handler<T>)>>,
    next_id: AtomicU64,
}

impl<T> fmt::Debug for Handlers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("count", &lock(&self.entries).len())
            .finish()
    }
}

impl<T: 'static> Handlers<T> {
    /// Empty shared list.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Add a handler.
    pub fn add(self: &Arc<Self>, handler: Handler<T>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.entries).push((id, handler));
        let weak = Arc::downgrade(self);
        let target: Weak<dyn Unsubscribe> = weak;
        Subscription { id, target }
    }

    /// Remove a handler by id.
    pub fn remove(&self, id: u64) -> bool {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|(hid, _)| *hid != id);
        entries.len() != before
    }

    /// Call every handler with `value`, in registration order.
    pub fn dispatch(&self, value: &T) {
        let handlers: Vec<Handler<T>> = lock(&self.entries)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(value);
        }
    }

    /// Number of handlers.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// True when no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every handler.
    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

impl<T: 'static> Unsubscribe for Handlers<T> {
    fn unsubscribe(&self, id: u64) {
        self.remove(id);
    }
}

/// Queue plus pump task delivering to a handler list in post order.
pub struct Mailbox<T> {
    tx: UnboundedSender<T>,
    handlers: Arc<Handlers<T>>,
}

impl<T> fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("handlers", &self.handlers)
            .field("open", &!self.tx.is_closed())
            .finish()
    }
}

impl<T: Send + Sync + 'static> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> Mailbox<T> {
    /// Create a mailbox. Must be called within a tokio runtime.
    ///
    /// The pump exits once the mailbox is dropped.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        let handlers = Handlers::new();
        let pump_handlers = Arc::clone(&handlers);
        tokio::spawn(async move {
            while let Some(value) = rx.recv().await {
                pump_handlers.dispatch(&value);
            }
        });
        Self { tx, handlers }
    }

    /// Queue `value` for delivery. Returns `false` if the pump is gone.
    pub fn post(&self, value: T) -> bool {
        self.tx.send(value).is_ok()
    }

    /// Register a delivery handler.
    pub fn subscribe(&self, handler: Handler<T>) -> Subscription {
        self.handlers.add(handler)
    }

    /// Registered handler count.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_unsubscribe_removes_handler() {
        let handlers: Arc<Handlers<u32>> = Handlers::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let sub = handlers.add(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        handlers.dispatch(&1);
        sub.unsubscribe();
        handlers.dispatch(&2);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(handlers.is_empty());
    }

    #[test]
    fn test_handler_may_unsubscribe_itself_during_dispatch() {
        let handlers: Arc<Handlers<u32>> = Handlers::new();
        let weak = Arc::downgrade(&handlers);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        handlers.add(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(list) = weak.upgrade() {
                list.clear();
            }
        }));

        handlers.dispatch(&1);
        handlers.dispatch(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mailbox_delivers_in_post_order() {
        let mailbox: Mailbox<u32> = Mailbox::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        mailbox.subscribe(Arc::new(move |v: &u32| {
            let _ = tx.send(*v);
        }));

        for i in 0..50 {
            assert!(mailbox.post(i));
        }
        let mut received = Vec::new();
        while received.len() < 50 {
            received.push(rx.recv().await.unwrap());
        }
        assert_eq!(received, (0..50).collect::<Vec<_>>());
    }
}
