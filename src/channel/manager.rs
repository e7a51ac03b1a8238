//! Named connections with automatic reconnection.
//!
//! The manager builds each channel from a [`ChannelFactory`]. Failed attempts
//! are retried with exponential backoff; once a channel is up, a supervisor
//! task watches its state and rebuilds it when the transport errors. A closed
//! channel is left alone. Running out of attempts emits
//! [`ConnectionEvent::Failed`] and leaves the name disconnected.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::mailbox::{Handler, Handlers, Subscription};
use super::{Channel, ChannelError, ConnectionState};
use crate::sync::lock;

/// Builds a fresh channel. Called once per connection attempt.
pub type ChannelFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn Channel>, ChannelError>> + Send + Sync>;

/// Slot holding the live channel of a name, if any.
type ChannelSlot = Arc<watch::Sender<Option<Arc<dyn Channel>>>>;

/// Retry timing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub initial: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
    /// Attempts before giving up, including the first.
    pub max_attempts: u32,
    /// Add up to 10% random delay.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(10),
            max_attempts: 6,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the retry that follows `failures` consecutive failures,
    /// without jitter.
    pub fn base_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = failures.saturating_sub(1).min(16);
        self.initial.saturating_mul(1u32 << exponent).min(self.max)
    }
}

#[derive(Debug, Default)]
struct Backoff {
    consecutive_failures: u32,
}

impl Backoff {
    fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    fn current_delay(&self, policy: &BackoffPolicy) -> Duration {
        let base = policy.base_delay(self.consecutive_failures);
        if !policy.jitter || base.is_zero() {
            return base;
        }
        let spread = (base.as_millis() / 10).max(1) as u64;
        let jitter = Duration::from_millis(rand::rng().random_range(0..=spread));
        (base + jitter).min(policy.max)
    }
}

/// Lifecycle notifications for managed connections.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A channel came up.
    Connected {
        /// Connection name.
        name: String,
        /// Attempt that succeeded, starting at 1.
        attempt: u32,
    },
    /// An attempt failed; another follows after `delay`.
    Reconnecting {
        /// Connection name.
        name: String,
        /// Attempt that failed.
        attempt: u32,
        /// Wait before the next attempt.
        delay: Duration,
    },
    /// Every attempt failed. Terminal for this name.
    Failed {
        /// Connection name.
        name: String,
        /// Attempts made.
        attempts: u32,
        /// Last error.
        error: String,
    },
    /// The connection was closed locally.
    Closed {
        /// Connection name.
        name: String,
    },
}

struct Managed {
    slot: ChannelSlot,
    supervisor: JoinHandle<()>,
}

/// Tracks named channels and keeps them connected.
pub struct ConnectionManager {
    policy: BackoffPolicy,
    connections: Mutex<HashMap<String, Managed>>,
    observers: Arc<Handlers<ConnectionEvent>>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = lock(&self.connections).keys().cloned().collect();
        f.debug_struct("ConnectionManager")
            .field("policy", &self.policy)
            .field("connections", &names)
            .finish()
    }
}

impl ConnectionManager {
    /// Manager retrying with `policy`.
    pub fn new(policy: BackoffPolicy) -> Arc<Self> {
        Arc::new(Self {
            policy,
            connections: Mutex::new(HashMap::new()),
            observers: Handlers::new(),
        })
    }

    /// Retry policy.
    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Register a connection event observer.
    pub fn observe(&self, handler: Handler<ConnectionEvent>) -> Subscription {
        self.observers.add(handler)
    }

    /// Connect `name` using `factory`, retrying per policy.
    ///
    /// An existing connection under the same name is closed first. On success
    /// the channel is supervised and rebuilt with the same factory whenever it
    /// errors.
    pub async fn connect(&self, name: &str, factory: ChannelFactory) -> Result<Arc<dyn Channel>, ChannelError> {
        self.close(name).await;

        let channel = establish(name, &factory, &self.policy, &self.observers).await?;
        let slot: ChannelSlot = Arc::new(watch::channel(Some(Arc::clone(&channel))).0);

        let supervisor = tokio::spawn(supervise(
            name.to_string(),
            Arc::clone(&channel),
            factory,
            self.policy,
            Arc::clone(&self.observers),
            Arc::clone(&slot),
        ));

        let previous = lock(&self.connections).insert(name.to_string(), Managed { slot, supervisor });
        if let Some(previous) = previous {
            // A concurrent connect for the same name won the race; keep ours.
            previous.supervisor.abort();
            let stale = previous.slot.send_replace(None);
            if let Some(stale) = stale {
                stale.close().await;
            }
        }
        Ok(channel)
    }

    /// Current channel for `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Channel>> {
        lock(&self.connections)
            .get(name)
            .and_then(|managed| managed.slot.borrow().clone())
    }

    /// Follow the channel behind `name` across reconnections. `None` while
    /// reconnecting or after failure.
    pub fn watch(&self, name: &str) -> Option<watch::Receiver<Option<Arc<dyn Channel>>>> {
        lock(&self.connections)
            .get(name)
            .map(|managed| managed.slot.subscribe())
    }

    /// Managed names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.connections).keys().cloned().collect();
        names.sort();
        names
    }

    /// Close `name` and stop supervising it.
    pub async fn close(&self, name: &str) -> bool {
        let Some(managed) = lock(&self.connections).remove(name) else {
            return false;
        };
        managed.supervisor.abort();
        let channel = managed.slot.send_replace(None);
        if let Some(channel) = channel {
            channel.close().await;
        }
        log::info!("Connection '{}' closed", name);
        self.observers.dispatch(&ConnectionEvent::Closed {
            name: name.to_string(),
        });
        true
    }

    /// Close every managed connection.
    pub async fn close_all(&self) {
        for name in self.names() {
            self.close(&name).await;
        }
    }
}

async fn establish(
    name: &str,
    factory: &ChannelFactory,
    policy: &BackoffPolicy,
    observers: &Handlers<ConnectionEvent>,
) -> Result<Arc<dyn Channel>, ChannelError> {
    let mut backoff = Backoff::default();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match factory().await {
            Ok(channel) => {
                backoff.record_success();
                log::info!("Connection '{}' established (attempt {})", name, attempt);
                observers.dispatch(&ConnectionEvent::Connected {
                    name: name.to_string(),
                    attempt,
                });
                return Ok(channel);
            }
            Err(e) => {
                backoff.record_failure();
                if attempt >= max_attempts {
                    log::warn!("Connection '{}' failed after {} attempts: {}", name, attempt, e);
                    observers.dispatch(&ConnectionEvent::Failed {
                        name: name.to_string(),
                        attempts: attempt,
                        error: e.to_string(),
                    });
                    return Err(e);
                }
                let delay = backoff.current_delay(policy);
                log::info!(
                    "Connection '{}' attempt {} failed ({}), retrying in {:.1}s",
                    name,
                    attempt,
                    e,
                    delay.as_secs_f32()
                );
                observers.dispatch(&ConnectionEvent::Reconnecting {
                    name: name.to_string(),
                    attempt,
                    delay,
                });
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

async fn supervise(
    name: String,
    mut channel: Arc<dyn Channel>,
    factory: ChannelFactory,
    policy: BackoffPolicy,
    observers: Arc<Handlers<ConnectionEvent>>,
    slot: ChannelSlot,
) {
    loop {
        let mut state = channel.watch_state();
        let ended = state
            .wait_for(ConnectionState::is_terminal)
            .await
            .map(|s| s.clone())
            .unwrap_or(ConnectionState::Disconnected);

        let ConnectionState::Error(reason) = ended else {
            log::debug!("Connection '{}' closed, supervisor exiting", name);
            return;
        };

        log::warn!("Connection '{}' lost: {}", name, reason);
        slot.send_replace(None);
        match establish(&name, &factory, &policy, &observers).await {
            Ok(fresh) => {
                slot.send_replace(Some(Arc::clone(&fresh)));
                channel = fresh;
            }
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelCore, Message, MessageHandler, TransportKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct StubChannel {
        core: Arc<ChannelCore>,
    }

    impl StubChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                core: ChannelCore::new(ConnectionState::Connected),
            })
        }

        fn fail(&self) {
            self.core.set_state(ConnectionState::Error("reset".to_string()));
        }
    }

    #[async_trait]
    impl Channel for StubChannel {
        fn transport(&self) -> TransportKind {
            TransportKind::Local
        }
        fn send(&self, _message: &Message) -> Result<(), ChannelError> {
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
            self.core.mark_closed();
            self.core.set_state(ConnectionState::Disconnected);
        }
    }

    /// Factory failing the first `failures` calls, then handing out stub channels.
    fn flaky(failures: u32, made: Arc<Mutex<Vec<Arc<StubChannel>>>>) -> (ChannelFactory, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let factory: ChannelFactory = Arc::new(move || -> BoxFuture<'static, Result<Arc<dyn Channel>, ChannelError>> {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let made = Arc::clone(&made);
            Box::pin(async move {
                if n < failures {
                    return Err(ChannelError::ConnectionFailed(format!("refused #{n}")));
                }
                let stub = StubChannel::new();
                lock(&made).push(Arc::clone(&stub));
                let channel: Arc<dyn Channel> = stub;
                Ok(channel)
            })
        });
        (factory, calls)
    }

    fn recorder(manager: &ConnectionManager) -> Arc<Mutex<Vec<ConnectionEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        manager.observe(Arc::new(move |e: &ConnectionEvent| lock(&sink).push(e.clone())));
        events
    }

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(250),
            max_attempts,
            jitter: false,
        }
    }

    #[test]
    fn test_base_delay_doubles_and_caps() {
        let p = policy(10);
        assert_eq!(p.base_delay(0), Duration::ZERO);
        assert_eq!(p.base_delay(1), Duration::from_millis(100));
        assert_eq!(p.base_delay(2), Duration::from_millis(200));
        assert_eq!(p.base_delay(3), Duration::from_millis(250));
        assert_eq!(p.base_delay(u32::MAX), Duration::from_millis(250));
    }

    #[test]
    fn test_jitter_stays_within_cap() {
        let p = BackoffPolicy {
            jitter: true,
            ..policy(10)
        };
        let mut backoff = Backoff::default();
        backoff.record_failure();
        for _ in 0..100 {
            let d = backoff.current_delay(&p);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(110));
        }
        backoff.record_success();
        assert_eq!(backoff.current_delay(&p), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_backoff_until_connected() {
        let manager = ConnectionManager::new(policy(5));
        let events = recorder(&manager);
        let (factory, calls) = flaky(2, Arc::new(Mutex::new(Vec::new())));

        let start = tokio::time::Instant::now();
        manager.connect("panel", factory).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(310));
        let events = lock(&events).clone();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[1], ConnectionEvent::Reconnecting { attempt: 2, delay, .. } if *delay == Duration::from_millis(200)));
        assert!(matches!(&events[2], ConnectionEvent::Connected { attempt: 3, .. }));
        assert!(manager.get("panel").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_emits_failed() {
        let manager = ConnectionManager::new(policy(3));
        let events = recorder(&manager);
        let (factory, calls) = flaky(u32::MAX, Arc::new(Mutex::new(Vec::new())));

        let err = manager.connect("panel", factory).await.unwrap_err();
        assert!(matches!(err, ChannelError::ConnectionFailed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(
            lock(&events).last(),
            Some(ConnectionEvent::Failed { attempts: 3, .. })
        ));
        assert!(manager.get("panel").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_triggers_reconnect() {
        let manager = ConnectionManager::new(policy(3));
        let made = Arc::new(Mutex::new(Vec::new()));
        let (factory, calls) = flaky(0, Arc::clone(&made));

        manager.connect("panel", factory).await.unwrap();
        let mut watch = manager.watch("panel").unwrap();

        let first = Arc::clone(&lock(&made)[0]);
        first.fail();

        let replaced = watch
            .wait_for(|c| matches!(c, Some(ch) if ch.state() == ConnectionState::Connected))
            .await
            .is_ok();
        assert!(replaced);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(lock(&made).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_supervision() {
        let manager = ConnectionManager::new(policy(3));
        let events = recorder(&manager);
        let made = Arc::new(Mutex::new(Vec::new()));
        let (factory, calls) = flaky(0, Arc::clone(&made));

        let channel = manager.connect("panel", factory).await.unwrap();
        assert!(manager.close("panel").await);
        assert!(!manager.close("panel").await);
        assert_eq!(channel.state(), ConnectionState::Disconnected);

        lock(&made)[0].fail();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(lock(&events).last(), Some(ConnectionEvent::Closed { .. })));
    }
}
