//! Debounced snapshot rebuilds.
//!
//! Runtimes commit in bursts. Each commit notice (re)arms a trailing timer for
//! its root; only when a root has been quiet for the debounce window does the
//! rebuild run, once, and its snapshot go out to every listener.
//!
//! Timers are plain tokio tasks. Re-arming aborts the previous task, and a
//! generation counter keeps a task that already woke up from clearing the
//! entry of its replacement.
//!
//! A rebuild that comes out empty means the root unmounted: its latest
//! snapshot and ids are dropped, and the empty tree still goes out so panels
//! can clear it.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use super::{SnapshotBuilder, SnapshotNode, SnapshotTree};
use crate::host::adapter::CommitNotice;
use crate::host::{NodeHandle, NodeIdentity};
use crate::sync::{lock, read, write};

/// Receives every completed snapshot.
pub type SnapshotListener = Arc<dyn Fn(&Arc<SnapshotTree>) -> anyhow::Result<()> + Send + Sync>;

struct PendingRebuild {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Coalesces commit notices into rebuilds and fans snapshots out.
pub struct RebuildScheduler {
    builder: SnapshotBuilder,
    debounce: Duration,
    timers: Mutex<HashMap<NodeIdentity, PendingRebuild>>,
    generation: AtomicU64,
    listeners: RwLock<Vec<(u64, SnapshotListener)>>,
    next_listener: AtomicU64,
    latest: RwLock<Vec<(NodeIdentity, Arc<SnapshotTree>)>>,
    rebuilds: AtomicU64,
}

impl std::fmt::Debug for RebuildScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebuildScheduler")
            .field("debounce", &self.debounce)
            .field("pending", &lock(&self.timers).len())
            .field("listeners", &read(&self.listeners).len())
            .field("rebuilds", &self.rebuild_count())
            .finish()
    }
}

impl RebuildScheduler {
    /// Scheduler that rebuilds with `builder` after `debounce` of quiet.
    pub fn new(builder: SnapshotBuilder, debounce: Duration) -> Arc<Self> {
        Arc::new(Self {
            builder,
            debounce,
            timers: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            latest: RwLock::new(Vec::new()),
            rebuilds: AtomicU64::new(0),
        })
    }

    /// (Re)arm the debounce timer for `root`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn request(self: &Arc<Self>, root: NodeHandle) {
        let identity = root.identity();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<Self> = Arc::downgrade(self);
        let debounce = self.debounce;

        // Held across spawn so a zero-length timer cannot look up its entry
        // before it is inserted.
        let mut timers = lock(&self.timers);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let Some(scheduler) = weak.upgrade() else {
                return;
            };
            {
                let mut timers = lock(&scheduler.timers);
                // Superseded after we woke up.
                if timers.get(&identity).map(|p| p.generation) != Some(generation) {
                    return;
                }
                timers.remove(&identity);
            }
            scheduler.rebuild_now(&root);
        });

        let previous = timers.insert(identity, PendingRebuild { generation, handle });
        drop(timers);
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    /// Rebuild `root` immediately and notify listeners.
    pub fn rebuild_now(&self, root: &NodeHandle) -> Arc<SnapshotTree> {
        let tree = Arc::new(self.builder.build(root));
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Rebuilt snapshot of root {} ({} nodes)",
            root.identity(),
            tree.node_count()
        );

        if tree.is_empty() {
            write(&self.latest).retain(|(id, _)| *id != root.identity());
            self.builder.forget_root(root);
            log::debug!("Root {} is empty, dropped its snapshot", root.identity());
        } else {
            let mut latest = write(&self.latest);
            match latest.iter_mut().find(|(id, _)| *id == root.identity()) {
                Some(slot) => slot.1 = Arc::clone(&tree),
                None => latest.push((root.identity(), Arc::clone(&tree))),
            }
        }

        let listeners: Vec<SnapshotListener> = read(&self.listeners)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(&tree))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("Snapshot listener failed: {:#}", e),
                Err(_) => log::error!("Snapshot listener panicked"),
            }
        }
        tree
    }

    /// Register a listener; returns a handle for [`remove_listener`].
    ///
    /// [`remove_listener`]: RebuildScheduler::remove_listener
    pub fn add_listener(&self, listener: SnapshotListener) -> u64 {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        write(&self.listeners).push((id, listener));
        id
    }

    /// Remove a listener. Unknown handles are ignored.
    pub fn remove_listener(&self, id: u64) -> bool {
        let mut listeners = write(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Latest snapshot of `root`.
    pub fn latest(&self, root: NodeIdentity) -> Option<Arc<SnapshotTree>> {
        read(&self.latest)
            .iter()
            .find(|(id, _)| *id == root)
            .map(|(_, tree)| Arc::clone(tree))
    }

    /// Top-level nodes of every root's latest snapshot, in discovery order.
    pub fn forest(&self) -> Vec<SnapshotNode> {
        read(&self.latest)
            .iter()
            .flat_map(|(_, tree)| tree.nodes.iter().cloned())
            .collect()
    }

    /// Completed rebuilds since creation.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }

    /// Roots with an armed timer.
    pub fn pending_count(&self) -> usize {
        lock(&self.timers).len()
    }

    /// The builder, for id resolution.
    pub fn builder(&self) -> &SnapshotBuilder {
        &self.builder
    }

    /// Abort every armed timer.
    pub fn cancel_all(&self) {
        for (_, pending) in lock(&self.timers).drain() {
            pending.handle.abort();
        }
    }
}

/// Feed commit notices into `scheduler` until the sender side closes.
pub fn spawn_commit_pump(
    scheduler: Arc<RebuildScheduler>,
    mut rx: UnboundedReceiver<CommitNotice>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notice) = rx.recv().await {
            log::trace!("Commit from renderer {}", notice.renderer);
            scheduler.request(notice.root);
        }
        log::debug!("Commit pump stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryNode;
    use crate::snapshot::BuildOptions;
    use std::sync::atomic::AtomicUsize;

    fn scheduler(ms: u64) -> Arc<RebuildScheduler> {
        RebuildScheduler::new(SnapshotBuilder::new(BuildOptions::default()), Duration::from_millis(ms))
    }

    fn counting_listener(counter: &Arc<AtomicUsize>) -> SnapshotListener {
        let counter = Arc::clone(counter);
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_within_window_rebuilds_once() {
        let scheduler = scheduler(200);
        let emitted = Arc::new(AtomicUsize::new(0));
        scheduler.add_listener(counting_listener(&emitted));

        let root = MemoryNode::root();
        root.append_child(&MemoryNode::component("App"));
        for _ in 0..5 {
            scheduler.request(root.handle());
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(scheduler.rebuild_count(), 1);
        assert_eq!(emitted.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending_count(), 0);
        assert_eq!(scheduler.forest().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_roots_debounce_independently() {
        let scheduler = scheduler(100);
        let first = MemoryNode::root();
        first.append_child(&MemoryNode::component("First"));
        let second = MemoryNode::root();
        second.append_child(&MemoryNode::component("Second"));
        scheduler.request(first.handle());
        scheduler.request(second.handle());
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(scheduler.rebuild_count(), 2);
        assert!(scheduler.latest(first.handle().identity()).is_some());
        assert!(scheduler.latest(second.handle().identity()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_listener_does_not_block_others() {
        let scheduler = scheduler(10);
        let emitted = Arc::new(AtomicUsize::new(0));
        scheduler.add_listener(Arc::new(|_| anyhow::bail!("listener broke")));
        scheduler.add_listener(counting_listener(&emitted));

        scheduler.request(MemoryNode::root().handle());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(emitted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_drops_pending_rebuilds() {
        let scheduler = scheduler(100);
        scheduler.request(MemoryNode::root().handle());
        scheduler.cancel_all();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(scheduler.rebuild_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_listener_is_not_called() {
        let scheduler = scheduler(10);
        let emitted = Arc::new(AtomicUsize::new(0));
        let id = scheduler.add_listener(counting_listener(&emitted));
        assert!(scheduler.remove_listener(id));
        assert!(!scheduler.remove_listener(id));

        scheduler.rebuild_now(&MemoryNode::root().handle());
        assert_eq!(emitted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_listener_does_not_block_others() {
        let scheduler = scheduler(10);
        let emitted = Arc::new(AtomicUsize::new(0));
        scheduler.add_listener(Arc::new(|_: &Arc<SnapshotTree>| -> anyhow::Result<()> { panic!("listener bug") }));
        scheduler.add_listener(counting_listener(&emitted));

        let root = MemoryNode::root();
        root.append_child(&MemoryNode::component("App"));
        scheduler.request(root.handle());
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.request(root.handle());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(emitted.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.rebuild_count(), 2);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn test_unmounted_root_is_dropped_but_still_emitted() {
        let scheduler = scheduler(10);
        let emitted = Arc::new(AtomicUsize::new(0));
        scheduler.add_listener(counting_listener(&emitted));

        let root = MemoryNode::root();
        let app = MemoryNode::component("App");
        root.append_child(&app);
        let before = scheduler.rebuild_now(&root.handle());
        let app_id = before.nodes[0].id.clone();
        assert!(scheduler.latest(root.handle().identity()).is_some());

        root.set_children(Vec::new());
        assert!(scheduler.rebuild_now(&root.handle()).is_empty());
        assert!(scheduler.latest(root.handle().identity()).is_none());
        assert!(scheduler.forest().is_empty());
        assert!(scheduler.builder().resolve(&app_id).is_none());
        assert_eq!(emitted.load(Ordering::SeqCst), 2);
    }
}
