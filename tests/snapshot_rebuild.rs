//! Integration tests for snapshot rebuilds driven through the commit hook.
//!
//! These tests run the real adapter, commit pump and scheduler against an
//! in-memory runtime, with tokio time paused so debounce windows are exact.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fiberlens::host::adapter::HookAdapter;
use fiberlens::host::dom::Document;
use fiberlens::host::hook::{HostEnvironment, RendererInfo};
use fiberlens::host::memory::MemoryNode;
use fiberlens::snapshot::{spawn_commit_pump, BuildOptions, RebuildScheduler, SnapshotBuilder};
use fiberlens::{SnapshotNode, SnapshotTree};
use tokio::sync::mpsc;

const DEBOUNCE: Duration = Duration::from_millis(200);

struct Rig {
    env: Arc<HostEnvironment>,
    _adapter: Arc<HookAdapter>,
    scheduler: Arc<RebuildScheduler>,
    emitted: Arc<Mutex<Vec<Arc<SnapshotTree>>>>,
}

impl Rig {
    fn start() -> Self {
        let env = HostEnvironment::new(Document::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = Arc::new(HookAdapter::new(Arc::clone(&env), tx));
        adapter.install();

        let scheduler = RebuildScheduler::new(SnapshotBuilder::new(BuildOptions::default()), DEBOUNCE);
        spawn_commit_pump(Arc::clone(&scheduler), rx);

        let emitted: Arc<Mutex<Vec<Arc<SnapshotTree>>>> = Arc::default();
        let sink = Arc::clone(&emitted);
        scheduler.add_listener(Arc::new(move |tree: &Arc<SnapshotTree>| -> anyhow::Result<()> {
            sink.lock().unwrap().push(Arc::clone(tree));
            Ok(())
        }));

        Self {
            env,
            _adapter: adapter,
            scheduler,
            emitted,
        }
    }

    fn commit(&self, root: &Arc<MemoryNode>) {
        let hook = self.env.hook().unwrap();
        let renderer = hook.inject(RendererInfo {
            name: "memory".to_string(),
            version: "1".to_string(),
        });
        hook.on_commit_root(renderer, &root.handle()).unwrap();
    }

    async fn settle(&self) {
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(1)).await;
    }

    fn emissions(&self) -> usize {
        self.emitted.lock().unwrap().len()
    }

    fn last(&self) -> Arc<SnapshotTree> {
        Arc::clone(self.emitted.lock().unwrap().last().unwrap())
    }
}

fn find<'a>(nodes: &'a [SnapshotNode], name: &str) -> &'a SnapshotNode {
    nodes
        .iter()
        .find_map(|n| if n.name == name { Some(n) } else { n.children.iter().find(|c| c.name == name) })
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_commits_yields_one_rebuild_and_one_emission() {
    let rig = Rig::start();
    let root = MemoryNode::root();
    root.append_child(&MemoryNode::component("App"));

    for _ in 0..10 {
        rig.commit(&root);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(rig.emissions(), 0);

    rig.settle().await;
    assert_eq!(rig.emissions(), 1);
    assert_eq!(rig.scheduler.rebuild_count(), 1);
    assert_eq!(rig.scheduler.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_surviving_node_keeps_its_id_across_mutation() {
    let rig = Rig::start();
    let root = MemoryNode::root();
    let a = MemoryNode::component("A");
    let b = MemoryNode::component("B");
    let c = MemoryNode::component("C");
    b.append_child(&c);
    root.set_children(vec![Arc::clone(&a), Arc::clone(&b)]);

    rig.commit(&root);
    rig.settle().await;
    let before = rig.last();
    let c_id = find(&before.nodes, "C").id.clone();

    // [A, B[C]] -> [A, B'[C, D]]
    b.set_name("BPrime");
    let d = MemoryNode::component("D");
    b.set_children(vec![Arc::clone(&c), Arc::clone(&d)]);
    rig.commit(&root);
    rig.settle().await;

    let after = rig.last();
    let b_after = find(&after.nodes, "BPrime");
    let names: Vec<&str> = b_after.children.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["C", "D"]);
    assert_eq!(b_after.children[0].id, c_id);
    assert_ne!(b_after.children[1].id, c_id);
    assert_eq!(rig.emissions(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_runtime_rebuilds_to_an_equal_snapshot() {
    let rig = Rig::start();
    let root = MemoryNode::root();
    let app = MemoryNode::component("App");
    let div = MemoryNode::element("div");
    div.append_child(&MemoryNode::component("Leaf"));
    app.append_child(&div);
    root.append_child(&app);

    rig.commit(&root);
    rig.settle().await;
    rig.commit(&root);
    rig.settle().await;

    let trees = rig.emitted.lock().unwrap().clone();
    assert_eq!(trees.len(), 2);
    assert_eq!(*trees[0], *trees[1]);
    // The platform div is skipped and Leaf hoisted under App.
    assert_eq!(trees[1].nodes[0].children[0].name, "Leaf");
}

#[tokio::test(start_paused = true)]
async fn test_failing_listener_does_not_starve_others() {
    let rig = Rig::start();
    rig.scheduler
        .add_listener(Arc::new(|_: &Arc<SnapshotTree>| -> anyhow::Result<()> { anyhow::bail!("listener bug") }));
    let late = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&late);
    rig.scheduler.add_listener(Arc::new(move |_: &Arc<SnapshotTree>| -> anyhow::Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));

    let root = MemoryNode::root();
    root.append_child(&MemoryNode::component("App"));
    rig.commit(&root);
    rig.settle().await;

    assert_eq!(rig.emissions(), 1);
    assert_eq!(late.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_roots_are_debounced_independently() {
    let rig = Rig::start();
    let first = MemoryNode::root();
    first.append_child(&MemoryNode::component("First"));
    let second = MemoryNode::root();
    second.append_child(&MemoryNode::component("Second"));

    rig.commit(&first);
    tokio::time::sleep(Duration::from_millis(150)).await;
    rig.commit(&second);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(rig.emissions(), 1);

    rig.settle().await;
    assert_eq!(rig.emissions(), 2);
    let names: Vec<String> = rig.scheduler.forest().into_iter().map(|n| n.name).collect();
    assert_eq!(names, vec!["First", "Second"]);
}
