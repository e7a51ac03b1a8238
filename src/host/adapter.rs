//! Attaches the inspector to a host runtime.
//!
//! Two entry points lead to roots: the hook's commit callback (runtimes that
//! start after us) and a retried document scan (runtimes that were already
//! rendering when we attached). Both feed the same commit notice channel.
//!
//! Nothing in here is allowed to fail into the host. Installation problems
//! leave the adapter idle and are logged.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use super::dom::DomElement;
use super::hook::{CommitCallback, CommitHandler, DevtoolsHook, HostEnvironment, RendererId};
use super::value::HostValue;
use super::{display_name, root_of, NodeHandle, NodeIdentity, RuntimeNode};
use crate::sync::lock;

/// Container ids a page commonly mounts its root into, probed first.
pub const WELL_KNOWN_CONTAINER_IDS: &[&str] = &["root", "app", "__next", "react-root", "main"];

/// Property-name prefixes under which a runtime stores its association from a
/// DOM element back to a node.
pub const ROOT_KEY_PREFIXES: &[&str] = &[
    "__reactContainer$",
    "_reactRootContainer",
    "__reactFiber$",
    "__reactInternalInstance$",
];

/// A root committed (or was discovered) and needs a snapshot.
#[derive(Clone)]
pub struct CommitNotice {
    /// Renderer that committed; `0` for discovered roots.
    pub renderer: RendererId,
    /// The committed root.
    pub root: NodeHandle,
}

impl std::fmt::Debug for CommitNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitNotice")
            .field("renderer", &self.renderer)
            .field("root", &self.root.identity())
            .finish()
    }
}

/// Retry schedule for root discovery.
#[derive(Clone, Debug)]
pub struct DiscoveryPolicy {
    /// Total scan attempts.
    pub max_attempts: u32,
    /// Spacing unit; attempt `n` waits `base_delay * n` before the next one.
    pub base_delay: Duration,
}

impl Default for DiscoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
        }
    }
}

/// Hooks into the host runtime and reports roots.
pub struct HookAdapter {
    env: Arc<HostEnvironment>,
    commit_tx: UnboundedSender<CommitNotice>,
    own_container: Option<Arc<DomElement>>,
    roots: Mutex<Vec<(NodeIdentity, Weak<dyn RuntimeNode>)>>,
    created_hook: Mutex<Option<Arc<DevtoolsHook>>>,
    patched_hook: Mutex<Option<Arc<DevtoolsHook>>>,
}

impl std::fmt::Debug for HookAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookAdapter")
            .field("roots", &lock(&self.roots).len())
            .field("installed", &lock(&self.patched_hook).is_some())
            .finish()
    }
}

impl HookAdapter {
    /// Create an adapter that reports commits on `commit_tx`.
    pub fn new(env: Arc<HostEnvironment>, commit_tx: UnboundedSender<CommitNotice>) -> Self {
        Self {
            env,
            commit_tx,
            own_container: None,
            roots: Mutex::new(Vec::new()),
            created_hook: Mutex::new(None),
            patched_hook: Mutex::new(None),
        }
    }

    /// Exclude roots mounted inside the inspector's own UI container.
    #[must_use]
    pub fn with_own_container(mut self, container: Arc<DomElement>) -> Self {
        self.own_container = Some(container);
        self
    }

    /// Attach to the environment's hook, creating one if the page has none.
    ///
    /// Calling this twice is harmless: an already decorated handler is left
    /// as is.
    pub fn install(self: &Arc<Self>) {
        let hook = match self.env.hook() {
            Some(existing) => existing,
            None => {
                let hook = DevtoolsHook::new();
                self.env.set_hook(Some(Arc::clone(&hook)));
                *lock(&self.created_hook) = Some(Arc::clone(&hook));
                log::info!("No devtools hook present, installed our own");
                hook
            }
        };

        let wrapper = self.commit_observer();
        if hook.update_handler(|handler| handler.decorate(wrapper)) {
            log::debug!("Commit handler decorated");
        } else {
            log::debug!("Commit handler already decorated, leaving it in place");
        }
        *lock(&self.patched_hook) = Some(hook);
    }

    /// Detach from the hook: remove the hook we created, or strip our
    /// decoration from someone else's.
    pub fn uninstall(&self) {
        let Some(hook) = lock(&self.patched_hook).take() else {
            return;
        };
        let created = lock(&self.created_hook).take();
        match created {
            Some(ours) if Arc::ptr_eq(&ours, &hook) => {
                let still_ours = self.env.hook().is_some_and(|h| Arc::ptr_eq(&h, &ours));
                if still_ours {
                    self.env.set_hook(None);
                }
                hook.set_handler(CommitHandler::empty());
            }
            _ => hook.update_handler(CommitHandler::restore),
        }
        log::info!("Hook adapter uninstalled");
    }

    fn commit_observer(self: &Arc<Self>) -> CommitCallback {
        let adapter: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |renderer, root| {
            if let Some(adapter) = adapter.upgrade() {
                adapter.record_commit(renderer, root);
            }
            Ok(HostValue::Undefined)
        })
    }

    fn record_commit(&self, renderer: RendererId, root: &NodeHandle) {
        self.remember_root(root);
        let notice = CommitNotice {
            renderer,
            root: Arc::clone(root),
        };
        if self.commit_tx.send(notice).is_err() {
            log::debug!("Commit for root {} dropped: scheduler gone", root.identity());
        }
    }

    fn remember_root(&self, root: &NodeHandle) -> bool {
        let identity = root.identity();
        let mut roots = lock(&self.roots);
        roots.retain(|(_, weak)| weak.strong_count() > 0);
        if roots.iter().any(|(id, _)| *id == identity) {
            return false;
        }
        log::debug!("Tracking root {} ({})", identity, display_name(root));
        roots.push((identity, Arc::downgrade(root)));
        true
    }

    /// Live roots seen so far, through commits or discovery.
    ///
    /// Roots are held weakly, so one the host has dropped disappears here.
    pub fn roots(&self) -> Vec<NodeHandle> {
        lock(&self.roots)
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    /// One pass over the document looking for mounted roots.
    ///
    /// Well-known containers are checked first; the full walk only runs when
    /// none of them leads to a root.
    pub fn scan_once(&self) -> Vec<NodeHandle> {
        let document = self.env.document();
        let preferred: Vec<Arc<DomElement>> = WELL_KNOWN_CONTAINER_IDS
            .iter()
            .filter_map(|id| document.get_element_by_id(id))
            .collect();

        let found = self.roots_in(&preferred);
        if !found.is_empty() {
            return found;
        }
        self.roots_in(&document.walk())
    }

    fn roots_in(&self, elements: &[Arc<DomElement>]) -> Vec<NodeHandle> {
        let mut found: Vec<NodeHandle> = Vec::new();
        for element in elements {
            if self.is_own_ui(element) {
                continue;
            }
            let Some(root) = root_from_element(element) else {
                continue;
            };
            if !found.iter().any(|r| r.identity() == root.identity()) {
                log::debug!("Found root {} on {}", root.identity(), element.describe());
                found.push(root);
            }
        }
        found
    }

    fn is_own_ui(&self, element: &Arc<DomElement>) -> bool {
        self.own_container
            .as_ref()
            .is_some_and(|container| container.contains(element))
    }

    /// Scan for roots with retries, spacing attempts linearly.
    ///
    /// Every root found is tracked and reported as a commit so it gets an
    /// initial snapshot. An exhausted search returns an empty list.
    pub async fn discover_roots(&self, policy: &DiscoveryPolicy) -> Vec<NodeHandle> {
        let attempts = policy.max_attempts.max(1);
        for attempt in 1..=attempts {
            let roots = self.scan_once();
            if !roots.is_empty() {
                log::info!("Discovered {} root(s) on attempt {}", roots.len(), attempt);
                for root in &roots {
                    self.record_commit(0, root);
                }
                return roots;
            }
            if attempt < attempts {
                log::debug!("No roots yet (attempt {}/{})", attempt, attempts);
                tokio::time::sleep(policy.base_delay * attempt).await;
            }
        }
        log::warn!("No roots found after {} attempts, staying idle", attempts);
        Vec::new()
    }
}

fn root_from_element(element: &DomElement) -> Option<NodeHandle> {
    element
        .own_property_names()
        .into_iter()
        .filter(|key| ROOT_KEY_PREFIXES.iter().any(|prefix| key.starts_with(prefix)))
        .find_map(|key| element.property(&key).and_then(|value| root_from_value(&value)))
}

fn root_from_value(value: &HostValue) -> Option<NodeHandle> {
    match value {
        HostValue::Node(node) => Some(root_of(node)),
        HostValue::Object(_) => {
            let container = value.get("_internalRoot").unwrap_or_else(|| value.clone());
            match container.get("current")? {
                HostValue::Node(node) => Some(root_of(&node)),
                _ => None,
            }
        }
        _ => None,
    }
}
