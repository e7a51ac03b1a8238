//! The global devtools hook and its commit-handler decorator.
//!
//! A host runtime looks for a hook object in its environment at startup,
//! injects each renderer into it, and calls `on_commit_root` after every
//! commit. Other tools may already own the hook, so the adapter never replaces
//! an existing commit handler: it wraps it in a [`CommitHandler`] whose inner
//! callback keeps running first and keeps its return value and errors.

use std::fmt;
use std::sync::{Arc, Mutex};

use super::dom::Document;
use super::value::HostValue;
use super::{HostError, NodeHandle};
use crate::sync::lock;

/// Renderer id handed out by [`DevtoolsHook::inject`].
pub type RendererId = u32;

/// Callback run on every commit of a root.
pub type CommitCallback =
    Arc<dyn Fn(RendererId, &NodeHandle) -> Result<HostValue, HostError> + Send + Sync>;

/// Metadata a renderer reports when it injects itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RendererInfo {
    /// Renderer package name.
    pub name: String,
    /// Renderer version string.
    pub version: String,
}

/// Commit handler installed on the hook, optionally decorated.
#[derive(Clone)]
pub struct CommitHandler {
    inner: Option<CommitCallback>,
    wrapper: Option<CommitCallback>,
    patched: bool,
}

impl fmt::Debug for CommitHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitHandler")
            .field("has_inner", &self.inner.is_some())
            .field("patched", &self.patched)
            .finish()
    }
}

impl CommitHandler {
    /// Undecorated handler around `inner`.
    pub fn new(inner: CommitCallback) -> Self {
        Self {
            inner: Some(inner),
            wrapper: None,
            patched: false,
        }
    }

    /// Handler that does nothing until decorated.
    pub fn empty() -> Self {
        Self {
            inner: None,
            wrapper: None,
            patched: false,
        }
    }

    /// Whether a wrapper is installed.
    pub fn is_patched(&self) -> bool {
        self.patched
    }

    /// Install `wrapper` after the inner callback. A second call is a no-op
    /// and returns `false`.
    pub fn decorate(&mut self, wrapper: CommitCallback) -> bool {
        if self.patched {
            return false;
        }
        self.wrapper = Some(wrapper);
        self.patched = true;
        true
    }

    /// Drop the wrapper, leaving only the inner callback.
    pub fn restore(&mut self) {
        self.wrapper = None;
        self.patched = false;
    }

    /// Run the inner callback, then the wrapper.
    ///
    /// The inner callback's error is returned before the wrapper runs, exactly
    /// as an undecorated call would fail. Wrapper failures are logged and never
    /// reach the host.
    pub fn invoke(&self, renderer: RendererId, root: &NodeHandle) -> Result<HostValue, HostError> {
        let result = match &self.inner {
            Some(inner) => inner(renderer, root)?,
            None => HostValue::Undefined,
        };
        if let Some(wrapper) = &self.wrapper {
            if let Err(e) = wrapper(renderer, root) {
                log::warn!("Commit observer failed for renderer {}: {}", renderer, e);
            }
        }
        Ok(result)
    }
}

#[derive(Debug)]
struct HookState {
    renderers: Vec<(RendererId, RendererInfo)>,
    next_renderer: RendererId,
    handler: CommitHandler,
}

/// The hook object a host runtime talks to.
#[derive(Debug)]
pub struct DevtoolsHook {
    state: Mutex<HookState>,
}

impl DevtoolsHook {
    /// Create a hook with no renderers and an empty commit handler.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HookState {
                renderers: Vec::new(),
                next_renderer: 1,
                handler: CommitHandler::empty(),
            }),
        })
    }

    /// Register a renderer and return its id.
    pub fn inject(&self, renderer: RendererInfo) -> RendererId {
        let mut state = lock(&self.state);
        let id = state.next_renderer;
        state.next_renderer += 1;
        log::info!("Renderer {} injected: {} {}", id, renderer.name, renderer.version);
        state.renderers.push((id, renderer));
        id
    }

    /// Renderers injected so far.
    pub fn renderers(&self) -> Vec<(RendererId, RendererInfo)> {
        lock(&self.state).renderers.clone()
    }

    /// Entry point the host calls after each commit.
    pub fn on_commit_root(
        &self,
        renderer: RendererId,
        root: &NodeHandle,
    ) -> Result<HostValue, HostError> {
        // Never run callbacks under the hook lock; they may re-enter.
        let handler = lock(&self.state).handler.clone();
        handler.invoke(renderer, root)
    }

    /// Replace the commit handler.
    pub fn set_handler(&self, handler: CommitHandler) {
        lock(&self.state).handler = handler;
    }

    /// Apply `f` to the commit handler in place.
    pub fn update_handler<R>(&self, f: impl FnOnce(&mut CommitHandler) -> R) -> R {
        f(&mut lock(&self.state).handler)
    }

    /// Whether the commit handler is currently decorated.
    pub fn is_patched(&self) -> bool {
        lock(&self.state).handler.is_patched()
    }
}

/// Page-level environment: the optional global hook and the document.
#[derive(Debug)]
pub struct HostEnvironment {
    hook: Mutex<Option<Arc<DevtoolsHook>>>,
    document: Document,
}

impl HostEnvironment {
    /// Environment without a hook.
    pub fn new(document: Document) -> Arc<Self> {
        Arc::new(Self {
            hook: Mutex::new(None),
            document,
        })
    }

    /// The installed hook, if any.
    pub fn hook(&self) -> Option<Arc<DevtoolsHook>> {
        lock(&self.hook).clone()
    }

    /// Install or remove the global hook.
    pub fn set_hook(&self, hook: Option<Arc<DevtoolsHook>>) {
        *lock(&self.hook) = hook;
    }

    /// The page document.
    pub fn document(&self) -> &Document {
        &self.document
    }
}
