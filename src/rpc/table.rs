//! Method table shared by every peer of a session.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;

use super::RpcError;
use crate::sync::{read, write};

/// An async method handler.
pub type RpcHandler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Wrap an async closure as an [`RpcHandler`].
pub fn handler<F, Fut>(f: F) -> RpcHandler
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |args: Vec<Value>| -> BoxFuture<'static, anyhow::Result<Value>> { Box::pin(f(args)) })
}

/// Registered methods by fully qualified name.
#[derive(Default)]
pub struct RpcTable {
    methods: RwLock<HashMap<String, RpcHandler>>,
}

impl fmt::Debug for RpcTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcTable")
            .field("methods", &self.names())
            .finish()
    }
}

impl RpcTable {
    /// Empty shared table.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `name`. Fails if it is taken.
    pub fn register(&self, name: &str, handler: RpcHandler) -> Result<(), RpcError> {
        let mut methods = write(&self.methods);
        if methods.contains_key(name) {
            return Err(RpcError::DuplicateMethod(name.to_string()));
        }
        methods.insert(name.to_string(), handler);
        log::debug!("Registered RPC method {}", name);
        Ok(())
    }

    /// Remove `name`. Returns whether it existed.
    pub fn unregister(&self, name: &str) -> bool {
        write(&self.methods).remove(name).is_some()
    }

    /// Handler for `name`.
    pub fn get(&self, name: &str) -> Option<RpcHandler> {
        read(&self.methods).get(name).cloned()
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        read(&self.methods).contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.methods).keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of methods.
    pub fn len(&self) -> usize {
        read(&self.methods).len()
    }

    /// True when no method is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every method.
    pub fn clear(&self) {
        write(&self.methods).clear();
    }

    /// Run `name` with `args`.
    ///
    /// The handler runs outside the table lock, so it may register or call
    /// other methods.
    pub async fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        let handler = self
            .get(name)
            .ok_or_else(|| RpcError::MethodNotFound(name.to_string()))?;
        // A panic anywhere in the handler, including before its first await,
        // is reported like any other handler failure.
        let outcome = AssertUnwindSafe(async move { handler(args).await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(result) => result.map_err(|e| RpcError::Handler(format!("{e:#}"))),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("RPC handler '{}' panicked: {}", name, message);
                Err(RpcError::Handler(format!("handler panicked: {message}")))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
