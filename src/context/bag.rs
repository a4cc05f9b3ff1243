//! The user context handed to the runtime at start.

use super::StateRef;
use crate::core::Value;
use crate::runtime::StateWatcher;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Opaque user context threaded through every step.
///
/// The runtime never interprets the contents: a data bag for plain values
/// plus named [`StateRef`]s for watched mutable state. Refs created after
/// the runtime installs its watcher inherit it.
#[derive(Default)]
pub struct RunContext {
    data: RwLock<HashMap<String, Value>>,
    refs: RwLock<HashMap<String, Arc<StateRef>>>,
    watcher: RwLock<Option<Arc<dyn StateWatcher>>>,
}

impl RunContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a plain value.
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.data.write().insert(key.into(), value);
    }

    /// Reads a plain value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    /// Returns the ref stored under `key`, creating it with a `Null`
    /// initial value when absent.
    #[must_use]
    pub fn state_ref(&self, key: &str) -> Arc<StateRef> {
        if let Some(existing) = self.refs.read().get(key) {
            return existing.clone();
        }

        let state = {
            let mut refs = self.refs.write();
            refs.entry(key.to_string())
                .or_insert_with(|| Arc::new(StateRef::new(key, Value::Null)))
                .clone()
        };
        if let Some(watcher) = self.watcher.read().clone() {
            state.set_watcher(watcher);
        }
        state
    }

    /// Registers a pre-built ref under its key, wiring the watcher.
    pub fn add_ref(&self, state: Arc<StateRef>) {
        if let Some(watcher) = self.watcher.read().clone() {
            state.set_watcher(watcher);
        }
        self.refs.write().insert(state.key().to_string(), state);
    }

    /// Installs a watcher on the context and every existing ref.
    pub fn install_watcher(&self, watcher: Arc<dyn StateWatcher>) {
        *self.watcher.write() = Some(watcher.clone());
        for state in self.refs.read().values() {
            state.set_watcher(watcher.clone());
        }
    }

    /// Removes the watcher from the context and every ref.
    pub fn remove_watcher(&self) {
        *self.watcher.write() = None;
        for state in self.refs.read().values() {
            state.clear_watcher();
        }
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("data_keys", &self.data.read().len())
            .field("refs", &self.refs.read().len())
            .finish()
    }
}
