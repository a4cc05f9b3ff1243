//! Watched state cells for pipeline side effects.

use crate::core::{StepOutcome, Value};
use crate::runtime::StateWatcher;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::warn;

/// A named, watched value cell.
///
/// Steps mutate refs through [`reset_ref`] / [`update_ref`]; every mutation
/// notifies the installed watcher with `(key, ref, old, new)`. Watcher
/// panics are logged and suppressed.
pub struct StateRef {
    key: String,
    value: RwLock<Value>,
    watcher: RwLock<Option<Arc<dyn StateWatcher>>>,
}

impl StateRef {
    /// Creates a ref with an initial value.
    #[must_use]
    pub fn new(key: impl Into<String>, initial: Value) -> Self {
        Self {
            key: key.into(),
            value: RwLock::new(initial),
            watcher: RwLock::new(None),
        }
    }

    /// Returns the ref's key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns a copy of the current value.
    #[must_use]
    pub fn get(&self) -> Value {
        self.value.read().clone()
    }

    /// Replaces the value, notifying the watcher.
    pub fn reset(&self, value: Value) {
        let old = {
            let mut slot = self.value.write();
            std::mem::replace(&mut *slot, value.clone())
        };
        self.notify(&old, &value);
    }

    /// Applies `f` to the current value, notifying the watcher.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&Value) -> Value,
    {
        let (old, new) = {
            let mut slot = self.value.write();
            let new = f(&slot);
            let old = std::mem::replace(&mut *slot, new.clone());
            (old, new)
        };
        self.notify(&old, &new);
    }

    /// Installs a watcher on this ref.
    pub fn set_watcher(&self, watcher: Arc<dyn StateWatcher>) {
        *self.watcher.write() = Some(watcher);
    }

    /// Removes the watcher.
    pub fn clear_watcher(&self) {
        *self.watcher.write() = None;
    }

    fn notify(&self, old: &Value, new: &Value) {
        let watcher = self.watcher.read().clone();
        if let Some(watcher) = watcher {
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                watcher.on_change(&self.key, self, old, new);
            })) {
                warn!(key = %self.key, "state watcher panicked: {:?}", e);
            }
        }
    }
}

impl std::fmt::Debug for StateRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateRef")
            .field("key", &self.key)
            .field("value", &*self.value.read())
            .finish()
    }
}

/// Resets a ref from inside a step. Always returns
/// [`StepOutcome::Unchanged`], so the pipeline value is preserved.
pub fn reset_ref(state: &StateRef, value: Value) -> StepOutcome {
    state.reset(value);
    StepOutcome::Unchanged
}

/// Updates a ref from inside a step. Always returns
/// [`StepOutcome::Unchanged`], so the pipeline value is preserved.
pub fn update_ref<F>(state: &StateRef, f: F) -> StepOutcome
where
    F: FnOnce(&Value) -> Value,
{
    state.update(f);
    StepOutcome::Unchanged
}
