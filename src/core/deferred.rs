//! One-shot, multi-waiter result cell.

use super::Outcome;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

/// The caller-visible half of an instance's eventual result.
///
/// Resolves exactly once; the first resolution wins. Any number of waiters
/// may await it (several `use_existing` callers share one cell), before or
/// after resolution.
#[derive(Clone, Default)]
pub struct Deferred {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    slot: Mutex<Option<Outcome>>,
    notify: Notify,
}

impl Deferred {
    /// Creates an unresolved cell.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the cell. Later resolutions are ignored.
    pub fn resolve(&self, outcome: Outcome) {
        {
            let mut slot = self.inner.slot.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(outcome);
        }
        self.inner.notify.notify_waiters();
    }

    /// Returns the outcome if already resolved.
    #[must_use]
    pub fn try_get(&self) -> Option<Outcome> {
        self.inner.slot.lock().clone()
    }

    /// Returns true once resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.inner.slot.lock().is_some()
    }

    /// Whether two handles share one underlying cell.
    #[must_use]
    pub fn ptr_eq(a: &Deferred, b: &Deferred) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Waits for resolution.
    pub async fn wait(&self) -> Outcome {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking so a resolve between the check
            // and the await cannot be missed.
            notified.as_mut().enable();
            if let Some(outcome) = self.try_get() {
                return outcome;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Deferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    #[tokio::test]
    async fn test_resolve_before_wait() {
        let deferred = Deferred::new();
        deferred.resolve(Outcome::Value(serde_json::json!(1)));
        assert_eq!(deferred.wait().await, Outcome::Value(serde_json::json!(1)));
    }

    #[tokio::test]
    async fn test_first_resolution_wins() {
        let deferred = Deferred::new();
        deferred.resolve(Outcome::Cancelled);
        deferred.resolve(Outcome::Value(Value::Null));
        assert_eq!(deferred.wait().await, Outcome::Cancelled);
    }

    #[tokio::test]
    async fn test_multiple_waiters() {
        let deferred = Deferred::new();
        let a = deferred.clone();
        let b = deferred.clone();

        let wait_a = tokio::spawn(async move { a.wait().await });
        let wait_b = tokio::spawn(async move { b.wait().await });

        tokio::task::yield_now().await;
        deferred.resolve(Outcome::Value(serde_json::json!("done")));

        assert_eq!(wait_a.await.unwrap(), Outcome::Value(serde_json::json!("done")));
        assert_eq!(wait_b.await.unwrap(), Outcome::Value(serde_json::json!("done")));
    }

    #[tokio::test]
    async fn test_try_get_unresolved() {
        let deferred = Deferred::new();
        assert!(deferred.try_get().is_none());
        assert!(!deferred.is_resolved());
    }
}
