//! One-shot cancellation signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A close-able one-shot signal.
///
/// Each live instance owns one; while the instance is suspended on a step
/// future, the runtime races that future against `closed()` with the signal
/// given priority, so a cancellation that fires first wins.
///
/// Closing is idempotent.
#[derive(Clone, Default)]
pub struct CancelChannel {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    closed: AtomicBool,
    notify: Notify,
}

impl CancelChannel {
    /// Creates an open channel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Closes the channel, waking every waiter. Only the first close has
    /// an effect.
    pub fn close(&self) {
        if self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.inner.notify.notify_waiters();
        }
    }

    /// Returns true once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Waits until the channel is closed.
    pub async fn closed(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking so a close between the check and
            // the await cannot be missed.
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelChannel")
            .field("closed", &self.is_closed())
            .finish()
    }
}
