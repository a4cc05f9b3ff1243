//! Combinators: configure a pipeline value, returning a new one.

use super::{ConcurrencyBehavior, ConcurrencyConfig, Pipeline, QueueName};
use crate::core::{steps, Outcome, StepOutcome, Value};
use crate::runtime::Invoked;
use std::sync::Arc;

impl Pipeline {
    /// Pins the queue name.
    #[must_use]
    pub fn with_queue(&self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.map_config(|c| c.queue = QueueName::Name(name))
    }

    /// Computes the queue name from the invocation args.
    #[must_use]
    pub fn with_queue_fn<F>(&self, f: F) -> Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        self.map_config(|c| c.queue = QueueName::Computed(Arc::new(f)))
    }

    /// A matching live invocation on the same queue shares its result.
    #[must_use]
    pub fn use_existing(&self) -> Self {
        self.map_config(|c| c.use_existing = true)
    }

    /// Restartable concurrency: new instances cancel the oldest live peers.
    #[must_use]
    pub fn restartable(&self, max: usize) -> Self {
        self.map_config(|c| {
            c.concurrency = ConcurrencyConfig::bounded(ConcurrencyBehavior::Restartable, max);
        })
    }

    /// Enqueued concurrency: new instances wait in FIFO order.
    #[must_use]
    pub fn enqueued(&self, max: usize) -> Self {
        self.map_config(|c| {
            c.concurrency = ConcurrencyConfig::bounded(ConcurrencyBehavior::Enqueued, max);
        })
    }

    /// Dropping concurrency: new instances are refused while full.
    #[must_use]
    pub fn dropping(&self, max: usize) -> Self {
        self.map_config(|c| {
            c.concurrency = ConcurrencyConfig::bounded(ConcurrencyBehavior::Dropping, max);
        })
    }

    /// Keep-latest concurrency: one pending slot, newest wins.
    #[must_use]
    pub fn keep_latest(&self, max: usize) -> Self {
        self.map_config(|c| {
            c.concurrency = ConcurrencyConfig::bounded(ConcurrencyBehavior::KeepLatest, max);
        })
    }

    /// Whether `stop` cancels live instances of this pipeline.
    #[must_use]
    pub fn cancel_on_shutdown(&self, flag: bool) -> Self {
        self.map_config(|c| c.cancel_on_shutdown = flag)
    }

    /// Detach instances from the caller's cancellation subtree; callers get
    /// no result handle.
    #[must_use]
    pub fn detached(&self, flag: bool) -> Self {
        self.map_config(|c| c.detached = flag)
    }

    /// Wraps this pipeline so its produced value is discarded and the outer
    /// value restored: the wrapper runs the target with the current value,
    /// waits for it, then resumes with the original value unchanged.
    #[must_use]
    pub fn muted(&self) -> Pipeline {
        let target = self.clone();
        Pipeline::builder()
            .step(steps::with_scope(move |scope| {
                let original = scope.value.clone();
                match scope.invoke(&target, scope.value.clone()) {
                    Err(e) => StepOutcome::Fail(e.into()),
                    Ok(Invoked::Completed(Outcome::Cancelled)) => StepOutcome::Cancelled,
                    Ok(Invoked::Completed(Outcome::Failed(e))) => StepOutcome::Fail(e),
                    Ok(Invoked::Completed(Outcome::Value(_)) | Invoked::Detached) => {
                        StepOutcome::Value(original)
                    }
                    Ok(Invoked::Pending(handle)) => StepOutcome::future(async move {
                        match handle.wait().await {
                            Outcome::Cancelled => StepOutcome::Cancelled,
                            Outcome::Failed(e) => StepOutcome::Fail(e),
                            Outcome::Value(_) => StepOutcome::Value(original),
                        }
                    }),
                }
            }))
            .build()
    }
}
