//! Pipeline configuration: queue assignment and concurrency policy.

use crate::core::Value;
use serde::Serialize;
use std::sync::Arc;

/// How concurrent instances on one queue are arbitrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConcurrencyBehavior {
    /// No arbitration; only meaningful with an unbounded limit.
    Unrestricted,
    /// A new instance cancels the oldest live peers to make room.
    Restartable,
    /// A new instance waits its turn in FIFO order.
    Enqueued,
    /// A new instance is refused outright while the queue is full.
    Dropping,
    /// A new instance replaces the single pending slot; running peers
    /// finish undisturbed.
    KeepLatest,
}

/// Maximum simultaneously running (or child-awaiting) instances per queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    /// No cap.
    Unbounded,
    /// At most this many.
    Max(usize),
}

impl Limit {
    /// Whether another instance may run given the current running count.
    #[must_use]
    pub fn allows(&self, running: usize) -> bool {
        match self {
            Limit::Unbounded => true,
            Limit::Max(n) => running < *n,
        }
    }

    /// The numeric cap, when bounded.
    #[must_use]
    pub fn cap(&self) -> Option<usize> {
        match self {
            Limit::Unbounded => None,
            Limit::Max(n) => Some(*n),
        }
    }
}

impl Serialize for Limit {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Limit::Unbounded => serializer.serialize_none(),
            Limit::Max(n) => serializer.serialize_some(n),
        }
    }
}

/// A queue's concurrency policy. Frozen into the queue by the first
/// admitted instance; later instances must match exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConcurrencyConfig {
    /// The arbitration behavior.
    pub behavior: ConcurrencyBehavior,
    /// The running cap.
    pub max: Limit,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            behavior: ConcurrencyBehavior::Unrestricted,
            max: Limit::Unbounded,
        }
    }
}

impl ConcurrencyConfig {
    /// Creates a bounded config.
    #[must_use]
    pub fn bounded(behavior: ConcurrencyBehavior, max: usize) -> Self {
        Self {
            behavior,
            max: Limit::Max(max),
        }
    }
}

/// How an instance's queue name is determined.
#[derive(Clone)]
pub enum QueueName {
    /// Defaults to the registration key, or the pipeline id when the
    /// pipeline is invoked unregistered.
    Registered,
    /// A fixed name.
    Name(String),
    /// Computed from the invocation args.
    Computed(Arc<dyn Fn(&Value) -> String + Send + Sync>),
}

impl QueueName {
    /// Resolves the queue name for one invocation.
    #[must_use]
    pub fn resolve(&self, args: &Value, fallback: &str) -> String {
        match self {
            QueueName::Registered => fallback.to_string(),
            QueueName::Name(name) => name.clone(),
            QueueName::Computed(f) => f(args),
        }
    }
}

impl std::fmt::Debug for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueName::Registered => f.write_str("Registered"),
            QueueName::Name(name) => f.debug_tuple("Name").field(name).finish(),
            QueueName::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Per-pipeline configuration inherited by every instance.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Queue assignment.
    pub queue: QueueName,
    /// Concurrency policy.
    pub concurrency: ConcurrencyConfig,
    /// Reuse a live instance's result when `(id, args)` match on the queue.
    pub use_existing: bool,
    /// Run outside the caller's cancellation subtree, with no observable
    /// result handle.
    pub detached: bool,
    /// Whether `stop` cancels instances of this pipeline.
    pub cancel_on_shutdown: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue: QueueName::Registered,
            concurrency: ConcurrencyConfig::default(),
            use_existing: false,
            detached: false,
            cancel_on_shutdown: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_allows() {
        assert!(Limit::Unbounded.allows(usize::MAX - 1));
        assert!(Limit::Max(2).allows(1));
        assert!(!Limit::Max(2).allows(2));
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.concurrency.behavior, ConcurrencyBehavior::Unrestricted);
        assert_eq!(config.concurrency.max, Limit::Unbounded);
        assert!(config.cancel_on_shutdown);
        assert!(!config.detached);
    }

    #[test]
    fn test_queue_name_resolution() {
        let args = serde_json::json!({"user": "ada"});
        assert_eq!(QueueName::Registered.resolve(&args, "reg"), "reg");
        assert_eq!(QueueName::Name("fixed".into()).resolve(&args, "reg"), "fixed");

        let computed = QueueName::Computed(Arc::new(|args: &Value| {
            format!("user:{}", args["user"].as_str().unwrap_or("?"))
        }));
        assert_eq!(computed.resolve(&args, "reg"), "user:ada");
    }

    #[test]
    fn test_concurrency_config_equality() {
        let a = ConcurrencyConfig::bounded(ConcurrencyBehavior::Restartable, 1);
        let b = ConcurrencyConfig::bounded(ConcurrencyBehavior::Restartable, 1);
        let c = ConcurrencyConfig::bounded(ConcurrencyBehavior::Enqueued, 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
