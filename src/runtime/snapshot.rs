//! Serializable views of live runtime state.

use crate::core::Value;
use crate::pipeline::{ConcurrencyBehavior, PipelineConfig, QueueName};
use crate::registry::{InstanceRecord, InstanceState};
use serde::Serialize;

/// A serializable summary of a pipeline config (queue functions are
/// reported as dynamic).
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSnapshot {
    /// The fixed queue name, or `None` when computed per invocation.
    pub queue: Option<String>,
    /// Concurrency behavior.
    pub behavior: ConcurrencyBehavior,
    /// The running cap; `None` is unbounded.
    pub max: Option<usize>,
    /// Whether matching live invocations share a result.
    pub use_existing: bool,
    /// Whether instances run detached.
    pub detached: bool,
    /// Whether `stop` cancels instances.
    pub cancel_on_shutdown: bool,
}

impl From<&PipelineConfig> for ConfigSnapshot {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            queue: match &config.queue {
                QueueName::Name(name) => Some(name.clone()),
                QueueName::Registered | QueueName::Computed(_) => None,
            },
            behavior: config.concurrency.behavior,
            max: config.concurrency.max.cap(),
            use_existing: config.use_existing,
            detached: config.detached,
            cancel_on_shutdown: config.cancel_on_shutdown,
        }
    }
}

/// One live instance as reported by `get_active`.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    /// The instance identity, rendered `<pipeline-uuid>#<token>`.
    pub ident: String,
    /// Lifecycle state.
    pub state: InstanceState,
    /// The invocation args.
    pub args: Value,
    /// Config summary.
    pub config: ConfigSnapshot,
    /// ISO-8601 spawn timestamp.
    pub spawned_at: String,
}

impl From<&InstanceRecord> for InstanceSnapshot {
    fn from(record: &InstanceRecord) -> Self {
        Self {
            ident: record.ident.to_string(),
            state: record.state,
            args: record.args.clone(),
            config: (&record.config).into(),
            spawned_at: record.spawned_at.to_rfc3339(),
        }
    }
}
