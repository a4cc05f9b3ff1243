//! Pipeline values: immutable templates describing a computation as three
//! ordered step lists plus a concurrency config.

mod builder;
mod combinators;
mod config;

pub use builder::PipelineBuilder;
pub use config::{ConcurrencyBehavior, ConcurrencyConfig, Limit, PipelineConfig, QueueName};

use crate::core::Step;
use std::sync::Arc;
use uuid::Uuid;

/// The three ordered step lists of a pipeline body.
#[derive(Debug, Default)]
pub struct PipelineBody {
    /// The main sequence.
    pub begin: Vec<Step>,
    /// Runs when a `begin` step errors; may itself error.
    pub rescue: Vec<Step>,
    /// Runs on every terminal outcome except cancellation.
    pub finally: Vec<Step>,
}

/// An immutable pipeline template. Cloning is cheap; the body is shared.
///
/// Combinators return a new pipeline with the same id and a modified
/// config, so `use_existing` matching still identifies the same logical
/// pipeline across configured variants.
#[derive(Clone)]
pub struct Pipeline {
    id: Uuid,
    body: Arc<PipelineBody>,
    config: PipelineConfig,
}

impl Pipeline {
    /// Starts building a pipeline.
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub(crate) fn from_parts(body: PipelineBody, config: PipelineConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            body: Arc::new(body),
            config,
        }
    }

    /// The unique id assigned at construction.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The pipeline body.
    #[must_use]
    pub fn body(&self) -> &PipelineBody {
        &self.body
    }

    /// The pipeline config.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub(crate) fn map_config(&self, f: impl FnOnce(&mut PipelineConfig)) -> Self {
        let mut next = self.clone();
        f(&mut next.config);
        next
    }

    /// Pins the queue name to the registration key when it was left at its
    /// default. Applied once per registered pipeline at startup.
    #[must_use]
    pub(crate) fn with_registered_queue(&self, key: &str) -> Self {
        match self.config.queue {
            QueueName::Registered => self.map_config(|c| c.queue = QueueName::Name(key.to_string())),
            _ => self.clone(),
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("begin", &self.body.begin.len())
            .field("rescue", &self.body.rescue.len())
            .field("finally", &self.body.finally.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::steps;

    #[test]
    fn test_clone_shares_body_keeps_id() {
        let p = Pipeline::builder()
            .step(steps::value(serde_json::json!(1)))
            .build();
        let q = p.clone();
        assert_eq!(p.id(), q.id());
        assert_eq!(Arc::strong_count(&p.body), 2);
    }

    #[test]
    fn test_registered_queue_defaulting() {
        let p = Pipeline::builder().build();
        let named = p.with_registered_queue("search");
        assert!(matches!(&named.config().queue, QueueName::Name(n) if n == "search"));

        let fixed = p
            .with_queue("other")
            .with_registered_queue("search");
        assert!(matches!(&fixed.config().queue, QueueName::Name(n) if n == "other"));
    }
}
