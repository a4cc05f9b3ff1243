//! Pipeline builder.

use super::{Pipeline, PipelineBody, PipelineConfig};
use crate::core::Step;

/// Builds a [`Pipeline`] from steps appended to its three blocks.
///
/// ```
/// use conveyor::prelude::*;
///
/// let pipeline = Pipeline::builder()
///     .step(steps::value(serde_json::json!("hello")))
///     .rescue(steps::effect(|_input| {}))
///     .finally(steps::effect(|_input| {}))
///     .build();
/// assert_eq!(pipeline.body().begin.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    body: PipelineBody,
    config: PipelineConfig,
}

impl PipelineBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step to the `begin` block.
    #[must_use]
    pub fn step(mut self, step: Step) -> Self {
        self.body.begin.push(step);
        self
    }

    /// Appends several steps to the `begin` block.
    #[must_use]
    pub fn steps(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.body.begin.extend(steps);
        self
    }

    /// Appends a step to the `rescue` block.
    #[must_use]
    pub fn rescue(mut self, step: Step) -> Self {
        self.body.rescue.push(step);
        self
    }

    /// Appends a step to the `finally` block.
    #[must_use]
    pub fn finally(mut self, step: Step) -> Self {
        self.body.finally.push(step);
        self
    }

    /// Overrides the whole config.
    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the pipeline, assigning a fresh id.
    #[must_use]
    pub fn build(self) -> Pipeline {
        Pipeline::from_parts(self.body, self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::steps;

    #[test]
    fn test_blocks_keep_order() {
        let p = PipelineBuilder::new()
            .step(steps::value(serde_json::json!(1)))
            .step(steps::value(serde_json::json!(2)))
            .rescue(steps::effect(|_input| {}))
            .build();

        assert_eq!(p.body().begin.len(), 2);
        assert_eq!(p.body().rescue.len(), 1);
        assert!(p.body().finally.is_empty());
    }

    #[test]
    fn test_fresh_ids() {
        let a = PipelineBuilder::new().build();
        let b = PipelineBuilder::new().build();
        assert_ne!(a.id(), b.id());
    }
}
