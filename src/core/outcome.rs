//! Terminal and per-step outcomes.

use super::Value;
use crate::errors::PipelineError;
use crate::interpreter::Resumable;
use crate::pipeline::Pipeline;
use futures::future::BoxFuture;

/// The terminal outcome of one pipeline instance.
///
/// Cancellation is a terminal state distinct from every user value and from
/// every error; callers pattern-match it directly.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Terminated with a plain value.
    Value(Value),
    /// Terminated with an error no `rescue` block caught.
    Failed(PipelineError),
    /// Terminated by cancellation.
    Cancelled,
}

impl Outcome {
    /// Returns true for the cancellation sentinel.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    /// Returns the terminal value, if the instance completed with one.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        match self {
            Outcome::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Converts into a `Result`, mapping cancellation to `Ok(Null)`.
    pub fn into_result(self) -> Result<Value, PipelineError> {
        match self {
            Outcome::Value(v) => Ok(v),
            Outcome::Cancelled => Ok(Value::Null),
            Outcome::Failed(e) => Err(e),
        }
    }
}

/// A boxed future produced by a step; the asynchronous half of a step's
/// return. It resolves to another [`StepOutcome`], so a future may resolve
/// to a value, an error, a pipeline to run, or even another future.
pub type StepFuture = BoxFuture<'static, StepOutcome>;

/// Everything a step may return. The interpreter dispatches on this, not on
/// the step's kind.
pub enum StepOutcome {
    /// No value produced; the pipeline value and previous value are kept.
    Unchanged,
    /// A produced value (`Null` is treated as [`StepOutcome::Unchanged`]).
    Value(Value),
    /// A raised error; routed through `rescue` / `finally`.
    Fail(PipelineError),
    /// Asynchronous work; the instance suspends until it resolves.
    Future(StepFuture),
    /// A nested pipeline to run with the current value as input.
    Pipeline(Pipeline),
    /// A rebuilt execution stack replacing the current one.
    Resumable(Box<Resumable>),
    /// The cancellation sentinel; terminates the instance immediately.
    Cancelled,
}

impl StepOutcome {
    /// Boxes a future resolving to a step outcome.
    pub fn future<F>(fut: F) -> Self
    where
        F: std::future::Future<Output = StepOutcome> + Send + 'static,
    {
        StepOutcome::Future(Box::pin(fut))
    }
}

impl std::fmt::Debug for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepOutcome::Unchanged => f.write_str("Unchanged"),
            StepOutcome::Value(v) => f.debug_tuple("Value").field(v).finish(),
            StepOutcome::Fail(e) => f.debug_tuple("Fail").field(e).finish(),
            StepOutcome::Future(_) => f.write_str("Future(..)"),
            StepOutcome::Pipeline(p) => f.debug_tuple("Pipeline").field(&p.id()).finish(),
            StepOutcome::Resumable(r) => f.debug_tuple("Resumable").field(&r.block).finish(),
            StepOutcome::Cancelled => f.write_str("Cancelled"),
        }
    }
}

impl From<Value> for StepOutcome {
    fn from(value: Value) -> Self {
        StepOutcome::Value(value)
    }
}

impl From<Result<Value, PipelineError>> for StepOutcome {
    fn from(result: Result<Value, PipelineError>) -> Self {
        match result {
            Ok(v) => StepOutcome::Value(v),
            Err(e) => StepOutcome::Fail(e),
        }
    }
}
