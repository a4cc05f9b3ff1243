//! Steps: the units of work inside a pipeline body.

use super::{StepOutcome, Value};
use crate::context::RunContext;
use crate::errors::PipelineError;
use crate::interpreter::{InterpreterStack, Resumable};
use crate::pipeline::Pipeline;
use crate::registry::InstanceId;
use crate::runtime::Runtime;
use std::sync::Arc;

/// What an ordinary step is called with.
#[derive(Clone)]
pub struct StepInput {
    /// The current pipeline value.
    pub value: Value,
    /// The previous pipeline value.
    pub prev: Value,
    /// The in-flight error, when executing inside `rescue` or `finally`.
    pub error: Option<PipelineError>,
    /// The user context threaded through every step.
    pub context: Arc<RunContext>,
}

/// What an interpreter-aware step is called with: everything a plain step
/// sees, plus the runtime, the instance identity, and a readable snapshot
/// of the live resumable stack.
pub struct StepScope {
    /// The runtime executing this instance.
    pub runtime: Runtime,
    /// The user context.
    pub context: Arc<RunContext>,
    /// The current pipeline value.
    pub value: Value,
    /// The in-flight error, if any.
    pub error: Option<PipelineError>,
    /// The executing instance's identity.
    pub ident: InstanceId,
    /// Resumable stack from innermost (this instance) to outermost.
    pub stack: InterpreterStack,
}

impl StepScope {
    /// Invokes a pipeline as a child of the executing instance.
    ///
    /// The child participates in the instance's cancellation subtree unless
    /// its config marks it detached.
    ///
    /// # Errors
    ///
    /// Propagates admission failures, e.g. a queue config mismatch.
    pub fn invoke(
        &self,
        pipeline: &Pipeline,
        args: Value,
    ) -> Result<crate::runtime::Invoked, crate::errors::RuntimeError> {
        self.runtime
            .invoke_resumable(Resumable::new(pipeline.clone(), args), Some(self.ident))
    }

    /// Replaces a live ancestor's stored interpreter state so it continues
    /// from `resumable` when it next resumes. Returns false when the
    /// ancestor is gone or holds no suspended snapshot.
    pub fn rewrite_ancestor(&self, ident: InstanceId, resumable: Resumable) -> bool {
        self.runtime.rewrite_snapshot(ident, resumable)
    }
}

type CallFn = dyn Fn(StepInput) -> StepOutcome + Send + Sync;
type ScopedFn = dyn Fn(StepScope) -> StepOutcome + Send + Sync;

/// One unit of work inside a pipeline body.
///
/// Dispatch happens on what a step *returns*, so a single `Call` covers
/// synchronous computations and future-returning calls alike.
#[derive(Clone)]
pub enum Step {
    /// A function over `(value, prev, error, context)`.
    Call(Arc<CallFn>),
    /// A nested pipeline run with the current value as input.
    Pipeline(Pipeline),
    /// An interpreter-aware function with access to the runtime and the
    /// live resumable stack.
    Scoped(Arc<ScopedFn>),
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Call(_) => f.write_str("Step::Call"),
            Step::Pipeline(p) => f.debug_tuple("Step::Pipeline").field(&p.id()).finish(),
            Step::Scoped(_) => f.write_str("Step::Scoped"),
        }
    }
}

/// Constructors for the common step shapes.
pub mod steps {
    use super::{CallFn, Step, StepInput, StepOutcome, StepScope, Value};
    use crate::errors::PipelineError;
    use crate::pipeline::Pipeline;
    use std::sync::Arc;

    /// A raw step; the closure decides the outcome.
    pub fn call<F>(f: F) -> Step
    where
        F: Fn(StepInput) -> StepOutcome + Send + Sync + 'static,
    {
        Step::Call(Arc::new(f) as Arc<CallFn>)
    }

    /// A step producing a constant value.
    #[must_use]
    pub fn value(v: Value) -> Step {
        call(move |_input| StepOutcome::Value(v.clone()))
    }

    /// A side-effect step; its return is always [`StepOutcome::Unchanged`],
    /// so the pipeline value is preserved.
    pub fn effect<F>(f: F) -> Step
    where
        F: Fn(StepInput) + Send + Sync + 'static,
    {
        call(move |input| {
            f(input);
            StepOutcome::Unchanged
        })
    }

    /// A value-producing computation. Producing `Null` leaves the pipeline
    /// value untouched.
    pub fn compute<F>(f: F) -> Step
    where
        F: Fn(StepInput) -> Value + Send + Sync + 'static,
    {
        call(move |input| StepOutcome::Value(f(input)))
    }

    /// A fallible computation; an `Err` is routed through `rescue`.
    pub fn try_compute<F>(f: F) -> Step
    where
        F: Fn(StepInput) -> Result<Value, PipelineError> + Send + Sync + 'static,
    {
        call(move |input| f(input).into())
    }

    /// An asynchronous step; the instance suspends on the returned future.
    pub fn future<F, Fut>(f: F) -> Step
    where
        F: Fn(StepInput) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = StepOutcome> + Send + 'static,
    {
        call(move |input| StepOutcome::future(f(input)))
    }

    /// A nested pipeline step.
    #[must_use]
    pub fn pipeline(p: Pipeline) -> Step {
        Step::Pipeline(p)
    }

    /// An interpreter-aware step with access to the runtime and the live
    /// resumable stack.
    pub fn with_scope<F>(f: F) -> Step
    where
        F: Fn(StepScope) -> StepOutcome + Send + Sync + 'static,
    {
        Step::Scoped(Arc::new(f))
    }
}
