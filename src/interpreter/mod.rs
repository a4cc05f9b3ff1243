//! The pipeline interpreter.
//!
//! Steps a resumable through synchronous work until it completes, errors,
//! suspends on a future, or is replaced by a rewritten stack. Dispatch
//! happens on what a step *returns*: value normalization first, then
//! return-shape dispatch, then block rules.

mod resumable;
mod stack;

pub use resumable::{Block, Resumable};
pub use stack::{InterpreterStack, StackFrame};

pub(crate) use resumable::Terminal;

use crate::cancellation::CancelChannel;
use crate::context::RunContext;
use crate::core::{Outcome, Step, StepFuture, StepInput, StepOutcome, StepScope, Value};
use crate::errors::{panic_message, PipelineError};
use crate::registry::InstanceId;
use crate::runtime::{Invoked, Runtime};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::trace;

/// What one synchronous interpreter chunk produced.
pub(crate) enum RunOutcome {
    /// Terminated with a plain value.
    Done(Value),
    /// Terminated with an error no block handled.
    Failed(PipelineError),
    /// Terminated by the cancellation sentinel or a closed canceller.
    Cancelled,
    /// Suspended on a future; `resumable` is the snapshot to continue from.
    Suspended {
        resumable: Resumable,
        future: StepFuture,
    },
}

enum Flow {
    Continue,
    Replace(Resumable),
    Terminal(RunOutcome),
}

enum Inline {
    Applied,
    Terminal(RunOutcome),
}

/// Runs one synchronous chunk of an instance, starting or resuming it.
///
/// `resumed` carries the settled outcome of the future the instance was
/// suspended on, dispatched by the same rules as a step return.
pub(crate) fn run(
    runtime: &Runtime,
    context: &Arc<RunContext>,
    ident: InstanceId,
    canceller: &CancelChannel,
    mut current: Resumable,
    mut resumed: Option<StepOutcome>,
) -> RunOutcome {
    'replaced: loop {
        // A tail runs first; its terminal value is the resumed value.
        if let Some(tail) = current.tail.take() {
            trace!(%ident, "running tail resumable");
            match invoke_inline(runtime, ident, &mut current, *tail) {
                Inline::Applied => {}
                Inline::Terminal(outcome) => return outcome,
            }
        }

        if let Some(outcome) = resumed.take() {
            match dispatch(runtime, context, ident, &mut current, outcome) {
                Flow::Continue => {}
                Flow::Replace(next) => {
                    current = next;
                    continue 'replaced;
                }
                Flow::Terminal(outcome) => return outcome,
            }
        }

        loop {
            // A cancelled instance never executes another step.
            if canceller.is_closed() {
                return RunOutcome::Cancelled;
            }

            let Some(step) = current.remaining.pop_front() else {
                match current.exhausted() {
                    None => continue,
                    Some(Terminal::Done(value)) => return RunOutcome::Done(value),
                    Some(Terminal::Failed(error)) => return RunOutcome::Failed(error),
                }
            };

            let outcome = execute_step(runtime, context, ident, &current, &step);
            match dispatch(runtime, context, ident, &mut current, outcome) {
                Flow::Continue => {}
                Flow::Replace(next) => {
                    current = next;
                    continue 'replaced;
                }
                Flow::Terminal(outcome) => return outcome,
            }
        }
    }
}

/// Calls a single step, normalizing panics to step errors.
fn execute_step(
    runtime: &Runtime,
    context: &Arc<RunContext>,
    ident: InstanceId,
    current: &Resumable,
    step: &Step,
) -> StepOutcome {
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| match step {
        Step::Call(f) => f(StepInput {
            value: current.value.clone(),
            prev: current.prev_value.clone(),
            error: current.error.clone(),
            context: context.clone(),
        }),
        Step::Pipeline(p) => StepOutcome::Pipeline(p.clone()),
        Step::Scoped(f) => f(StepScope {
            runtime: runtime.clone(),
            context: context.clone(),
            value: current.value.clone(),
            error: current.error.clone(),
            ident,
            stack: runtime.interpreter_stack(ident, current),
        }),
    }));

    result.unwrap_or_else(|payload| StepOutcome::Fail(PipelineError::panic(panic_message(&*payload))))
}

/// Dispatches a step return (or resumed future outcome) by its shape.
fn dispatch(
    runtime: &Runtime,
    _context: &Arc<RunContext>,
    ident: InstanceId,
    current: &mut Resumable,
    outcome: StepOutcome,
) -> Flow {
    match outcome {
        StepOutcome::Unchanged => Flow::Continue,
        StepOutcome::Value(value) => {
            current.apply_value(value);
            Flow::Continue
        }
        StepOutcome::Fail(error) => raise(current, error),
        StepOutcome::Cancelled => Flow::Terminal(RunOutcome::Cancelled),
        StepOutcome::Resumable(next) => Flow::Replace(*next),
        StepOutcome::Pipeline(pipeline) => {
            let child = Resumable::new(pipeline, current.value.clone());
            match invoke_inline(runtime, ident, current, child) {
                Inline::Applied => Flow::Continue,
                Inline::Terminal(outcome) => Flow::Terminal(outcome),
            }
        }
        StepOutcome::Future(future) => Flow::Terminal(RunOutcome::Suspended {
            resumable: current.clone(),
            future,
        }),
    }
}

/// Invokes a child resumable through the runtime, with the current snapshot
/// stashed so `rewrite_ancestor` takes effect across the child's execution.
fn invoke_inline(
    runtime: &Runtime,
    ident: InstanceId,
    current: &mut Resumable,
    child: Resumable,
) -> Inline {
    runtime.stash_snapshot(ident, current.clone());
    let invoked = runtime.invoke_resumable(child, Some(ident));
    if let Some(updated) = runtime.take_snapshot(ident) {
        *current = updated;
    }

    match invoked {
        Err(error) => match raise(current, error.into()) {
            Flow::Terminal(outcome) => Inline::Terminal(outcome),
            _ => Inline::Applied,
        },
        Ok(Invoked::Detached) => Inline::Applied,
        Ok(Invoked::Completed(Outcome::Value(value))) => {
            current.apply_value(value);
            Inline::Applied
        }
        Ok(Invoked::Completed(Outcome::Cancelled)) => Inline::Terminal(RunOutcome::Cancelled),
        Ok(Invoked::Completed(Outcome::Failed(error))) => match raise(current, error) {
            Flow::Terminal(outcome) => Inline::Terminal(outcome),
            _ => Inline::Applied,
        },
        Ok(Invoked::Pending(handle)) => Inline::Terminal(RunOutcome::Suspended {
            resumable: current.clone(),
            future: handle.into_step_future(),
        }),
    }
}

fn raise(current: &mut Resumable, error: PipelineError) -> Flow {
    match current.raise(error) {
        None => Flow::Continue,
        Some(escaped) => Flow::Terminal(RunOutcome::Failed(escaped)),
    }
}
