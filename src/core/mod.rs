//! Core vocabulary of the runtime: values, outcomes, steps.

mod deferred;
mod outcome;
mod step;

pub use deferred::Deferred;
pub use outcome::{Outcome, StepFuture, StepOutcome};
pub use step::{steps, Step, StepInput, StepScope};

/// The dynamic value type threaded through pipelines.
///
/// `Value::Null` plays the role of nil/undefined: a step producing it
/// leaves the pipeline value untouched.
pub type Value = serde_json::Value;
