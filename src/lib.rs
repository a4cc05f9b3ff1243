//! # Conveyor
//!
//! A runtime for composable asynchronous pipelines.
//!
//! Application code declares pipelines — linear sequences of steps mixing
//! synchronous values, future-returning calls, and nested pipelines — and
//! hands them to a runtime that enforces per-queue concurrency policies
//! (restartable, enqueued, dropping, keep-latest, reuse-in-flight),
//! propagates structured cancellation across parent/child instances, and
//! routes errors through `rescue` / `finally` blocks.
//!
//! ## Quick start
//!
//! ```
//! use conveyor::prelude::*;
//! use std::sync::Arc;
//!
//! let context = Arc::new(RunContext::new());
//! let double = Pipeline::builder()
//!     .step(steps::compute(|input| {
//!         serde_json::json!(input.value.as_i64().unwrap_or(0) * 2)
//!     }))
//!     .build();
//!
//! let runtime = Runtime::start(context, [("double", double)], RuntimeOptions::default());
//!
//! // A pipeline with no suspension completes synchronously, unwrapped.
//! let invoked = runtime.invoke("double", serde_json::json!(21)).unwrap();
//! match invoked {
//!     Invoked::Completed(Outcome::Value(v)) => assert_eq!(v, serde_json::json!(42)),
//!     other => panic!("expected sync completion, got {other:?}"),
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, missing_docs, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod context;
pub mod core;
pub mod errors;
pub mod interpreter;
pub mod pipeline;
pub(crate) mod queue;
pub mod registry;
pub mod runtime;
pub mod testing;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cancellation::CancelChannel;
    pub use crate::context::{reset_ref, update_ref, RunContext, StateRef};
    pub use crate::core::{steps, Outcome, Step, StepInput, StepOutcome, StepScope, Value};
    pub use crate::errors::{PipelineError, RuntimeError};
    pub use crate::interpreter::{Block, InterpreterStack, Resumable, StackFrame};
    pub use crate::pipeline::{
        ConcurrencyBehavior, ConcurrencyConfig, Limit, Pipeline, PipelineBuilder, PipelineConfig,
        QueueName,
    };
    pub use crate::registry::{InstanceId, InstanceState};
    pub use crate::runtime::{
        in_pipeline, CancelObserver, DirectTransactor, ErrorReporter, Invoked,
        LoggingErrorReporter, OutcomeHandle, PipelineRef, Runtime, RuntimeOptions, StateWatcher,
        Transactor,
    };
}
