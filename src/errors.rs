//! Error types for the conveyor runtime.
//!
//! Two families: [`PipelineError`] values travel *through* a pipeline
//! (raised by steps, caught by `rescue`, re-raised by `finally`) and end up
//! in terminal outcomes, so they are cheap to clone. [`RuntimeError`] is
//! returned synchronously from runtime operations and never enters a
//! pipeline body on its own.

use crate::core::Value;
use thiserror::Error;

/// An error raised while executing a pipeline body.
///
/// Non-error failure payloads (the analogue of a promise rejecting with a
/// plain value) are wrapped as [`PipelineError::Unknown`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    /// A step failed with a message.
    #[error("step failed: {message}")]
    Step {
        /// The failure message.
        message: String,
    },

    /// A step (or an awaited step future) panicked.
    #[error("step panicked: {message}")]
    StepPanic {
        /// The extracted panic payload.
        message: String,
    },

    /// A failure carrying a non-error payload value.
    #[error("unknown error")]
    Unknown {
        /// The raw payload.
        value: Value,
    },

    /// A runtime-level failure surfaced into a pipeline, e.g. a nested
    /// invocation rejected at admission.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl PipelineError {
    /// Creates a step error from a message.
    #[must_use]
    pub fn step(message: impl Into<String>) -> Self {
        Self::Step {
            message: message.into(),
        }
    }

    /// Creates a panic error from an extracted payload message.
    #[must_use]
    pub fn panic(message: impl Into<String>) -> Self {
        Self::StepPanic {
            message: message.into(),
        }
    }

    /// Wraps a non-error failure payload.
    #[must_use]
    pub fn unknown(value: Value) -> Self {
        Self::Unknown { value }
    }
}

impl From<RuntimeError> for PipelineError {
    fn from(err: RuntimeError) -> Self {
        Self::Runtime(err.to_string())
    }
}

/// Errors returned synchronously from runtime operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// No pipeline is registered under the given name.
    #[error("unknown pipeline: {name}")]
    UnknownPipeline {
        /// The registration key that failed to resolve.
        name: String,
    },

    /// An invocation's concurrency config disagrees with the config the
    /// target queue was frozen with.
    #[error("concurrency config mismatch on queue '{queue}'")]
    QueueConfigMismatch {
        /// The queue whose frozen config was contradicted.
        queue: String,
    },

    /// The runtime has been stopped.
    #[error("runtime is stopped")]
    Stopped,
}

/// Extracts a readable message from a panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
