//! Fixtures for exercising pipelines in tests.

use crate::context::update_ref;
use crate::core::{steps, Step, StepOutcome, Value};
use crate::errors::PipelineError;
use crate::registry::InstanceId;
use crate::runtime::{CancelObserver, ErrorReporter};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// A step appending the current pipeline value to the list ref stored
/// under `key` in the context.
#[must_use]
pub fn append_step(key: &str) -> Step {
    let key = key.to_string();
    steps::call(move |input| {
        let state = input.context.state_ref(&key);
        let value = input.value.clone();
        update_ref(&state, move |list| {
            let mut list = list.as_array().cloned().unwrap_or_default();
            list.push(value.clone());
            Value::Array(list)
        })
    })
}

/// A step appending a fixed value to the list ref under `key`.
#[must_use]
pub fn append_value_step(key: &str, value: Value) -> Step {
    let key = key.to_string();
    steps::call(move |input| {
        let state = input.context.state_ref(&key);
        let value = value.clone();
        update_ref(&state, move |list| {
            let mut list = list.as_array().cloned().unwrap_or_default();
            list.push(value.clone());
            Value::Array(list)
        })
    })
}

/// An asynchronous step sleeping for `ms` milliseconds, resuming with the
/// previous value unchanged.
#[must_use]
pub fn delay_step(ms: u64) -> Step {
    steps::future(move |_input| async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        StepOutcome::Unchanged
    })
}

/// A step that always fails with `message`.
#[must_use]
pub fn failing_step(message: &str) -> Step {
    let message = message.to_string();
    steps::call(move |_input| StepOutcome::Fail(PipelineError::step(&message)))
}

/// Counts reported errors.
#[derive(Debug, Default)]
pub struct CountingReporter {
    count: AtomicUsize,
    last: Mutex<Option<PipelineError>>,
}

impl CountingReporter {
    /// Creates a zeroed reporter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of reports so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// The most recent reported error.
    #[must_use]
    pub fn last(&self) -> Option<PipelineError> {
        self.last.lock().clone()
    }
}

impl ErrorReporter for CountingReporter {
    fn report(&self, error: &PipelineError) {
        self.count.fetch_add(1, Ordering::SeqCst);
        *self.last.lock() = Some(error.clone());
    }
}

/// Records abandoned waits.
#[derive(Debug, Default)]
pub struct RecordingCancelObserver {
    abandoned: Mutex<Vec<InstanceId>>,
}

impl RecordingCancelObserver {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The abandoned instance idents, in notification order.
    #[must_use]
    pub fn abandoned(&self) -> Vec<InstanceId> {
        self.abandoned.lock().clone()
    }
}

impl CancelObserver for RecordingCancelObserver {
    fn on_abandoned(&self, ident: InstanceId) {
        self.abandoned.lock().push(ident);
    }
}
