//! Host integration hooks with no-op / logging defaults.

use crate::context::StateRef;
use crate::core::Value;
use crate::errors::PipelineError;
use crate::registry::InstanceId;
use tracing::debug;

/// Wraps every synchronous interpreter chunk, so state observers see one
/// coalesced change per chunk.
///
/// Implementations must invoke the closure synchronously, exactly once, on
/// the calling thread, and must be re-entrant (a step may invoke a nested
/// pipeline, opening a nested scope).
pub trait Transactor: Send + Sync {
    /// Runs one chunk.
    fn transact(&self, f: &mut dyn FnMut());
}

/// The default transactor: invokes the closure directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectTransactor;

impl Transactor for DirectTransactor {
    fn transact(&self, f: &mut dyn FnMut()) {
        f();
    }
}

/// Observes every state-ref mutation as `(key, ref, old, new)`.
///
/// Must not panic; panics are logged and suppressed by the ref.
pub trait StateWatcher: Send + Sync {
    /// Called after a ref's value changed.
    fn on_change(&self, key: &str, state: &StateRef, old: &Value, new: &Value);
}

/// Receives errors that escaped all blocks of a root instance. Called at
/// most once per originating error, and never when a `rescue` caught it.
pub trait ErrorReporter: Send + Sync {
    /// Reports one escaped error.
    fn report(&self, error: &PipelineError);
}

/// The default reporter: logs at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingErrorReporter;

impl ErrorReporter for LoggingErrorReporter {
    fn report(&self, error: &PipelineError) {
        debug!(%error, "pipeline error escaped");
    }
}

/// A reporter that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpErrorReporter;

impl ErrorReporter for NoOpErrorReporter {
    fn report(&self, _error: &PipelineError) {}
}

/// Notified when a suspended instance abandons its in-flight future because
/// cancellation won the race. Integrations with cancellable clients key
/// their in-flight request tables on the instance ident.
pub trait CancelObserver: Send + Sync {
    /// Called once per abandoned wait.
    fn on_abandoned(&self, ident: InstanceId);
}

/// The default observer: does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpCancelObserver;

impl CancelObserver for NoOpCancelObserver {
    fn on_abandoned(&self, _ident: InstanceId) {}
}
