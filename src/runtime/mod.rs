//! The runtime façade: registration, invocation, admission, structured
//! cancellation, shutdown, and host hooks.

mod hooks;
mod snapshot;

#[cfg(test)]
mod integration_tests;

pub use hooks::{
    CancelObserver, DirectTransactor, ErrorReporter, LoggingErrorReporter, NoOpCancelObserver,
    NoOpErrorReporter, StateWatcher, Transactor,
};
pub use snapshot::{ConfigSnapshot, InstanceSnapshot};

use crate::cancellation::CancelChannel;
use crate::context::RunContext;
use crate::core::{Deferred, Outcome, StepFuture, StepOutcome, Value};
use crate::errors::{panic_message, PipelineError, RuntimeError};
use crate::interpreter::{self, InterpreterStack, Resumable, RunOutcome, StackFrame};
use crate::pipeline::{ConcurrencyBehavior, Pipeline};
use crate::queue::{Admission, QueueState};
use crate::registry::{InstanceId, InstanceRecord, InstanceState, Registry};
use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

thread_local! {
    static PIPELINE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// True while the calling thread is inside an interpreter chunk (a
/// `transact` scope), including nested pipelines.
#[must_use]
pub fn in_pipeline() -> bool {
    PIPELINE_DEPTH.with(|depth| depth.get() > 0)
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Self {
        PIPELINE_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        PIPELINE_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// A pipeline reference accepted by [`Runtime::invoke`]: a registration key
/// or a pipeline value (which bypasses registration).
#[derive(Debug, Clone, Copy)]
pub enum PipelineRef<'a> {
    /// A registered pipeline's key.
    Name(&'a str),
    /// A pipeline value.
    Value(&'a Pipeline),
}

impl<'a> From<&'a str> for PipelineRef<'a> {
    fn from(name: &'a str) -> Self {
        PipelineRef::Name(name)
    }
}

impl<'a> From<&'a String> for PipelineRef<'a> {
    fn from(name: &'a String) -> Self {
        PipelineRef::Name(name)
    }
}

impl<'a> From<&'a Pipeline> for PipelineRef<'a> {
    fn from(pipeline: &'a Pipeline) -> Self {
        PipelineRef::Value(pipeline)
    }
}

/// A shareable handle on an instance's eventual outcome.
#[derive(Debug, Clone)]
pub struct OutcomeHandle {
    deferred: Deferred,
}

impl OutcomeHandle {
    /// Waits for the terminal outcome. `use_existing` callers share the
    /// underlying cell, so every waiter sees the same outcome.
    pub async fn wait(&self) -> Outcome {
        self.deferred.wait().await
    }

    /// Returns the outcome if already settled.
    #[must_use]
    pub fn try_get(&self) -> Option<Outcome> {
        self.deferred.try_get()
    }

    /// Whether two handles observe the same underlying result cell.
    #[must_use]
    pub fn same_cell(&self, other: &OutcomeHandle) -> bool {
        Deferred::ptr_eq(&self.deferred, &other.deferred)
    }

    pub(crate) fn into_step_future(self) -> StepFuture {
        Box::pin(async move {
            match self.deferred.wait().await {
                Outcome::Value(value) => StepOutcome::Value(value),
                Outcome::Failed(error) => StepOutcome::Fail(error),
                Outcome::Cancelled => StepOutcome::Cancelled,
            }
        })
    }
}

/// What [`Runtime::invoke`] hands back.
#[derive(Debug)]
pub enum Invoked {
    /// The whole body completed synchronously (or was dropped / cancelled
    /// at admission); the terminal outcome, unwrapped.
    Completed(Outcome),
    /// The instance suspended at least once; await the handle.
    Pending(OutcomeHandle),
    /// A detached instance: fire-and-forget, no observable handle.
    Detached,
}

impl Invoked {
    /// Waits out the invocation to its terminal outcome. Detached
    /// invocations settle immediately to `Value(Null)`.
    pub async fn settled(self) -> Outcome {
        match self {
            Invoked::Completed(outcome) => outcome,
            Invoked::Pending(handle) => handle.wait().await,
            Invoked::Detached => Outcome::Value(Value::Null),
        }
    }

    /// The synchronous outcome, when there is one.
    #[must_use]
    pub fn completed(self) -> Option<Outcome> {
        match self {
            Invoked::Completed(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// The pending handle, when the instance suspended.
    #[must_use]
    pub fn pending(self) -> Option<OutcomeHandle> {
        match self {
            Invoked::Pending(handle) => Some(handle),
            _ => None,
        }
    }
}

/// Host-supplied hooks and defaults.
pub struct RuntimeOptions {
    transactor: Arc<dyn Transactor>,
    watcher: Option<Arc<dyn StateWatcher>>,
    error_reporter: Arc<dyn ErrorReporter>,
    cancel_observer: Arc<dyn CancelObserver>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            transactor: Arc::new(DirectTransactor),
            watcher: None,
            error_reporter: Arc::new(LoggingErrorReporter),
            cancel_observer: Arc::new(NoOpCancelObserver),
        }
    }
}

impl RuntimeOptions {
    /// Creates the default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the transactor wrapping every interpreter chunk.
    #[must_use]
    pub fn with_transactor(mut self, transactor: Arc<dyn Transactor>) -> Self {
        self.transactor = transactor;
        self
    }

    /// Sets the state watcher installed on the context at start.
    #[must_use]
    pub fn with_watcher(mut self, watcher: Arc<dyn StateWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// Sets the error reporter.
    #[must_use]
    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.error_reporter = reporter;
        self
    }

    /// Sets the abandoned-wait observer.
    #[must_use]
    pub fn with_cancel_observer(mut self, observer: Arc<dyn CancelObserver>) -> Self {
        self.cancel_observer = observer;
        self
    }
}

impl std::fmt::Debug for RuntimeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeOptions")
            .field("watcher", &self.watcher.is_some())
            .finish()
    }
}

#[derive(Default)]
struct CoreState {
    registry: Registry,
    queues: HashMap<String, QueueState>,
    stopped: bool,
}

impl CoreState {
    fn running_count(&self, queue: &str) -> usize {
        self.queues.get(queue).map_or(0, |q| {
            q.fifo
                .iter()
                .filter(|id| {
                    self.registry.get(**id).is_some_and(|r| {
                        matches!(
                            r.state,
                            InstanceState::Running | InstanceState::WaitingChildren
                        )
                    })
                })
                .count()
        })
    }

    fn find_existing(&self, queue: &str, pipeline: Uuid, args: &Value) -> Option<Deferred> {
        let q = self.queues.get(queue)?;
        q.fifo.iter().find_map(|id| {
            let record = self.registry.get(*id)?;
            (record.ident.pipeline == pipeline && record.args == *args)
                .then(|| record.deferred.clone())
        })
    }

    /// Removes an instance, unlinks it from its parent, and releases
    /// child-awaiting ancestors whose last child just drained. Returns the
    /// queues that lost a member.
    fn remove_cascade(&mut self, ident: InstanceId) -> Vec<String> {
        let mut affected = Vec::new();
        let mut current = Some(ident);
        while let Some(id) = current {
            let Some(record) = self.registry.remove(id) else {
                break;
            };
            if let Some(q) = self.queues.get_mut(&record.queue) {
                q.remove(id);
            }
            affected.push(record.queue.clone());
            current = None;
            if let Some(parent) = record.parent {
                if let Some(parent_record) = self.registry.get_mut(parent) {
                    parent_record.children.remove(&id);
                    if parent_record.state == InstanceState::WaitingChildren
                        && parent_record.children.is_empty()
                    {
                        current = Some(parent);
                    }
                }
            }
        }
        affected
    }
}

struct RuntimeInner {
    context: Arc<RunContext>,
    pipelines: HashMap<String, Pipeline>,
    transactor: Arc<dyn Transactor>,
    error_reporter: Arc<dyn ErrorReporter>,
    cancel_observer: Arc<dyn CancelObserver>,
    state: Mutex<CoreState>,
    tokens: AtomicU64,
}

/// The pipeline runtime. Cheap to clone; all clones share state.
///
/// Invocation of fully synchronous pipelines works anywhere; suspension
/// spawns a waiter task and therefore requires a tokio runtime context.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Registers pipelines and starts a runtime.
    ///
    /// A registered pipeline whose queue name was left at its default is
    /// pinned to its registration key. The watcher, if any, is installed on
    /// the context.
    pub fn start<K: Into<String>>(
        context: Arc<RunContext>,
        pipelines: impl IntoIterator<Item = (K, Pipeline)>,
        options: RuntimeOptions,
    ) -> Runtime {
        let mut registered = HashMap::new();
        for (key, pipeline) in pipelines {
            let key = key.into();
            let pipeline = pipeline.with_registered_queue(&key);
            registered.insert(key, pipeline);
        }
        if let Some(watcher) = options.watcher.clone() {
            context.install_watcher(watcher);
        }
        debug!(pipelines = registered.len(), "runtime started");
        Runtime {
            inner: Arc::new(RuntimeInner {
                context,
                pipelines: registered,
                transactor: options.transactor,
                error_reporter: options.error_reporter,
                cancel_observer: options.cancel_observer,
                state: Mutex::new(CoreState::default()),
                tokens: AtomicU64::new(1),
            }),
        }
    }

    /// The context threaded through every step.
    #[must_use]
    pub fn context(&self) -> &Arc<RunContext> {
        &self.inner.context
    }

    /// Whether a pipeline is registered under `name`.
    #[must_use]
    pub fn has_pipeline(&self, name: &str) -> bool {
        self.inner.pipelines.contains_key(name)
    }

    /// Invokes a pipeline by registration key or by value.
    ///
    /// Returns [`Invoked::Completed`] when the whole body ran without
    /// suspending (the terminal value is not wrapped), [`Invoked::Pending`]
    /// otherwise, and [`Invoked::Detached`] for detached pipelines.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::UnknownPipeline`] for an unregistered key,
    /// [`RuntimeError::QueueConfigMismatch`] when the target queue was
    /// frozen with a different concurrency config, and
    /// [`RuntimeError::Stopped`] after shutdown.
    pub fn invoke<'a>(
        &self,
        pipeline: impl Into<PipelineRef<'a>>,
        args: Value,
    ) -> Result<Invoked, RuntimeError> {
        let pipeline = match pipeline.into() {
            PipelineRef::Name(name) => self
                .inner
                .pipelines
                .get(name)
                .cloned()
                .ok_or_else(|| RuntimeError::UnknownPipeline {
                    name: name.to_string(),
                })?,
            PipelineRef::Value(pipeline) => pipeline.clone(),
        };
        self.invoke_resumable(Resumable::new(pipeline, args), None)
    }

    /// Runs queue admission for a resumable and starts it when capacity
    /// allows.
    pub(crate) fn invoke_resumable(
        &self,
        resumable: Resumable,
        parent: Option<InstanceId>,
    ) -> Result<Invoked, RuntimeError> {
        let config = resumable.pipeline.config().clone();
        let pipeline_id = resumable.pipeline.id();
        let fallback = pipeline_id.to_string();
        let queue_name = config.queue.resolve(&resumable.args, &fallback);

        let (ident, deferred, to_cancel, start_now) = {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            if st.stopped {
                return Err(RuntimeError::Stopped);
            }

            if config.use_existing {
                if let Some(existing) = st.find_existing(&queue_name, pipeline_id, &resumable.args)
                {
                    trace!(queue = %queue_name, "reusing live instance");
                    return Ok(Invoked::Pending(OutcomeHandle { deferred: existing }));
                }
            }

            // A queue freezes its concurrency config on creation.
            let frozen = st
                .queues
                .entry(queue_name.clone())
                .or_insert_with(|| QueueState::new(config.concurrency))
                .config;
            if frozen != config.concurrency {
                return Err(RuntimeError::QueueConfigMismatch { queue: queue_name });
            }

            let running = st.running_count(&queue_name);
            let admission = if frozen.max.allows(running) {
                Admission::Start
            } else {
                match frozen.behavior {
                    ConcurrencyBehavior::Dropping => Admission::Drop,
                    ConcurrencyBehavior::Restartable => {
                        let live: Vec<InstanceId> = st.queues[&queue_name]
                            .fifo
                            .iter()
                            .copied()
                            .filter(|id| st.registry.contains(*id))
                            .collect();
                        let keep = frozen.max.cap().unwrap_or(0).saturating_sub(1);
                        let cancel = live[..live.len().saturating_sub(keep)].to_vec();
                        Admission::Park { cancel }
                    }
                    ConcurrencyBehavior::KeepLatest => {
                        let cancel: Vec<InstanceId> = st.queues[&queue_name]
                            .fifo
                            .iter()
                            .copied()
                            .filter(|id| {
                                st.registry
                                    .get(*id)
                                    .is_some_and(|r| r.state == InstanceState::Pending)
                            })
                            .collect();
                        Admission::Park { cancel }
                    }
                    ConcurrencyBehavior::Enqueued | ConcurrencyBehavior::Unrestricted => {
                        Admission::Park { cancel: Vec::new() }
                    }
                }
            };

            if matches!(admission, Admission::Drop) {
                debug!(queue = %queue_name, "invocation dropped at admission");
                return Ok(if config.detached {
                    Invoked::Detached
                } else {
                    Invoked::Completed(Outcome::Cancelled)
                });
            }

            let start_now = matches!(admission, Admission::Start);
            let to_cancel = match admission {
                Admission::Park { cancel } => cancel,
                _ => Vec::new(),
            };

            let ident = InstanceId {
                pipeline: pipeline_id,
                token: self.inner.tokens.fetch_add(1, Ordering::Relaxed),
            };
            let linked_parent = if config.detached {
                None
            } else {
                parent.filter(|p| st.registry.contains(*p))
            };
            if let Some(parent_id) = linked_parent {
                if let Some(parent_record) = st.registry.get_mut(parent_id) {
                    parent_record.children.insert(ident);
                }
            }

            let record = InstanceRecord {
                ident,
                queue: queue_name.clone(),
                args: resumable.args.clone(),
                config: config.clone(),
                state: if start_now {
                    InstanceState::Running
                } else {
                    InstanceState::Pending
                },
                parent: linked_parent,
                children: HashSet::new(),
                canceller: CancelChannel::new(),
                deferred: Deferred::new(),
                resumable: Some(resumable),
                spawned_at: Utc::now(),
            };
            let deferred = record.deferred.clone();
            st.registry.insert(record);
            if let Some(q) = st.queues.get_mut(&queue_name) {
                q.push(ident);
            }
            debug!(%ident, queue = %queue_name, start_now, "instance admitted");

            (ident, deferred, to_cancel, start_now)
        };

        // Peer cancellation runs before the new instance's interpreter; the
        // triggered start_next promotes it.
        for peer in to_cancel {
            self.cancel_subtree(peer);
        }
        if start_now {
            self.drive(ident);
        }

        if config.detached {
            return Ok(Invoked::Detached);
        }
        match deferred.try_get() {
            Some(outcome) => Ok(Invoked::Completed(outcome)),
            None => Ok(Invoked::Pending(OutcomeHandle { deferred })),
        }
    }

    /// Cancels an instance: walks up to the cancel root (first detached or
    /// parentless ancestor) and cancels its whole subtree, leaves first.
    pub fn cancel(&self, ident: InstanceId) {
        let root = {
            let st = self.inner.state.lock();
            if !st.registry.contains(ident) {
                return;
            }
            st.registry.cancel_root(ident)
        };
        self.cancel_subtree(root);
    }

    /// Cancels several instances.
    pub fn cancel_all(&self, idents: impl IntoIterator<Item = InstanceId>) {
        for ident in idents {
            self.cancel(ident);
        }
    }

    /// Cancels `root` and its non-detached descendants without the upward
    /// root walk. `start_next` runs once per affected queue afterwards.
    fn cancel_subtree(&self, root: InstanceId) {
        let mut affected = Vec::new();
        {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            let victims = st.registry.collect_subtree(root);
            for victim in victims {
                let Some(mut record) = st.registry.remove(victim) else {
                    continue;
                };
                record.state = InstanceState::Cancelled;
                record.canceller.close();
                record.deferred.resolve(Outcome::Cancelled);
                if let Some(q) = st.queues.get_mut(&record.queue) {
                    q.remove(victim);
                }
                affected.push(record.queue.clone());
                debug!(ident = %victim, queue = %record.queue, "instance cancelled");

                let mut release = None;
                if let Some(parent) = record.parent {
                    if let Some(parent_record) = st.registry.get_mut(parent) {
                        parent_record.children.remove(&victim);
                        if parent_record.state == InstanceState::WaitingChildren
                            && parent_record.children.is_empty()
                        {
                            release = Some(parent);
                        }
                    }
                }
                if let Some(parent) = release {
                    affected.extend(st.remove_cascade(parent));
                }
            }
        }
        affected.sort();
        affected.dedup();
        for queue in affected {
            self.start_next(&queue);
        }
    }

    /// Cancels every live `cancel_on_shutdown` instance, removes the state
    /// watcher, and marks the runtime stopped. Idempotent.
    pub fn stop(&self) {
        let victims: Vec<InstanceId> = {
            let mut st = self.inner.state.lock();
            if st.stopped {
                return;
            }
            st.stopped = true;
            st.registry
                .iter()
                .filter(|r| r.config.cancel_on_shutdown)
                .map(|r| r.ident)
                .collect()
        };
        debug!(instances = victims.len(), "runtime stopping");
        for ident in victims {
            self.cancel_subtree(ident);
        }
        self.inner.context.remove_watcher();
    }

    /// Snapshot of live queue membership: `queue -> ident -> instance`.
    /// Queues without members are omitted.
    #[must_use]
    pub fn get_active(&self) -> HashMap<String, HashMap<String, InstanceSnapshot>> {
        let st = self.inner.state.lock();
        let mut out = HashMap::new();
        for (name, q) in &st.queues {
            if q.fifo.is_empty() {
                continue;
            }
            let members: HashMap<String, InstanceSnapshot> = q
                .fifo
                .iter()
                .filter_map(|id| {
                    st.registry
                        .get(*id)
                        .map(|record| (id.to_string(), InstanceSnapshot::from(record)))
                })
                .collect();
            if !members.is_empty() {
                out.insert(name.clone(), members);
            }
        }
        out
    }

    /// The queue's most recent non-cancelled terminal value.
    #[must_use]
    pub fn last_result(&self, queue: &str) -> Option<Value> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .and_then(|q| q.last_result.clone())
    }

    /// The queue's most recent escaped error.
    #[must_use]
    pub fn last_error(&self, queue: &str) -> Option<PipelineError> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .and_then(|q| q.last_error.clone())
    }

    /// Runs `f` inside a transactor scope, tracking pipeline depth for
    /// [`in_pipeline`].
    pub fn transact<R>(&self, f: impl FnOnce() -> R) -> R {
        let _depth = DepthGuard::enter();
        let mut result = None;
        let mut f = Some(f);
        self.inner.transactor.transact(&mut || {
            if let Some(f) = f.take() {
                result = Some(f());
            }
        });
        result.expect("transactor must invoke its closure synchronously")
    }

    // ---- interpreter support -------------------------------------------

    /// The live resumable stack for an executing instance, innermost first.
    pub(crate) fn interpreter_stack(
        &self,
        ident: InstanceId,
        current: &Resumable,
    ) -> InterpreterStack {
        let mut frames = vec![StackFrame {
            ident,
            resumable: current.clone(),
        }];
        let st = self.inner.state.lock();
        let mut cursor = st.registry.get(ident).and_then(|r| r.parent);
        while let Some(parent) = cursor {
            let Some(record) = st.registry.get(parent) else {
                break;
            };
            if let Some(resumable) = &record.resumable {
                frames.push(StackFrame {
                    ident: parent,
                    resumable: resumable.clone(),
                });
            }
            cursor = record.parent;
        }
        InterpreterStack { frames }
    }

    /// Stores the in-progress snapshot of an instance around an inline
    /// child invocation.
    pub(crate) fn stash_snapshot(&self, ident: InstanceId, resumable: Resumable) {
        let mut st = self.inner.state.lock();
        if let Some(record) = st.registry.get_mut(ident) {
            record.resumable = Some(resumable);
        }
    }

    /// Takes the stored snapshot back, picking up any rewrite that happened
    /// while the instance was parked there.
    pub(crate) fn take_snapshot(&self, ident: InstanceId) -> Option<Resumable> {
        let mut st = self.inner.state.lock();
        st.registry.get_mut(ident).and_then(|r| r.resumable.take())
    }

    /// Replaces a live instance's stored snapshot. Returns false when the
    /// instance is gone or currently holds no snapshot.
    pub(crate) fn rewrite_snapshot(&self, ident: InstanceId, resumable: Resumable) -> bool {
        let mut st = self.inner.state.lock();
        match st.registry.get_mut(ident) {
            Some(record) if record.resumable.is_some() => {
                record.resumable = Some(resumable);
                true
            }
            _ => false,
        }
    }

    // ---- drive loop ----------------------------------------------------

    /// Runs one instance's next synchronous chunk from its stored snapshot.
    fn drive(&self, ident: InstanceId) {
        let (resumable, canceller) = {
            let mut st = self.inner.state.lock();
            let Some(record) = st.registry.get_mut(ident) else {
                return;
            };
            let Some(resumable) = record.resumable.take() else {
                return;
            };
            (resumable, record.canceller.clone())
        };
        let outcome = self.run_chunk(ident, resumable, &canceller, None);
        self.apply(ident, outcome);
    }

    /// A settled future's outcome re-enters the interpreter.
    fn resumed_with(&self, ident: InstanceId, outcome: StepOutcome) {
        let (resumable, canceller) = {
            let mut st = self.inner.state.lock();
            let Some(record) = st.registry.get_mut(ident) else {
                return;
            };
            let Some(resumable) = record.resumable.take() else {
                return;
            };
            (resumable, record.canceller.clone())
        };
        if canceller.is_closed() {
            return;
        }
        let outcome = self.run_chunk(ident, resumable, &canceller, Some(outcome));
        self.apply(ident, outcome);
    }

    fn run_chunk(
        &self,
        ident: InstanceId,
        resumable: Resumable,
        canceller: &CancelChannel,
        resumed: Option<StepOutcome>,
    ) -> RunOutcome {
        let context = self.inner.context.clone();
        self.transact(|| interpreter::run(self, &context, ident, canceller, resumable, resumed))
    }

    fn apply(&self, ident: InstanceId, outcome: RunOutcome) {
        match outcome {
            RunOutcome::Done(value) => self.finish(ident, Outcome::Value(value)),
            RunOutcome::Failed(error) => self.finish(ident, Outcome::Failed(error)),
            RunOutcome::Cancelled => self.finish(ident, Outcome::Cancelled),
            RunOutcome::Suspended { resumable, future } => {
                let canceller = {
                    let mut st = self.inner.state.lock();
                    match st.registry.get_mut(ident) {
                        Some(record) => {
                            record.resumable = Some(resumable);
                            Some(record.canceller.clone())
                        }
                        None => None,
                    }
                };
                let Some(canceller) = canceller else {
                    // Cancelled while the chunk ran; the future is abandoned.
                    self.inner.cancel_observer.on_abandoned(ident);
                    return;
                };
                trace!(%ident, "instance suspended");
                let runtime = self.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        biased;
                        () = canceller.closed() => {
                            runtime.inner.cancel_observer.on_abandoned(ident);
                        }
                        result = AssertUnwindSafe(future).catch_unwind() => {
                            let outcome = result.unwrap_or_else(|payload| {
                                StepOutcome::Fail(PipelineError::panic(panic_message(&*payload)))
                            });
                            runtime.resumed_with(ident, outcome);
                        }
                    }
                });
            }
        }
    }

    /// Completion handling: record terminal values, hold the queue slot
    /// while children live, otherwise remove and promote the next pending
    /// instance.
    fn finish(&self, ident: InstanceId, outcome: Outcome) {
        let mut report = None;
        let mut affected = Vec::new();
        {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            let Some(record) = st.registry.get_mut(ident) else {
                // Already finalized by cancellation.
                return;
            };
            record.deferred.resolve(outcome.clone());
            if record.parent.is_none() {
                if let Outcome::Failed(error) = &outcome {
                    report = Some(error.clone());
                }
            }
            let queue_name = record.queue.clone();
            let has_children = !record.children.is_empty();
            if has_children {
                record.state = InstanceState::WaitingChildren;
                record.resumable = None;
            }
            if let Some(q) = st.queues.get_mut(&queue_name) {
                match &outcome {
                    Outcome::Value(value) => q.last_result = Some(value.clone()),
                    Outcome::Failed(error) => q.last_error = Some(error.clone()),
                    Outcome::Cancelled => {}
                }
            }
            debug!(%ident, queue = %queue_name, waiting_children = has_children, "instance finished");
            if !has_children {
                affected = st.remove_cascade(ident);
            }
        }
        if let Some(error) = report {
            self.inner.error_reporter.report(&error);
        }
        affected.sort();
        affected.dedup();
        for queue in affected {
            self.start_next(&queue);
        }
    }

    /// Promotes pending instances in FIFO order up to the queue's capacity.
    fn start_next(&self, queue: &str) {
        loop {
            let next = {
                let mut guard = self.inner.state.lock();
                let st = &mut *guard;
                let running = st.running_count(queue);
                let Some(q) = st.queues.get(queue) else {
                    return;
                };
                if !q.config.max.allows(running) {
                    return;
                }
                let candidate = q.fifo.iter().copied().find(|id| {
                    st.registry
                        .get(*id)
                        .is_some_and(|r| r.state == InstanceState::Pending)
                });
                let Some(id) = candidate else {
                    return;
                };
                if let Some(record) = st.registry.get_mut(id) {
                    record.state = InstanceState::Running;
                }
                id
            };
            trace!(ident = %next, queue, "promoting pending instance");
            self.drive(next);
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("Runtime")
            .field("pipelines", &self.inner.pipelines.len())
            .field("queues", &st.queues.len())
            .field("stopped", &st.stopped)
            .finish()
    }
}
