//! Named queues: FIFO of instance idents under one frozen concurrency
//! config, with the queue's most recent terminal values.

use crate::core::Value;
use crate::errors::PipelineError;
use crate::pipeline::ConcurrencyConfig;
use crate::registry::InstanceId;
use std::collections::VecDeque;

/// Per-queue bookkeeping. The FIFO holds both pending and running idents
/// in admission order.
pub(crate) struct QueueState {
    /// Frozen from the first admitted instance; later admissions must
    /// match exactly.
    pub config: ConcurrencyConfig,
    pub fifo: VecDeque<InstanceId>,
    pub last_result: Option<Value>,
    pub last_error: Option<PipelineError>,
}

impl QueueState {
    pub fn new(config: ConcurrencyConfig) -> Self {
        Self {
            config,
            fifo: VecDeque::new(),
            last_result: None,
            last_error: None,
        }
    }

    pub fn push(&mut self, ident: InstanceId) {
        self.fifo.push_back(ident);
    }

    pub fn remove(&mut self, ident: InstanceId) {
        self.fifo.retain(|id| *id != ident);
    }
}

/// The admission decision for one invocation.
#[derive(Debug)]
pub(crate) enum Admission {
    /// Capacity available; start immediately.
    Start,
    /// Register pending, after cancelling the listed peers.
    Park { cancel: Vec<InstanceId> },
    /// Refused; the caller receives the cancellation sentinel.
    Drop,
}
