//! Resumables: mutable snapshots of a pipeline instance's execution.

use crate::core::{Step, Value};
use crate::errors::PipelineError;
use crate::pipeline::Pipeline;
use serde::Serialize;
use std::collections::VecDeque;

/// The block the interpreter is executing; always exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Block {
    /// The main sequence.
    Begin,
    /// Error handling.
    Rescue,
    /// Runs on every terminal outcome except cancellation.
    Finally,
}

impl std::fmt::Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Block::Begin => f.write_str("begin"),
            Block::Rescue => f.write_str("rescue"),
            Block::Finally => f.write_str("finally"),
        }
    }
}

/// A pipeline instance frozen at one point of execution.
///
/// Fields are public on purpose: interpreter-aware steps build and mutate
/// these records to rewrite remaining work (stack replacement, synthetic
/// step injection, stale-while-revalidate). The interpreter continues
/// faithfully from whatever `(block, remaining, value, prev_value, error,
/// tail)` it is handed.
#[derive(Clone)]
pub struct Resumable {
    /// The pipeline this instance executes.
    pub pipeline: Pipeline,
    /// The initial invocation value.
    pub args: Value,
    /// The active block.
    pub block: Block,
    /// Steps left in the active block.
    pub remaining: VecDeque<Step>,
    /// The current pipeline value.
    pub value: Value,
    /// The previous pipeline value.
    pub prev_value: Value,
    /// The in-flight error while executing `rescue` / `finally`.
    pub error: Option<PipelineError>,
    /// The value captured on entry to `finally`; the terminal value when
    /// `finally` exhausts without error.
    pub carried: Option<Value>,
    /// When set, runs first on the next stepping and feeds its terminal
    /// value in as the resumed value.
    pub tail: Option<Box<Resumable>>,
}

/// A terminal produced by block bookkeeping.
#[derive(Debug, Clone)]
pub(crate) enum Terminal {
    Done(Value),
    Failed(PipelineError),
}

impl Resumable {
    /// Creates a fresh resumable at the start of `begin`, with the args as
    /// the initial value.
    #[must_use]
    pub fn new(pipeline: Pipeline, args: Value) -> Self {
        let remaining: VecDeque<Step> = pipeline.body().begin.iter().cloned().collect();
        Self {
            pipeline,
            value: args.clone(),
            args,
            block: Block::Begin,
            remaining,
            prev_value: Value::Null,
            error: None,
            carried: None,
            tail: None,
        }
    }

    /// Applies a produced value. `Null` is nil/undefined: the value and
    /// previous value are kept.
    pub fn apply_value(&mut self, value: Value) {
        if value.is_null() {
            return;
        }
        self.prev_value = std::mem::replace(&mut self.value, value);
    }

    /// Routes an error per the block rules. Returns the error when no block
    /// remains to handle it (the instance terminates failed).
    pub(crate) fn raise(&mut self, error: PipelineError) -> Option<PipelineError> {
        match self.block {
            Block::Begin if !self.pipeline.body().rescue.is_empty() => {
                self.enter(Block::Rescue, Some(error));
                None
            }
            Block::Begin | Block::Rescue if !self.pipeline.body().finally.is_empty() => {
                self.enter(Block::Finally, Some(error));
                None
            }
            _ => Some(error),
        }
    }

    /// Handles exhaustion of the active block. `None` means execution
    /// continues in a later block.
    pub(crate) fn exhausted(&mut self) -> Option<Terminal> {
        match self.block {
            Block::Begin | Block::Rescue => {
                // Reaching the end of rescue means the error was handled.
                self.error = None;
                if self.pipeline.body().finally.is_empty() {
                    Some(Terminal::Done(self.value.clone()))
                } else {
                    self.carried = Some(self.value.clone());
                    self.enter(Block::Finally, None);
                    None
                }
            }
            Block::Finally => match self.error.clone() {
                Some(error) => Some(Terminal::Failed(error)),
                None => Some(Terminal::Done(
                    self.carried.clone().unwrap_or_else(|| self.value.clone()),
                )),
            },
        }
    }

    fn enter(&mut self, block: Block, error: Option<PipelineError>) {
        let steps = match block {
            Block::Begin => &self.pipeline.body().begin,
            Block::Rescue => &self.pipeline.body().rescue,
            Block::Finally => &self.pipeline.body().finally,
        };
        self.block = block;
        self.remaining = steps.iter().cloned().collect();
        if let Some(error) = error {
            self.error = Some(error);
        }
    }
}

impl std::fmt::Debug for Resumable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resumable")
            .field("pipeline", &self.pipeline.id())
            .field("block", &self.block)
            .field("remaining", &self.remaining.len())
            .field("value", &self.value)
            .field("error", &self.error)
            .field("tail", &self.tail.is_some())
            .finish()
    }
}
