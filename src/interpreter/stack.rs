//! Read and rebuild the live resumable stack.

use super::Resumable;
use crate::registry::InstanceId;

/// One frame of the live stack: an instance and its execution snapshot.
#[derive(Debug, Clone)]
pub struct StackFrame {
    /// The instance the snapshot belongs to.
    pub ident: InstanceId,
    /// The instance's execution snapshot. For the innermost frame this is
    /// the in-progress resumable; for ancestors it is the suspension
    /// snapshot stored in the registry.
    pub resumable: Resumable,
}

/// The live resumable stack, innermost first, as handed to
/// interpreter-aware steps.
///
/// Frames are plain data: a step may clone them, splice steps into a
/// frame's `remaining`, and either return a rebuilt resumable (replacing
/// the current instance's execution) or write a frame back to a live
/// ancestor via [`crate::core::StepScope::rewrite_ancestor`].
#[derive(Debug, Clone, Default)]
pub struct InterpreterStack {
    /// Frames from innermost (the executing instance) to outermost.
    pub frames: Vec<StackFrame>,
}

impl InterpreterStack {
    /// The executing instance's frame.
    #[must_use]
    pub fn innermost(&self) -> Option<&StackFrame> {
        self.frames.first()
    }

    /// Looks up a frame by instance identity.
    #[must_use]
    pub fn frame(&self, ident: InstanceId) -> Option<&StackFrame> {
        self.frames.iter().find(|f| f.ident == ident)
    }

    /// Folds the frames into a single resumable chain: each outer frame
    /// carries the next inner one as its `tail`, so the innermost work runs
    /// first and feeds its terminal value outward.
    ///
    /// Returns `None` for an empty stack.
    #[must_use]
    pub fn rebuild(&self) -> Option<Resumable> {
        let mut frames = self.frames.iter();
        let mut inner = frames.next()?.resumable.clone();
        for frame in frames {
            let mut outer = frame.resumable.clone();
            outer.tail = Some(Box::new(inner));
            inner = outer;
        }
        Some(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{steps, Value};
    use crate::pipeline::Pipeline;
    use uuid::Uuid;

    fn frame(token: u64, value: Value) -> StackFrame {
        let pipeline = Pipeline::builder()
            .step(steps::effect(|_input| {}))
            .build();
        let mut resumable = Resumable::new(pipeline.clone(), Value::Null);
        resumable.value = value;
        StackFrame {
            ident: InstanceId {
                pipeline: Uuid::new_v4(),
                token,
            },
            resumable,
        }
    }

    #[test]
    fn test_rebuild_empty() {
        assert!(InterpreterStack::default().rebuild().is_none());
    }

    #[test]
    fn test_rebuild_chains_tails_inward() {
        let stack = InterpreterStack {
            frames: vec![
                frame(1, serde_json::json!("inner")),
                frame(2, serde_json::json!("middle")),
                frame(3, serde_json::json!("outer")),
            ],
        };

        let rebuilt = stack.rebuild().unwrap();
        assert_eq!(rebuilt.value, serde_json::json!("outer"));

        let middle = rebuilt.tail.as_ref().unwrap();
        assert_eq!(middle.value, serde_json::json!("middle"));

        let inner = middle.tail.as_ref().unwrap();
        assert_eq!(inner.value, serde_json::json!("inner"));
        assert!(inner.tail.is_none());
    }

    #[test]
    fn test_frame_lookup() {
        let f = frame(7, Value::Null);
        let ident = f.ident;
        let stack = InterpreterStack { frames: vec![f] };
        assert!(stack.frame(ident).is_some());
        assert_eq!(stack.innermost().unwrap().ident, ident);
    }
}
