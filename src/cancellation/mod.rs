//! Cooperative cancellation primitives.

mod channel;

pub use channel::CancelChannel;
