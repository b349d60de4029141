//! Command execution: pipeline state machine and the typed operations
//! built on top of it.

pub mod ops;
pub mod pipeline;

pub use pipeline::{
    CommandOutput, Dispatcher, HandleArg, Invocation, RetryPolicy, SessionSlot,
};
