//! Boundary traits for the command layer.
//!
//! * [`transport`]: the transmission interface, one serialized command buffer
//!   in, one raw response buffer out.
//! * [`secrets`]: callback-based resolution of object authorization values,
//!   supplied by the caller at invocation time and never stored by the core.

pub mod secrets;
pub mod transport;

pub use secrets::{AuthSource, AuthValue, EmptyAuth, SecretError};
pub use transport::{Transport, TransportError};
