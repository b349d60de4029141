//! Wire codec for the coprocessor's big-endian, length-prefixed, tag-delimited
//! binary command format.
//!
//! Pure data transformation: no I/O, no state, and deterministic output.
//! Identical input always yields identical bytes so that authorization HMACs
//! computed over the serialized form are reproducible.

pub mod buffer;
pub mod codec;
pub mod constants;

pub use buffer::{WireError, WireReader, WireWriter};
pub use codec::{decode_response, encode_command, AuthCommand, AuthResponse, CommandFrame, ResponseFrame};
pub use constants::{AlgId, CommandCode, ResponseCode, SessionAttributes, SessionTag};
