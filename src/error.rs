//! Command-layer error taxonomy.
//!
//! Every failure a caller can observe from command execution lands in
//! [`CommandError`]; lower layers keep their own error enums and convert at
//! this boundary.

use core::fmt;

use thiserror::Error;

use crate::core::crypto::cipher::CipherError;
use crate::core::wire::WireError;
use crate::domain::handle::HandleError;
use crate::ports::{SecretError, TransportError};

/// Raw response code reported by the device, rendered in hex.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DeviceRc(pub u32);

impl fmt::Debug for DeviceRc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceRc({:#010x})", self.0)
    }
}

impl fmt::Display for DeviceRc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Failures observable from one command execution.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The response bytes did not parse as a well-formed frame.
    #[error("malformed response frame: {0}")]
    MalformedResponse(#[source] WireError),

    /// A request argument failed encoding-time validation.
    #[error("invalid command parameter: {0}")]
    InvalidParameter(#[source] WireError),

    /// A handle requiring authorization had no session supplied for it.
    /// Detected before any bytes reach the device.
    #[error("handle slot {slot} requires authorization but none was supplied")]
    MissingAuthorization { slot: usize },

    /// A local handle was released, stale or never issued.
    #[error("unknown or released handle")]
    UnknownHandle,

    /// A response acknowledgement HMAC failed verification; the response
    /// contents were discarded.
    #[error("response authorization for session slot {slot} failed verification")]
    AuthorizationFailure { slot: usize },

    /// A parameter area was not shaped for session encryption, or a
    /// response parameter area could not be decrypted in place.
    #[error("parameter area: {0}")]
    Cipher(#[from] CipherError),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// The device stayed busy through the whole retry budget.
    #[error("device busy ({code}) after {attempts} attempts")]
    TransientDeviceBusy { code: DeviceRc, attempts: u32 },

    /// The device returned a non-success, non-transient response code.
    #[error("device rejected command: {code}")]
    DeviceRejected { code: DeviceRc },

    #[error("secret resolution: {0}")]
    Secret(#[from] SecretError),
}

impl From<HandleError> for CommandError {
    fn from(_: HandleError) -> Self {
        CommandError::UnknownHandle
    }
}
