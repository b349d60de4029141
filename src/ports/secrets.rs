use core::fmt;

use thiserror::Error;
use zeroize::Zeroizing;

use crate::domain::handle::LocalHandle;

/// Errors surfaced when an authorization value cannot be produced.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecretError {
    #[error("no authorization value available for the requested handle")]
    Unavailable,
    #[error("authorization callback failed: {0}")]
    Callback(String),
}

/// An object authorization value handed to the core for the duration of one
/// invocation.
///
/// The inner bytes are zeroized on drop and redacted from `Debug` output; the
/// core never persists them beyond the HMAC/encryption computations of the
/// invocation that requested them.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthValue(Zeroizing<Vec<u8>>);

impl AuthValue {
    /// The empty authorization value (well-known for unset object auth).
    #[must_use]
    pub fn empty() -> Self {
        AuthValue(Zeroizing::new(Vec::new()))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for AuthValue {
    fn from(value: &[u8]) -> Self {
        AuthValue(Zeroizing::new(value.to_vec()))
    }
}

impl From<Vec<u8>> for AuthValue {
    fn from(value: Vec<u8>) -> Self {
        AuthValue(Zeroizing::new(value))
    }
}

impl fmt::Debug for AuthValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthValue(..)")
    }
}

/// Capability-style resolution of authorization secrets.
///
/// The pipeline asks for an object's auth value only at the moment it is
/// needed (plaintext password auth, HMAC key suffix, or the auth-value leg of
/// a policy session). Callers pass a source per invocation; nothing is
/// registered globally, so a test can inject a deterministic secret.
pub trait AuthSource {
    /// Produce the authorization value for `object`.
    ///
    /// # Errors
    /// * `SecretError::Unavailable` if the caller holds no secret for the
    ///   object. The invocation fails before any bytes reach the device.
    fn auth_value(&self, object: LocalHandle) -> Result<AuthValue, SecretError>;
}

/// Source for objects whose auth value is empty (the protocol's well-known
/// default).
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyAuth;

impl AuthSource for EmptyAuth {
    fn auth_value(&self, _object: LocalHandle) -> Result<AuthValue, SecretError> {
        Ok(AuthValue::empty())
    }
}

impl<F> AuthSource for F
where
    F: Fn(LocalHandle) -> Result<AuthValue, SecretError>,
{
    fn auth_value(&self, object: LocalHandle) -> Result<AuthValue, SecretError> {
        self(object)
    }
}
