//! Policy digest accumulation.
//!
//! Every policy assertion folds into a running digest by hash chaining:
//! starting from an all-zero digest of the session hash's size, each step
//! hashes the previous digest together with the assertion's command code and
//! arguments. Because the chain is strictly ordered, two policies agree only
//! if they made the same assertions in the same order.

use crate::core::crypto::HashAlg;
use crate::core::wire::CommandCode;

/// The all-zero starting digest for a fresh policy session.
#[must_use]
pub fn zero_digest(hash: HashAlg) -> Vec<u8> {
    vec![0u8; hash.digest_len()]
}

/// One step of the policy hash chain:
/// `H(acc || cc || arg2)`, then `H(that || arg3)` when `arg3` is non-empty.
#[must_use]
pub fn policy_update(
    hash: HashAlg,
    acc: &[u8],
    cc: CommandCode,
    arg2: &[u8],
    arg3: &[u8],
) -> Vec<u8> {
    let first = hash.digest(&[acc, &cc.value().to_be_bytes(), arg2]);
    if arg3.is_empty() {
        first
    } else {
        hash.digest(&[&first, arg3])
    }
}

/// A single policy assertion, as folded into the digest chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyAssertion {
    /// Restrict object creation to a template with the given digest.
    Template { template_hash: Vec<u8> },
    /// Restrict the session to authorizing one command code.
    CommandCode { code: CommandCode },
    /// Require the object's auth value in the session HMAC.
    AuthValue,
    /// Require the object's auth value presented in cleartext.
    /// Folds into the digest identically to [`PolicyAssertion::AuthValue`].
    Password,
    /// Require a live authorization by the named object.
    Secret {
        object_name: Vec<u8>,
        policy_ref: Vec<u8>,
    },
}

impl PolicyAssertion {
    #[must_use]
    pub fn code(&self) -> CommandCode {
        match self {
            PolicyAssertion::Template { .. } => CommandCode::POLICY_TEMPLATE,
            PolicyAssertion::CommandCode { .. } => CommandCode::POLICY_COMMAND_CODE,
            // Password deliberately extends with the auth-value code so a
            // cleartext-auth policy and an HMAC-auth policy share a digest.
            PolicyAssertion::AuthValue | PolicyAssertion::Password => {
                CommandCode::POLICY_AUTH_VALUE
            }
            PolicyAssertion::Secret { .. } => CommandCode::POLICY_SECRET,
        }
    }

    /// Fold this assertion into `acc`.
    #[must_use]
    pub fn extend(&self, hash: HashAlg, acc: &[u8]) -> Vec<u8> {
        match self {
            PolicyAssertion::Template { template_hash } => {
                policy_update(hash, acc, self.code(), template_hash, &[])
            }
            PolicyAssertion::CommandCode { code } => {
                policy_update(hash, acc, self.code(), &code.value().to_be_bytes(), &[])
            }
            PolicyAssertion::AuthValue | PolicyAssertion::Password => {
                policy_update(hash, acc, self.code(), &[], &[])
            }
            PolicyAssertion::Secret {
                object_name,
                policy_ref,
            } => policy_update(hash, acc, self.code(), object_name, policy_ref),
        }
    }
}

/// Offline digest computation: what a trial session would accumulate after
/// making `assertions` in order.
#[must_use]
pub fn compute_digest(hash: HashAlg, assertions: &[PolicyAssertion]) -> Vec<u8> {
    assertions
        .iter()
        .fold(zero_digest(hash), |acc, a| a.extend(hash, &acc))
}
