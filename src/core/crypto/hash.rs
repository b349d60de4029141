//! Hash-agile digest and HMAC dispatch.
//!
//! Sessions pick their hash algorithm at creation; everything downstream
//! (session keys, cpHash/rpHash, policy digests) must use that same
//! primitive, so the algorithm travels as a value rather than a type
//! parameter.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha384};

use crate::core::wire::constants::AlgId;

/// Hash algorithms supported for sessions and policy digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlg {
    Sha256,
    Sha384,
}

impl HashAlg {
    #[must_use]
    pub fn alg_id(self) -> AlgId {
        match self {
            HashAlg::Sha256 => AlgId::SHA256,
            HashAlg::Sha384 => AlgId::SHA384,
        }
    }

    #[must_use]
    pub fn from_alg_id(id: AlgId) -> Option<Self> {
        match id {
            AlgId::SHA256 => Some(HashAlg::Sha256),
            AlgId::SHA384 => Some(HashAlg::Sha384),
            _ => None,
        }
    }

    /// Output size in bytes (also the session nonce size).
    #[must_use]
    pub fn digest_len(self) -> usize {
        match self {
            HashAlg::Sha256 => 32,
            HashAlg::Sha384 => 48,
        }
    }

    /// Digest length in bits, for key-derivation requests.
    #[must_use]
    pub fn digest_bits(self) -> u32 {
        match self {
            HashAlg::Sha256 => 256,
            HashAlg::Sha384 => 384,
        }
    }

    /// Digest the concatenation of `parts`.
    #[must_use]
    pub fn digest(self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            HashAlg::Sha256 => {
                let mut h = Sha256::new();
                for p in parts {
                    h.update(p);
                }
                h.finalize().to_vec()
            }
            HashAlg::Sha384 => {
                let mut h = Sha384::new();
                for p in parts {
                    h.update(p);
                }
                h.finalize().to_vec()
            }
        }
    }

    /// HMAC over the concatenation of `parts`.
    ///
    /// # Panics
    /// Does not panic in practice: HMAC accepts keys of any length, including
    /// empty (unsalted, unbound sessions legitimately have an empty key).
    #[must_use]
    pub fn hmac(self, key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
        match self {
            HashAlg::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(key)
                    .expect("HMAC accepts arbitrary key lengths");
                for p in parts {
                    mac.update(p);
                }
                mac.finalize().into_bytes().to_vec()
            }
            HashAlg::Sha384 => {
                let mut mac = Hmac::<Sha384>::new_from_slice(key)
                    .expect("HMAC accepts arbitrary key lengths");
                for p in parts {
                    mac.update(p);
                }
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    /// Constant-time comparison of `tag` against the HMAC of `parts`.
    #[must_use]
    pub fn hmac_verify(self, key: &[u8], parts: &[&[u8]], tag: &[u8]) -> bool {
        match self {
            HashAlg::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(key)
                    .expect("HMAC accepts arbitrary key lengths");
                for p in parts {
                    mac.update(p);
                }
                mac.verify_slice(tag).is_ok()
            }
            HashAlg::Sha384 => {
                let mut mac = Hmac::<Sha384>::new_from_slice(key)
                    .expect("HMAC accepts arbitrary key lengths");
                for p in parts {
                    mac.update(p);
                }
                mac.verify_slice(tag).is_ok()
            }
        }
    }
}
