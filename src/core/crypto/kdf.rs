//! SP800-108 counter-mode key derivation (the device's "KDFa").
//!
//! Each output block i (1-based) is
//! `HMAC(key, be32(i) || label || 0x00 || contextU || contextV || be32(bits))`
//! and blocks are concatenated then truncated to `bits / 8` bytes. The
//! construction is a protocol constant: the device derives the same keys
//! independently, so any deviation breaks authorization outright.

use zeroize::{Zeroize, Zeroizing};

use super::hash::HashAlg;

/// Label for session-key derivation.
pub const LABEL_ATH: &[u8] = b"ATH";
/// Label for CFB parameter-encryption key + IV derivation.
pub const LABEL_CFB: &[u8] = b"CFB";

/// Derive `bits / 8` bytes of keying material.
///
/// `label` is passed without its terminating NUL; it is appended here. Only
/// whole-byte outputs are used by this protocol, so `bits` must be a multiple
/// of 8.
#[must_use]
pub fn kdfa(
    hash: HashAlg,
    key: &[u8],
    label: &[u8],
    context_u: &[u8],
    context_v: &[u8],
    bits: u32,
) -> Zeroizing<Vec<u8>> {
    debug_assert!(bits % 8 == 0, "partial-byte KDFa output is not used");
    let out_len = (bits as usize) / 8;
    let mut out = Zeroizing::new(Vec::with_capacity(out_len));
    let bits_be = bits.to_be_bytes();

    let mut counter: u32 = 1;
    while out.len() < out_len {
        let mut block = hash.hmac(
            key,
            &[
                &counter.to_be_bytes(),
                label,
                &[0x00],
                context_u,
                context_v,
                &bits_be,
            ],
        );
        let take = core::cmp::min(block.len(), out_len - out.len());
        out.extend_from_slice(&block[..take]);
        block.zeroize();
        counter += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_length_follows_bits() {
        let k = kdfa(HashAlg::Sha256, b"secret", LABEL_ATH, b"u", b"v", 256);
        assert_eq!(k.len(), 32);
        // Key + IV for AES-128 CFB: 128 + 128 bits.
        let kv = kdfa(HashAlg::Sha256, b"secret", LABEL_CFB, b"u", b"v", 256);
        assert_eq!(kv.len(), 32);
        // Multi-block: more than one SHA-256 output.
        let long = kdfa(HashAlg::Sha256, b"secret", LABEL_ATH, b"u", b"v", 512);
        assert_eq!(long.len(), 64);
        // The requested bit count feeds the PRF, so a longer derivation is
        // not a prefix extension of a shorter one.
        assert_ne!(&long[..32], &k[..]);
        assert_ne!(&long[..32], &long[32..], "blocks differ by counter");
    }

    #[test]
    fn deterministic_and_context_bound() {
        let a = kdfa(HashAlg::Sha256, b"k", LABEL_ATH, b"nonce-dev", b"nonce-cal", 256);
        let b = kdfa(HashAlg::Sha256, b"k", LABEL_ATH, b"nonce-dev", b"nonce-cal", 256);
        assert_eq!(a, b);

        let swapped = kdfa(HashAlg::Sha256, b"k", LABEL_ATH, b"nonce-cal", b"nonce-dev", 256);
        assert_ne!(a, swapped, "context order is significant");

        let other_label = kdfa(HashAlg::Sha256, b"k", LABEL_CFB, b"nonce-dev", b"nonce-cal", 256);
        assert_ne!(a, other_label, "label separates key domains");
    }

    #[test]
    fn hash_agility() {
        let s256 = kdfa(HashAlg::Sha256, b"k", LABEL_ATH, b"u", b"v", 256);
        let s384 = kdfa(HashAlg::Sha384, b"k", LABEL_ATH, b"u", b"v", 256);
        assert_ne!(s256, s384);
        assert_eq!(s384.len(), 32, "truncated to requested bits");
    }

    #[test]
    fn empty_key_supported() {
        // Unsalted, unbound sessions have an empty session key; the KDF must
        // still be well-defined for parameter encryption keyed by authValue.
        let k = kdfa(HashAlg::Sha256, &[], LABEL_CFB, b"u", b"v", 128);
        assert_eq!(k.len(), 16);
    }
}
