//! AES-128-CFB keystream for session parameter encryption.
//!
//! The protected field is the byte content of the first size-prefixed command
//! (or response) parameter; the size prefix itself stays in the clear. Key
//! and IV come from a single KDFa expansion over the session value and the
//! current nonce pair, so each exchange uses a fresh keystream.

use aes::Aes128;
use cfb_mode::{Decryptor, Encryptor};
use cipher::{AsyncStreamCipher, KeyIvInit};
use thiserror::Error;
use zeroize::Zeroize;

use super::hash::HashAlg;
use super::kdf::{kdfa, LABEL_CFB};

/// AES-128 key width in bits.
pub const AES128_KEY_BITS: u16 = 128;
/// AES block width in bits (CFB IV size).
pub const AES_BLOCK_BITS: u16 = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("parameter area too short for a size-prefixed field")]
    ShortParameter,
    #[error("size-prefixed field of {declared} bytes exceeds the {available} parameter byte(s)")]
    FieldPastEnd { declared: usize, available: usize },
}

/// Derive the CFB key and IV for one direction of one exchange.
///
/// `nonce_newer`/`nonce_older` follow the protocol's direction rule: for a
/// command parameter the caller nonce is newer; for a response parameter the
/// device nonce is newer.
fn derive_key_iv(
    hash: HashAlg,
    session_value: &[u8],
    nonce_newer: &[u8],
    nonce_older: &[u8],
) -> ([u8; 16], [u8; 16]) {
    let okm = kdfa(
        hash,
        session_value,
        LABEL_CFB,
        nonce_newer,
        nonce_older,
        u32::from(AES128_KEY_BITS) + u32::from(AES_BLOCK_BITS),
    );
    let mut key = [0u8; 16];
    let mut iv = [0u8; 16];
    key.copy_from_slice(&okm[..16]);
    iv.copy_from_slice(&okm[16..32]);
    (key, iv)
}

/// Encrypt, in place, the content of the first size-prefixed parameter.
///
/// # Errors
/// Fails when the parameter area does not start with a consistent
/// size-prefixed field; nothing is modified in that case.
pub fn encrypt_first_parameter(
    hash: HashAlg,
    session_value: &[u8],
    nonce_newer: &[u8],
    nonce_older: &[u8],
    params: &mut [u8],
) -> Result<(), CipherError> {
    let field = first_field_range(params)?;
    let (mut key, iv) = derive_key_iv(hash, session_value, nonce_newer, nonce_older);
    Encryptor::<Aes128>::new(&key.into(), &iv.into()).encrypt(&mut params[field]);
    key.zeroize();
    Ok(())
}

/// Decrypt, in place, the content of the first size-prefixed parameter.
///
/// # Errors
/// Fails when the parameter area does not start with a consistent
/// size-prefixed field; nothing is modified in that case.
pub fn decrypt_first_parameter(
    hash: HashAlg,
    session_value: &[u8],
    nonce_newer: &[u8],
    nonce_older: &[u8],
    params: &mut [u8],
) -> Result<(), CipherError> {
    let field = first_field_range(params)?;
    let (mut key, iv) = derive_key_iv(hash, session_value, nonce_newer, nonce_older);
    Decryptor::<Aes128>::new(&key.into(), &iv.into()).decrypt(&mut params[field]);
    key.zeroize();
    Ok(())
}

fn first_field_range(params: &[u8]) -> Result<core::ops::Range<usize>, CipherError> {
    if params.len() < 2 {
        return Err(CipherError::ShortParameter);
    }
    let declared = usize::from(u16::from_be_bytes([params[0], params[1]]));
    let available = params.len() - 2;
    if declared > available {
        return Err(CipherError::FieldPastEnd {
            declared,
            available,
        });
    }
    Ok(2..2 + declared)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sized(content: &[u8], tail: &[u8]) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&(content.len() as u16).to_be_bytes());
        v.extend_from_slice(content);
        v.extend_from_slice(tail);
        v
    }

    #[test]
    fn encrypt_decrypt_round_trip_leaves_size_and_tail_clear() {
        let mut params = sized(b"sensitive-value", &[0x01, 0x02]);
        let original = params.clone();
        encrypt_first_parameter(HashAlg::Sha256, b"sv", b"nc", b"nd", &mut params).unwrap();
        assert_eq!(&params[..2], &original[..2], "size prefix untouched");
        assert_eq!(&params[17..], &original[17..], "tail untouched");
        assert_ne!(&params[2..17], &original[2..17], "content encrypted");
        decrypt_first_parameter(HashAlg::Sha256, b"sv", b"nc", b"nd", &mut params).unwrap();
        assert_eq!(params, original);
    }

    #[test]
    fn keystream_bound_to_nonces() {
        let mut a = sized(b"same-plaintext--", &[]);
        let mut b = sized(b"same-plaintext--", &[]);
        encrypt_first_parameter(HashAlg::Sha256, b"sv", b"nonce-1", b"nd", &mut a).unwrap();
        encrypt_first_parameter(HashAlg::Sha256, b"sv", b"nonce-2", b"nd", &mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn short_parameter_area_rejected() {
        let mut params = vec![0x00];
        let err =
            encrypt_first_parameter(HashAlg::Sha256, b"sv", b"nc", b"nd", &mut params).unwrap_err();
        assert_eq!(err, CipherError::ShortParameter);
    }

    #[test]
    fn field_past_end_rejected_without_modification() {
        let mut params = vec![0x00, 0x20, 0xAA, 0xBB]; // declares 32, has 2
        let before = params.clone();
        let err =
            decrypt_first_parameter(HashAlg::Sha256, b"sv", b"nc", b"nd", &mut params).unwrap_err();
        assert_eq!(
            err,
            CipherError::FieldPastEnd {
                declared: 32,
                available: 2
            }
        );
        assert_eq!(params, before);
    }

    #[test]
    fn empty_field_is_a_no_op() {
        let mut params = sized(&[], &[0x07]);
        let before = params.clone();
        encrypt_first_parameter(HashAlg::Sha256, b"sv", b"nc", b"nd", &mut params).unwrap();
        assert_eq!(params, before);
    }
}
