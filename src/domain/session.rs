//! Authorization session state and its per-command crypto.
//!
//! A `Session` mirrors one device-resident session: the negotiated hash,
//! symmetric parameters, the current nonce pair and the derived session key.
//! The session key is derived once, at establishment, from the bind auth and
//! salt; everything per-command (auth HMACs, parameter encryption keys)
//! derives from it and the rolling nonces.

use core::fmt;

use rand::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::core::crypto::cipher::{self, CipherError};
use crate::core::crypto::kdf::{kdfa, LABEL_ATH};
use crate::core::crypto::HashAlg;
use crate::core::wire::{AlgId, SessionAttributes, WireWriter};
use crate::domain::handle::LocalHandle;

/// Session establishment kind; the value goes on the wire as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Hmac = 0x00,
    Policy = 0x01,
    /// Policy session that only accumulates a digest, for offline
    /// policy computation.
    Trial = 0x03,
}

impl SessionKind {
    #[must_use]
    pub fn wire_value(self) -> u8 {
        self as u8
    }
}

/// Symmetric algorithm negotiated for session parameter encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymDef {
    Null,
    Aes128Cfb,
}

impl SymDef {
    /// Append the wire form: algorithm id, then key bits and mode when
    /// the algorithm is not null.
    pub fn encode(self, w: &mut WireWriter) {
        match self {
            SymDef::Null => {
                w.write_u16(AlgId::NULL.value());
            }
            SymDef::Aes128Cfb => {
                w.write_u16(AlgId::AES.value())
                    .write_u16(cipher::AES128_KEY_BITS)
                    .write_u16(AlgId::CFB.value());
            }
        }
    }
}

/// Live authorization session.
pub struct Session {
    pub handle: LocalHandle,
    pub kind: SessionKind,
    pub hash: HashAlg,
    pub symmetric: SymDef,
    pub attributes: SessionAttributes,
    nonce_caller: Vec<u8>,
    nonce_device: Vec<u8>,
    session_key: Zeroizing<Vec<u8>>,
    /// Running policy digest; zero-length for HMAC sessions.
    pub policy_digest: Vec<u8>,
    /// Set by a policy-auth-value assertion: the object's auth value joins
    /// the HMAC key even though the session is a policy session.
    pub needs_auth_value: bool,
}

impl Session {
    /// Build session state from the establishment exchange.
    ///
    /// The session key is KDFa(bind_auth || salt, "ATH", nonce_device,
    /// nonce_caller); with neither bind nor salt it is empty and commands
    /// authorize with the object auth value alone.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handle: LocalHandle,
        kind: SessionKind,
        hash: HashAlg,
        symmetric: SymDef,
        attributes: SessionAttributes,
        nonce_caller: Vec<u8>,
        nonce_device: Vec<u8>,
        bind_auth: &[u8],
        salt: &[u8],
    ) -> Self {
        let session_key = if bind_auth.is_empty() && salt.is_empty() {
            Zeroizing::new(Vec::new())
        } else {
            let mut seed = Zeroizing::new(Vec::with_capacity(bind_auth.len() + salt.len()));
            seed.extend_from_slice(bind_auth);
            seed.extend_from_slice(salt);
            kdfa(
                hash,
                &seed,
                LABEL_ATH,
                &nonce_device,
                &nonce_caller,
                hash.digest_bits(),
            )
        };
        let policy_digest = match kind {
            SessionKind::Hmac => Vec::new(),
            SessionKind::Policy | SessionKind::Trial => vec![0u8; hash.digest_len()],
        };
        Session {
            handle,
            kind,
            hash,
            symmetric,
            attributes,
            nonce_caller,
            nonce_device,
            session_key,
            policy_digest,
            needs_auth_value: false,
        }
    }

    #[must_use]
    pub fn nonce_caller(&self) -> &[u8] {
        &self.nonce_caller
    }

    #[must_use]
    pub fn nonce_device(&self) -> &[u8] {
        &self.nonce_device
    }

    /// Replace the caller nonce with fresh randomness of the same length.
    /// Called once per command attempt, before authorization is computed,
    /// so no two attempts ever share a caller nonce.
    pub fn roll_caller_nonce<R: RngCore + CryptoRng>(&mut self, rng: &mut R) {
        rng.fill_bytes(&mut self.nonce_caller);
    }

    /// Adopt the device nonce acknowledged in a verified response.
    pub fn set_device_nonce(&mut self, nonce: &[u8]) {
        self.nonce_device.clear();
        self.nonce_device.extend_from_slice(nonce);
    }

    /// Sessions without the continue attribute are retired by the device
    /// after one successful use.
    #[must_use]
    pub fn is_one_shot(&self) -> bool {
        !self.attributes.contains(SessionAttributes::CONTINUE_SESSION)
    }

    /// Whether the object auth value joins the HMAC key for this session.
    /// HMAC sessions always mix it in unless bound to the object; policy
    /// sessions only after a policy-auth-value assertion.
    #[must_use]
    fn uses_auth_value(&self) -> bool {
        match self.kind {
            SessionKind::Hmac => true,
            SessionKind::Policy | SessionKind::Trial => self.needs_auth_value,
        }
    }

    fn hmac_key(&self, auth_value: &[u8]) -> Zeroizing<Vec<u8>> {
        let mut key = Zeroizing::new(Vec::with_capacity(
            self.session_key.len() + auth_value.len(),
        ));
        key.extend_from_slice(&self.session_key);
        if self.uses_auth_value() {
            key.extend_from_slice(auth_value);
        }
        key
    }

    /// Authorization HMAC for a command: keyed over
    /// cpHash || nonceCaller || nonceDevice || attributes.
    #[must_use]
    pub fn compute_command_auth(&self, cp_hash: &[u8], auth_value: &[u8]) -> Vec<u8> {
        let key = self.hmac_key(auth_value);
        self.hash.hmac(
            &key,
            &[
                cp_hash,
                &self.nonce_caller,
                &self.nonce_device,
                &[self.attributes.value()],
            ],
        )
    }

    /// Verify a response acknowledgement HMAC, keyed over
    /// rpHash || nonceDevice || nonceCaller || attributes. The device nonce
    /// is the one carried in this acknowledgement, not yet adopted.
    #[must_use]
    pub fn verify_response_auth(
        &self,
        rp_hash: &[u8],
        ack_nonce: &[u8],
        ack_attributes: SessionAttributes,
        auth_value: &[u8],
        hmac: &[u8],
    ) -> bool {
        let key = self.hmac_key(auth_value);
        self.hash.hmac_verify(
            &key,
            &[
                rp_hash,
                ack_nonce,
                &self.nonce_caller,
                &[ack_attributes.value()],
            ],
            hmac,
        )
    }

    fn encryption_seed(&self, auth_value: &[u8]) -> Zeroizing<Vec<u8>> {
        let mut seed = Zeroizing::new(Vec::with_capacity(
            self.session_key.len() + auth_value.len(),
        ));
        seed.extend_from_slice(&self.session_key);
        seed.extend_from_slice(auth_value);
        seed
    }

    /// Encrypt the first command parameter in place (size prefix stays
    /// clear). Keys derive from the nonce pair with the caller nonce as the
    /// newer one.
    ///
    /// # Errors
    /// [`CipherError`] if the parameter area is malformed.
    pub fn encrypt_command_parameter(
        &self,
        params: &mut [u8],
        auth_value: &[u8],
    ) -> Result<(), CipherError> {
        if self.symmetric == SymDef::Null {
            return Ok(());
        }
        let seed = self.encryption_seed(auth_value);
        cipher::encrypt_first_parameter(
            self.hash,
            &seed,
            &self.nonce_caller,
            &self.nonce_device,
            params,
        )
    }

    /// Decrypt the first response parameter in place; the device nonce from
    /// the current acknowledgement is the newer one.
    ///
    /// # Errors
    /// [`CipherError`] if the parameter area is malformed.
    pub fn decrypt_response_parameter(
        &self,
        params: &mut [u8],
        auth_value: &[u8],
    ) -> Result<(), CipherError> {
        if self.symmetric == SymDef::Null {
            return Ok(());
        }
        let seed = self.encryption_seed(auth_value);
        cipher::decrypt_first_parameter(
            self.hash,
            &seed,
            &self.nonce_device,
            &self.nonce_caller,
            params,
        )
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("hash", &self.hash)
            .field("symmetric", &self.symmetric)
            .field("attributes", &self.attributes)
            .field("session_key", &"<redacted>")
            .field("needs_auth_value", &self.needs_auth_value)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::handle::HandleTable;
    use rand::rngs::mock::StepRng;

    // StepRng is not CryptoRng; wrap it for nonce-rolling tests.
    struct TestRng(StepRng);
    impl RngCore for TestRng {
        fn next_u32(&mut self) -> u32 {
            self.0.next_u32()
        }
        fn next_u64(&mut self) -> u64 {
            self.0.next_u64()
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            self.0.fill_bytes(dest);
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
            self.0.try_fill_bytes(dest)
        }
    }
    impl CryptoRng for TestRng {}

    fn sample_session(bind_auth: &[u8], salt: &[u8]) -> Session {
        Session::new(
            HandleTable::OWNER,
            SessionKind::Hmac,
            HashAlg::Sha256,
            SymDef::Null,
            SessionAttributes::CONTINUE_SESSION,
            vec![0x11; 16],
            vec![0x22; 16],
            bind_auth,
            salt,
        )
    }

    #[test]
    fn unbound_unsalted_session_key_is_empty() {
        let s = sample_session(&[], &[]);
        assert!(s.session_key.is_empty());
    }

    #[test]
    fn bound_session_key_has_digest_length() {
        let s = sample_session(b"owner-auth", &[]);
        assert_eq!(s.session_key.len(), HashAlg::Sha256.digest_len());
    }

    #[test]
    fn command_auth_round_trips_as_response_auth_key() {
        let s = sample_session(b"bind", b"salt");
        let cp = HashAlg::Sha256.digest(&[b"cp"]);
        let mac = s.compute_command_auth(&cp, b"object-auth");
        assert_eq!(mac.len(), 32);
        // Same inputs give the same mac; any flipped byte breaks verify.
        assert_eq!(mac, s.compute_command_auth(&cp, b"object-auth"));
        let rp = HashAlg::Sha256.digest(&[b"rp"]);
        let ack = s.hash.hmac(
            &s.hmac_key(b"object-auth"),
            &[&rp, s.nonce_device(), s.nonce_caller(), &[s.attributes.value()]],
        );
        assert!(s.verify_response_auth(&rp, &vec![0x22; 16], s.attributes, b"object-auth", &ack));
        let mut bad = ack.clone();
        bad[0] ^= 0x01;
        assert!(!s.verify_response_auth(&rp, &vec![0x22; 16], s.attributes, b"object-auth", &bad));
    }

    #[test]
    fn policy_session_skips_auth_value_until_asserted() {
        let mut s = Session::new(
            HandleTable::OWNER,
            SessionKind::Policy,
            HashAlg::Sha256,
            SymDef::Null,
            SessionAttributes::CONTINUE_SESSION,
            vec![0x11; 16],
            vec![0x22; 16],
            b"bind",
            &[],
        );
        let cp = HashAlg::Sha256.digest(&[b"cp"]);
        let without = s.compute_command_auth(&cp, b"object-auth");
        s.needs_auth_value = true;
        let with = s.compute_command_auth(&cp, b"object-auth");
        assert_ne!(without, with);
    }

    #[test]
    fn rolling_caller_nonce_changes_auth() {
        let mut s = sample_session(b"bind", &[]);
        let cp = HashAlg::Sha256.digest(&[b"cp"]);
        let before = s.compute_command_auth(&cp, &[]);
        let mut rng = TestRng(StepRng::new(0x5151_5151, 1));
        s.roll_caller_nonce(&mut rng);
        let after = s.compute_command_auth(&cp, &[]);
        assert_ne!(before, after);
        assert_eq!(s.nonce_caller().len(), 16, "nonce length is preserved");
    }

    #[test]
    fn cfb_encrypt_then_decrypt_restores_parameter() {
        let s = Session::new(
            HandleTable::OWNER,
            SessionKind::Hmac,
            HashAlg::Sha256,
            SymDef::Aes128Cfb,
            SessionAttributes::CONTINUE_SESSION | SessionAttributes::DECRYPT,
            vec![0x11; 16],
            vec![0x22; 16],
            b"bind",
            &[],
        );
        let mut params = WireWriter::new();
        params
            .write_sized(b"attack at dawn")
            .unwrap()
            .write_u32(0xDEAD_BEEF);
        let mut buf = params.into_bytes();
        let clear = buf.clone();
        s.encrypt_command_parameter(&mut buf, b"auth").unwrap();
        assert_ne!(buf, clear);
        assert_eq!(&buf[..2], &clear[..2], "size prefix stays clear");
        assert_eq!(&buf[16..], &clear[16..], "later fields untouched");
        // The command direction encrypts with nonceCaller newer; undo it
        // with the matching decryptor.
        cipher::decrypt_first_parameter(
            s.hash,
            &s.encryption_seed(b"auth"),
            s.nonce_caller(),
            s.nonce_device(),
            &mut buf,
        )
        .unwrap();
        assert_eq!(buf, clear);
    }

    #[test]
    fn null_symmetric_leaves_parameters_alone() {
        let s = sample_session(&[], &[]);
        let mut buf = vec![0x00, 0x03, 0xAA, 0xBB, 0xCC];
        let clear = buf.clone();
        s.encrypt_command_parameter(&mut buf, &[]).unwrap();
        assert_eq!(buf, clear);
    }

    #[test]
    fn debug_redacts_session_key() {
        let s = sample_session(b"secret-bind", &[]);
        let rendered = format!("{s:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("secret"));
    }
}
