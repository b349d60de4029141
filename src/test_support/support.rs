//! Test doubles for the command pipeline.

use std::collections::{HashMap, VecDeque};

use crate::core::crypto::{cipher, HashAlg};
use crate::core::wire::constants::{handle_type, SessionTag};
use crate::core::wire::{AlgId, CommandCode, ResponseCode, SessionAttributes, WireReader, WireWriter};
use crate::domain::policy;
use crate::ports::{Transport, TransportError};

/// Header-only response carrying just a response code.
#[must_use]
pub fn rc_only_response(rc: u32) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.write_u16(SessionTag::NoSessions.value())
        .write_u32(10)
        .write_u32(rc);
    w.into_bytes()
}

/// Successful sessionless response with the given parameter bytes.
#[must_use]
pub fn ok_response(params: &[u8]) -> Vec<u8> {
    build_ok(None, params)
}

/// Successful sessionless response carrying a returned handle.
#[must_use]
pub fn ok_response_with_handle(handle: u32, params: &[u8]) -> Vec<u8> {
    build_ok(Some(handle), params)
}

fn build_ok(handle: Option<u32>, params: &[u8]) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.write_u16(SessionTag::NoSessions.value())
        .write_u32(0)
        .write_u32(ResponseCode::SUCCESS.value());
    if let Some(h) = handle {
        w.write_u32(h);
    }
    w.write_bytes(params);
    patch_size(w.into_bytes())
}

fn patch_size(mut bytes: Vec<u8>) -> Vec<u8> {
    let total = u32::try_from(bytes.len()).unwrap();
    bytes[2..6].copy_from_slice(&total.to_be_bytes());
    bytes
}

/// Transport double that records every request and replays a scripted
/// response queue. An exhausted queue reports a closed transport.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    pub sent: Vec<Vec<u8>>,
    responses: VecDeque<Vec<u8>>,
}

impl ScriptedTransport {
    #[must_use]
    pub fn new() -> Self {
        ScriptedTransport::default()
    }

    pub fn push_response(&mut self, response: Vec<u8>) {
        self.responses.push_back(response);
    }

    #[must_use]
    pub fn with_responses(responses: impl IntoIterator<Item = Vec<u8>>) -> Self {
        ScriptedTransport {
            sent: Vec::new(),
            responses: responses.into_iter().collect(),
        }
    }
}

impl Transport for ScriptedTransport {
    fn send(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.sent.push(request.to_vec());
        self.responses.pop_front().ok_or(TransportError::Closed)
    }
}

#[derive(Debug)]
struct FakeSession {
    hash: HashAlg,
    nonce_caller: Vec<u8>,
    nonce_device: Vec<u8>,
    policy_digest: Vec<u8>,
}

/// In-process device emulator covering the command subset the end-to-end
/// tests need: session establishment, policy accumulation, digest readback,
/// flushing and random generation (with HMAC-session authorization for
/// unbound, unsalted sessions).
#[derive(Debug, Default)]
pub struct FakeDevice {
    sessions: HashMap<u32, FakeSession>,
    next_session: u32,
    nonce_counter: u8,
}

impl FakeDevice {
    #[must_use]
    pub fn new() -> Self {
        FakeDevice::default()
    }

    fn fresh_nonce(&mut self, len: usize) -> Vec<u8> {
        self.nonce_counter = self.nonce_counter.wrapping_add(1);
        vec![self.nonce_counter; len]
    }

    fn handle(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let mut r = WireReader::new(request);
        let tag = r.read_u16().ok()?;
        let declared = r.read_u32().ok()? as usize;
        if declared != request.len() {
            return None;
        }
        let code = CommandCode(r.read_u32().ok()?);

        match code {
            CommandCode::STARTUP => {
                let _startup_type = r.read_u16().ok()?;
                Some(ok_response(&[]))
            }
            CommandCode::START_AUTH_SESSION => self.start_auth_session(&mut r),
            CommandCode::FLUSH_CONTEXT => {
                let device = r.read_u32().ok()?;
                self.sessions.remove(&device);
                Some(ok_response(&[]))
            }
            CommandCode::POLICY_TEMPLATE => {
                let session = r.read_u32().ok()?;
                let template_hash = r.read_sized().ok()?.to_vec();
                let s = self.sessions.get_mut(&session)?;
                s.policy_digest = policy::policy_update(
                    s.hash,
                    &s.policy_digest,
                    CommandCode::POLICY_TEMPLATE,
                    &template_hash,
                    &[],
                );
                Some(ok_response(&[]))
            }
            CommandCode::POLICY_AUTH_VALUE => {
                let session = r.read_u32().ok()?;
                let s = self.sessions.get_mut(&session)?;
                s.policy_digest = policy::policy_update(
                    s.hash,
                    &s.policy_digest,
                    CommandCode::POLICY_AUTH_VALUE,
                    &[],
                    &[],
                );
                Some(ok_response(&[]))
            }
            CommandCode::POLICY_GET_DIGEST => {
                let session = r.read_u32().ok()?;
                let digest = self.sessions.get(&session)?.policy_digest.clone();
                let mut w = WireWriter::new();
                w.write_sized(&digest).ok()?;
                Some(ok_response(&w.into_bytes()))
            }
            CommandCode::GET_RANDOM => self.get_random(tag, &mut r),
            _ => Some(rc_only_response(0x0143)), // TPM_RC_COMMAND_CODE
        }
    }

    fn start_auth_session(&mut self, r: &mut WireReader<'_>) -> Option<Vec<u8>> {
        let _tpm_key = r.read_u32().ok()?;
        let _bind = r.read_u32().ok()?;
        let nonce_caller = r.read_sized().ok()?.to_vec();
        let _encrypted_salt = r.read_sized().ok()?;
        let kind = r.read_u8().ok()?;
        let sym_alg = r.read_u16().ok()?;
        if sym_alg != AlgId::NULL.value() {
            let _key_bits = r.read_u16().ok()?;
            let _mode = r.read_u16().ok()?;
        }
        let hash = HashAlg::from_alg_id(AlgId(r.read_u16().ok()?))?;

        self.next_session += 1;
        let ty = if kind == 0x00 {
            handle_type::HMAC_SESSION
        } else {
            handle_type::POLICY_SESSION
        };
        let device = u32::from(ty) << 24 | self.next_session;
        let nonce_device = self.fresh_nonce(nonce_caller.len());
        self.sessions.insert(
            device,
            FakeSession {
                hash,
                nonce_caller,
                nonce_device: nonce_device.clone(),
                policy_digest: policy::zero_digest(hash),
            },
        );
        let mut w = WireWriter::new();
        w.write_sized(&nonce_device).ok()?;
        Some(ok_response_with_handle(device, &w.into_bytes()))
    }

    /// GetRandom, optionally under one HMAC session. The emulator only
    /// models unbound, unsalted sessions, so the HMAC key is empty.
    fn get_random(&mut self, tag: u16, r: &mut WireReader<'_>) -> Option<Vec<u8>> {
        let auth = if tag == SessionTag::Sessions.value() {
            let area_len = r.read_u32().ok()? as usize;
            let area = r.read_bytes(area_len).ok()?;
            let mut a = WireReader::new(area);
            let session_handle = a.read_u32().ok()?;
            let nonce = a.read_sized().ok()?.to_vec();
            let attrs = a.read_u8().ok()?;
            let hmac = a.read_sized().ok()?.to_vec();
            Some((session_handle, nonce, attrs, hmac))
        } else {
            None
        };
        let len = r.read_u16().ok()?;
        let random = vec![0xA5_u8; usize::from(len)];
        let mut params = WireWriter::new();
        params.write_sized(&random).ok()?;
        let mut params = params.into_bytes();

        let Some((session_handle, nonce_caller, attrs, hmac)) = auth else {
            return Some(ok_response(&params));
        };

        // Verify the command HMAC against what the session state predicts.
        let cc = CommandCode::GET_RANDOM.value().to_be_bytes();
        let rc = ResponseCode::SUCCESS.value().to_be_bytes();
        let (hash, nonce_device) = {
            let s = self.sessions.get_mut(&session_handle)?;
            s.nonce_caller = nonce_caller.clone();
            (s.hash, s.nonce_device.clone())
        };
        let mut body = WireWriter::new();
        body.write_u16(len);
        let cp = hash.digest(&[&cc, &body.into_bytes()]);
        let expected = hash.hmac(&[], &[&cp, &nonce_caller, &nonce_device, &[attrs]]);
        if expected != hmac {
            return Some(rc_only_response(0x0098)); // authorization failed
        }

        let new_device_nonce = self.fresh_nonce(nonce_caller.len());
        // An encrypt session protects the returned buffer; the ack HMAC
        // covers the parameters as transmitted.
        if attrs & SessionAttributes::ENCRYPT.value() != 0 {
            cipher::encrypt_first_parameter(hash, &[], &new_device_nonce, &nonce_caller, &mut params)
                .ok()?;
        }
        let rp = hash.digest(&[&rc, &cc, &params]);
        let ack_hmac = hash.hmac(&[], &[&rp, &new_device_nonce, &nonce_caller, &[attrs]]);
        if let Some(s) = self.sessions.get_mut(&session_handle) {
            s.nonce_device = new_device_nonce.clone();
        }

        let mut w = WireWriter::new();
        w.write_u16(SessionTag::Sessions.value())
            .write_u32(0)
            .write_u32(ResponseCode::SUCCESS.value())
            .write_u32(u32::try_from(params.len()).ok()?)
            .write_bytes(&params);
        w.write_sized(&new_device_nonce).ok()?;
        w.write_u8(attrs);
        w.write_sized(&ack_hmac).ok()?;
        Some(patch_size(w.into_bytes()))
    }
}

impl Transport for FakeDevice {
    fn send(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.handle(request)
            .ok_or_else(|| TransportError::Io("emulator could not parse request".into()))
    }
}
