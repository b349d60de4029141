//! The command pipeline: authorization, framing, dispatch, verification.
//!
//! One [`Dispatcher`] owns the transport, the handle table and the live
//! sessions. Executing an invocation walks a fixed phase order; the only
//! backward edge is the bounded retry loop on transient busy codes, which
//! re-enters authorization so every attempt carries fresh caller nonces.

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use rand::{CryptoRng, RngCore};
use tracing::{debug, trace, warn};

use crate::core::crypto::HashAlg;
use crate::core::wire::constants::reserved;
use crate::core::wire::{
    decode_response, encode_command, AuthCommand, CommandCode, CommandFrame, ResponseCode,
    SessionAttributes,
};
use crate::domain::handle::{HandleTable, LocalHandle};
use crate::domain::session::Session;
use crate::error::{CommandError, DeviceRc};
use crate::ports::{AuthSource, AuthValue, Transport, TransportError};

/// Pipeline phase, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Building,
    AuthorizationComputed,
    Sent,
    ResponseReceived,
    Retrying,
    Verified,
    Complete,
}

impl Phase {
    fn ordinal(self) -> u8 {
        match self {
            Phase::Building => 0,
            Phase::AuthorizationComputed => 1,
            Phase::Sent => 2,
            Phase::ResponseReceived => 3,
            Phase::Retrying => 4,
            Phase::Verified => 5,
            Phase::Complete => 6,
        }
    }

    /// Move to `next`, asserting the legal order. The only backward edge is
    /// Retrying back to AuthorizationComputed.
    fn advance(&mut self, next: Phase) {
        debug_assert!(
            next.ordinal() > self.ordinal()
                || (*self == Phase::Retrying && next == Phase::AuthorizationComputed),
            "illegal phase transition {self:?} -> {next:?}",
        );
        *self = next;
    }
}

/// One entry of an invocation's handle area.
#[derive(Debug, Clone, Copy)]
pub struct HandleArg {
    pub handle: LocalHandle,
    /// Whether the device will demand authorization for this handle.
    pub needs_auth: bool,
}

impl HandleArg {
    #[must_use]
    pub fn authorized(handle: LocalHandle) -> Self {
        HandleArg {
            handle,
            needs_auth: true,
        }
    }

    #[must_use]
    pub fn plain(handle: LocalHandle) -> Self {
        HandleArg {
            handle,
            needs_auth: false,
        }
    }
}

/// One authorization slot of an invocation. The first slots pair with the
/// handles that need authorization, in order; extra slots are
/// encrypt/decrypt or audit only.
#[derive(Debug, Clone, Copy)]
pub enum SessionSlot {
    /// Cleartext password authorization under the well-known password
    /// session handle.
    Password,
    /// A keyed HMAC or policy session registered with the dispatcher.
    Session(LocalHandle),
}

/// A command ready for execution.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub code: CommandCode,
    pub handles: Vec<HandleArg>,
    pub sessions: Vec<SessionSlot>,
    pub params: Vec<u8>,
    /// Whether a success response carries a handle before the parameters.
    pub returns_handle: bool,
    /// Whether the first command parameter is a sized buffer eligible for
    /// session parameter encryption.
    pub first_param_is_buffer: bool,
    /// Whether the first response parameter is a sized buffer eligible for
    /// session parameter encryption. Independent of the command side: a
    /// command can take a plain integer and return a buffer.
    pub first_result_is_buffer: bool,
}

impl Invocation {
    #[must_use]
    pub fn new(code: CommandCode) -> Self {
        Invocation {
            code,
            handles: Vec::new(),
            sessions: Vec::new(),
            params: Vec::new(),
            returns_handle: false,
            first_param_is_buffer: false,
            first_result_is_buffer: false,
        }
    }
}

/// Successful command result, after verification and decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub rc: ResponseCode,
    pub handle: Option<u32>,
    pub params: Vec<u8>,
}

/// Bounded exponential backoff for transient busy codes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before re-sending after `attempt` failed attempts (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// Owner of one device conversation: transport, handle table, sessions.
#[derive(Debug)]
pub struct Dispatcher<T, R> {
    transport: T,
    rng: R,
    pub handles: HandleTable,
    sessions: HashMap<LocalHandle, Session>,
    retry: RetryPolicy,
}

impl<T, R> Dispatcher<T, R>
where
    T: Transport,
    R: RngCore + CryptoRng,
{
    #[must_use]
    pub fn new(transport: T, rng: R) -> Self {
        Dispatcher {
            transport,
            rng,
            handles: HandleTable::new(),
            sessions: HashMap::new(),
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Borrow the underlying transport, e.g. to inspect a test double.
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Register a session established out of band (tests mostly; normal
    /// callers go through session establishment in the ops layer).
    pub fn register_session(&mut self, session: Session) {
        self.sessions.insert(session.handle, session);
    }

    #[must_use]
    pub fn session(&self, handle: LocalHandle) -> Option<&Session> {
        self.sessions.get(&handle)
    }

    pub(crate) fn rng_mut(&mut self) -> &mut R {
        &mut self.rng
    }

    pub(crate) fn session_mut(&mut self, handle: LocalHandle) -> Option<&mut Session> {
        self.sessions.get_mut(&handle)
    }

    pub(crate) fn remove_session(&mut self, handle: LocalHandle) -> Option<Session> {
        self.sessions.remove(&handle)
    }

    /// Execute one command end to end.
    ///
    /// Validation happens strictly before dispatch: a handle that needs
    /// authorization without a session slot to cover it fails here and
    /// nothing reaches the device. Transient busy responses are retried
    /// with fresh caller nonces up to the policy budget.
    ///
    /// # Errors
    /// See [`CommandError`]; any error leaves the handle table and session
    /// nonces in a usable state for the next command.
    #[allow(clippy::too_many_lines)]
    pub fn execute(
        &mut self,
        inv: &Invocation,
        auth: &dyn AuthSource,
    ) -> Result<CommandOutput, CommandError> {
        let mut phase = Phase::Building;

        // Resolve every handle up front; names are owned copies because the
        // retry loop needs them across mutations of session state.
        let mut devices = Vec::with_capacity(inv.handles.len());
        let mut names: Vec<Vec<u8>> = Vec::with_capacity(inv.handles.len());
        for arg in &inv.handles {
            let resolved = self.handles.resolve(arg.handle)?;
            devices.push(resolved.device);
            names.push(resolved.name.to_vec());
        }

        // Session slot i authorizes the i-th handle that needs authorization,
        // wherever that handle sits in the handle area.
        let auth_handles: Vec<LocalHandle> = inv
            .handles
            .iter()
            .filter(|h| h.needs_auth)
            .map(|h| h.handle)
            .collect();
        let auth_needed = auth_handles.len();
        if inv.sessions.len() < auth_needed {
            return Err(CommandError::MissingAuthorization {
                slot: inv.sessions.len(),
            });
        }

        // Auth values for authorizing slots; empty for pure encrypt slots.
        let mut auth_values = Vec::with_capacity(inv.sessions.len());
        for (i, _) in inv.sessions.iter().enumerate() {
            match auth_handles.get(i) {
                Some(object) => auth_values.push(auth.auth_value(*object)?),
                None => auth_values.push(AuthValue::empty()),
            }
        }

        // Keyed session slots must be registered; check before any attempt.
        for slot in &inv.sessions {
            if let SessionSlot::Session(h) = slot {
                self.handles.resolve(*h)?;
                if !self.sessions.contains_key(h) {
                    return Err(CommandError::UnknownHandle);
                }
            }
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            phase.advance(Phase::AuthorizationComputed);

            let mut params = inv.params.clone();
            self.roll_nonces(&inv.sessions);
            self.encrypt_request(inv, &auth_values, &mut params)?;

            let auths = self.build_auth_area(inv, &names, auth_needed, &auth_values, &params)?;
            let frame = CommandFrame {
                code: inv.code,
                handles: &devices,
                auths: &auths,
                params: &params,
            };
            let request = encode_command(&frame).map_err(CommandError::InvalidParameter)?;

            phase.advance(Phase::Sent);
            trace!(code = inv.code.value(), attempt, "dispatching command");
            let raw = self.transport.send(&request)?;
            if raw.is_empty() {
                return Err(CommandError::Transport(TransportError::Empty));
            }

            phase.advance(Phase::ResponseReceived);
            let response = decode_response(&raw, inv.sessions.len(), inv.returns_handle)
                .map_err(CommandError::MalformedResponse)?;

            if response.rc.is_transient() {
                if attempt >= self.retry.max_attempts {
                    warn!(rc = %response.rc, attempts = attempt, "retry budget exhausted");
                    return Err(CommandError::TransientDeviceBusy {
                        code: DeviceRc(response.rc.value()),
                        attempts: attempt,
                    });
                }
                let delay = self.retry.delay(attempt);
                debug!(rc = %response.rc, attempt, ?delay, "device busy, backing off");
                phase.advance(Phase::Retrying);
                thread::sleep(delay);
                continue;
            }

            if !response.rc.is_success() {
                return Err(CommandError::DeviceRejected {
                    code: DeviceRc(response.rc.value()),
                });
            }

            // Verify every keyed acknowledgement before trusting anything in
            // the response, then adopt the new device nonces.
            self.verify_acks(inv, &auth_values, &response)?;
            phase.advance(Phase::Verified);

            for (slot, ack) in inv.sessions.iter().zip(&response.acks) {
                if let SessionSlot::Session(h) = slot {
                    if let Some(session) = self.sessions.get_mut(h) {
                        session.set_device_nonce(&ack.nonce);
                    }
                }
            }

            let mut out_params = response.params;
            self.decrypt_response(inv, &auth_values, &mut out_params)?;
            self.retire_one_shot_sessions(&inv.sessions);

            phase.advance(Phase::Complete);
            return Ok(CommandOutput {
                rc: response.rc,
                handle: response.handle,
                params: out_params,
            });
        }
    }

    fn roll_nonces(&mut self, slots: &[SessionSlot]) {
        for slot in slots {
            if let SessionSlot::Session(h) = slot {
                if let Some(session) = self.sessions.get_mut(h) {
                    session.roll_caller_nonce(&mut self.rng);
                }
            }
        }
    }

    /// Encrypt the first command parameter under the first session carrying
    /// the decrypt attribute, if any.
    fn encrypt_request(
        &self,
        inv: &Invocation,
        auth_values: &[AuthValue],
        params: &mut [u8],
    ) -> Result<(), CommandError> {
        if !inv.first_param_is_buffer || params.is_empty() {
            return Ok(());
        }
        for (slot, value) in inv.sessions.iter().zip(auth_values) {
            if let SessionSlot::Session(h) = slot {
                if let Some(session) = self.sessions.get(h) {
                    if session.attributes.contains(SessionAttributes::DECRYPT) {
                        session.encrypt_command_parameter(params, value.as_bytes())?;
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    fn build_auth_area(
        &self,
        inv: &Invocation,
        names: &[Vec<u8>],
        auth_needed: usize,
        auth_values: &[AuthValue],
        params: &[u8],
    ) -> Result<Vec<AuthCommand>, CommandError> {
        let mut cp_hashes: Vec<(HashAlg, Vec<u8>)> = Vec::new();
        let mut auths = Vec::with_capacity(inv.sessions.len());
        for (i, slot) in inv.sessions.iter().enumerate() {
            let value = &auth_values[i];
            match slot {
                SessionSlot::Password => {
                    auths.push(AuthCommand {
                        session_handle: reserved::RS_PW,
                        nonce: Vec::new(),
                        attributes: SessionAttributes::CONTINUE_SESSION,
                        auth: value.as_bytes().to_vec(),
                    });
                }
                SessionSlot::Session(h) => {
                    let session = self.sessions.get(h).ok_or(CommandError::UnknownHandle)?;
                    let cp = Self::cached_digest(
                        &mut cp_hashes,
                        session.hash,
                        inv.code,
                        names,
                        params,
                    );
                    // Only authorizing slots mix in the object auth value.
                    let auth_value = if i < auth_needed { value.as_bytes() } else { &[] };
                    let mac = session.compute_command_auth(&cp, auth_value);
                    auths.push(AuthCommand {
                        session_handle: self.handles.resolve(*h)?.device,
                        nonce: session.nonce_caller().to_vec(),
                        attributes: session.attributes,
                        auth: mac,
                    });
                }
            }
        }
        Ok(auths)
    }

    /// cpHash = H(commandCode || name_1 .. name_n || parameters), memoized
    /// per hash algorithm across the auth area.
    fn cached_digest(
        cache: &mut Vec<(HashAlg, Vec<u8>)>,
        hash: HashAlg,
        code: CommandCode,
        names: &[Vec<u8>],
        params: &[u8],
    ) -> Vec<u8> {
        if let Some((_, d)) = cache.iter().find(|(h, _)| *h == hash) {
            return d.clone();
        }
        let mut parts: Vec<&[u8]> = Vec::with_capacity(names.len() + 2);
        let cc = code.value().to_be_bytes();
        parts.push(&cc);
        for n in names {
            parts.push(n);
        }
        parts.push(params);
        let digest = hash.digest(&parts);
        cache.push((hash, digest.clone()));
        digest
    }

    fn verify_acks(
        &self,
        inv: &Invocation,
        auth_values: &[AuthValue],
        response: &crate::core::wire::ResponseFrame,
    ) -> Result<(), CommandError> {
        let auth_needed = inv.handles.iter().filter(|h| h.needs_auth).count();
        let rc = response.rc.value().to_be_bytes();
        let cc = inv.code.value().to_be_bytes();
        for (i, (slot, ack)) in inv.sessions.iter().zip(&response.acks).enumerate() {
            let SessionSlot::Session(h) = slot else {
                // The password session acknowledges with an empty HMAC;
                // nothing to verify.
                continue;
            };
            let session = self.sessions.get(h).ok_or(CommandError::UnknownHandle)?;
            let rp = session.hash.digest(&[&rc, &cc, &response.params]);
            let auth_value = if i < auth_needed {
                auth_values[i].as_bytes()
            } else {
                &[]
            };
            if !session.verify_response_auth(&rp, &ack.nonce, ack.attributes, auth_value, &ack.hmac)
            {
                warn!(slot = i, "response authorization failed verification");
                return Err(CommandError::AuthorizationFailure { slot: i });
            }
        }
        Ok(())
    }

    /// Decrypt the first response parameter under the first session carrying
    /// the encrypt attribute. Runs after verification and nonce adoption, so
    /// the key derivation sees the fresh device nonce.
    fn decrypt_response(
        &self,
        inv: &Invocation,
        auth_values: &[AuthValue],
        params: &mut [u8],
    ) -> Result<(), CommandError> {
        if !inv.first_result_is_buffer || params.is_empty() {
            return Ok(());
        }
        for (slot, value) in inv.sessions.iter().zip(auth_values) {
            if let SessionSlot::Session(h) = slot {
                if let Some(session) = self.sessions.get(h) {
                    if session.attributes.contains(SessionAttributes::ENCRYPT) {
                        session.decrypt_response_parameter(params, value.as_bytes())?;
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Sessions without the continue attribute are gone on the device after
    /// a successful command; drop our side too.
    fn retire_one_shot_sessions(&mut self, slots: &[SessionSlot]) {
        for slot in slots {
            if let SessionSlot::Session(h) = slot {
                let retire = self
                    .sessions
                    .get(h)
                    .is_some_and(Session::is_one_shot);
                if retire {
                    self.sessions.remove(h);
                    let _ = self.handles.release(*h);
                    debug!(handle = ?h, "retired one-shot session");
                }
            }
        }
    }
}
