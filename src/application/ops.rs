//! Typed operations over the command pipeline.
//!
//! Each method builds one [`Invocation`], runs it through
//! [`Dispatcher::execute`] and parses the response parameters into typed
//! results. Session bookkeeping (registration on establishment, local policy
//! digest tracking, release on flush) lives here too.

use rand::{CryptoRng, RngCore};
use tracing::debug;

use crate::core::crypto::HashAlg;
use crate::core::wire::constants::startup;
use crate::core::wire::{CommandCode, SessionAttributes, WireError, WireReader, WireWriter};
use crate::domain::handle::{HandleClass, HandleTable, LocalHandle};
use crate::domain::policy::PolicyAssertion;
use crate::domain::session::{Session, SessionKind, SymDef};
use crate::error::CommandError;
use crate::ports::{AuthSource, EmptyAuth, Transport};

use super::pipeline::{Dispatcher, HandleArg, Invocation, SessionSlot};

/// Caller nonce length used at session establishment.
const NONCE_LEN: usize = 16;

impl<T, R> Dispatcher<T, R>
where
    T: Transport,
    R: RngCore + CryptoRng,
{
    /// Bring the device out of reset. `clear` selects a full reset start
    /// over state restoration.
    ///
    /// # Errors
    /// Propagates device rejection; a device that was already started
    /// reports that through [`CommandError::DeviceRejected`].
    pub fn startup(&mut self, clear: bool) -> Result<(), CommandError> {
        let mut inv = Invocation::new(CommandCode::STARTUP);
        let mut w = WireWriter::new();
        w.write_u16(if clear { startup::SU_CLEAR } else { startup::SU_STATE });
        inv.params = w.into_bytes();
        self.execute(&inv, &EmptyAuth)?;
        Ok(())
    }

    /// Fetch `len` bytes of device randomness.
    ///
    /// # Errors
    /// Fails on any pipeline error or if the response buffer parses short.
    pub fn get_random(&mut self, len: u16) -> Result<Vec<u8>, CommandError> {
        self.get_random_with(len, &[])
    }

    /// [`Dispatcher::get_random`] under explicit session slots, e.g. an
    /// encrypt session protecting the returned bytes.
    ///
    /// # Errors
    /// Same as [`Dispatcher::get_random`].
    pub fn get_random_with(
        &mut self,
        len: u16,
        slots: &[SessionSlot],
    ) -> Result<Vec<u8>, CommandError> {
        let mut inv = Invocation::new(CommandCode::GET_RANDOM);
        inv.sessions = slots.to_vec();
        // Request side is a plain count; only the response is a buffer.
        inv.first_result_is_buffer = true;
        let mut w = WireWriter::new();
        w.write_u16(len);
        inv.params = w.into_bytes();
        let out = self.execute(&inv, &EmptyAuth)?;
        let mut r = WireReader::new(&out.params);
        let random = r.read_sized().map_err(CommandError::MalformedResponse)?;
        Ok(random.to_vec())
    }

    /// Establish an authorization session and register it locally.
    ///
    /// Both the salt key and the bind object are fixed to the null
    /// hierarchy; `bind_auth` seeds the session key (empty gives an
    /// unbound, unsalted session whose key is empty).
    ///
    /// # Errors
    /// Pipeline errors, or [`CommandError::MalformedResponse`] if the
    /// device nonce parses short.
    pub fn start_auth_session(
        &mut self,
        kind: SessionKind,
        hash: HashAlg,
        symmetric: SymDef,
        attributes: SessionAttributes,
        bind_auth: &[u8],
    ) -> Result<LocalHandle, CommandError> {
        let mut nonce_caller = vec![0u8; NONCE_LEN];
        self.rng_mut().fill_bytes(&mut nonce_caller);

        let mut inv = Invocation::new(CommandCode::START_AUTH_SESSION);
        inv.handles = vec![
            // Salt key, then bind object.
            HandleArg::plain(HandleTable::NULL_HIERARCHY),
            HandleArg::plain(HandleTable::NULL_HIERARCHY),
        ];
        inv.returns_handle = true;
        let mut w = WireWriter::new();
        w.write_sized(&nonce_caller)
            .map_err(CommandError::InvalidParameter)?
            .write_sized(&[])
            .map_err(CommandError::InvalidParameter)?
            .write_u8(kind.wire_value());
        symmetric.encode(&mut w);
        w.write_u16(hash.alg_id().value());
        inv.params = w.into_bytes();

        let out = self.execute(&inv, &EmptyAuth)?;
        let device = out.handle.ok_or(CommandError::MalformedResponse(
            WireError::Truncated { needed: 4 },
        ))?;
        let mut r = WireReader::new(&out.params);
        let nonce_device = r
            .read_sized()
            .map_err(CommandError::MalformedResponse)?
            .to_vec();

        // Session handles take their device handle value as their name.
        let local = self
            .handles
            .allocate(device, device.to_be_bytes().to_vec())?;
        let session = Session::new(
            local,
            kind,
            hash,
            symmetric,
            attributes,
            nonce_caller,
            nonce_device,
            bind_auth,
            &[],
        );
        self.register_session(session);
        debug!(device, ?kind, "session established");
        Ok(local)
    }

    /// Flush a session or loaded object from the device and drop the local
    /// handle. The local state is released even though the device forgets
    /// the object first; a failure leaves the local handle intact.
    ///
    /// # Errors
    /// Pipeline errors; the handle survives locally on failure.
    pub fn flush_context(&mut self, handle: LocalHandle) -> Result<(), CommandError> {
        let device = self.handles.resolve(handle)?.device;
        let mut inv = Invocation::new(CommandCode::FLUSH_CONTEXT);
        let mut w = WireWriter::new();
        w.write_u32(device);
        inv.params = w.into_bytes();
        self.execute(&inv, &EmptyAuth)?;
        self.remove_session(handle);
        self.handles.release(handle)?;
        Ok(())
    }

    /// Fold a template restriction into a policy session.
    ///
    /// # Errors
    /// Pipeline errors; the local digest only advances on success.
    pub fn policy_template(
        &mut self,
        session: LocalHandle,
        template_hash: &[u8],
    ) -> Result<(), CommandError> {
        let mut w = WireWriter::new();
        w.write_sized(template_hash)
            .map_err(CommandError::InvalidParameter)?;
        self.policy_command(
            session,
            CommandCode::POLICY_TEMPLATE,
            w.into_bytes(),
            &PolicyAssertion::Template {
                template_hash: template_hash.to_vec(),
            },
        )
    }

    /// Restrict a policy session to one command code.
    ///
    /// # Errors
    /// Pipeline errors; the local digest only advances on success.
    pub fn policy_command_code(
        &mut self,
        session: LocalHandle,
        code: CommandCode,
    ) -> Result<(), CommandError> {
        let mut w = WireWriter::new();
        w.write_u32(code.value());
        self.policy_command(
            session,
            CommandCode::POLICY_COMMAND_CODE,
            w.into_bytes(),
            &PolicyAssertion::CommandCode { code },
        )
    }

    /// Require the object's auth value in the session HMAC at use time.
    ///
    /// # Errors
    /// Pipeline errors; the local digest only advances on success.
    pub fn policy_auth_value(&mut self, session: LocalHandle) -> Result<(), CommandError> {
        self.policy_command(
            session,
            CommandCode::POLICY_AUTH_VALUE,
            Vec::new(),
            &PolicyAssertion::AuthValue,
        )
    }

    /// Require the object's auth value presented in cleartext at use time.
    /// Extends the digest identically to [`Dispatcher::policy_auth_value`].
    ///
    /// # Errors
    /// Pipeline errors; the local digest only advances on success.
    pub fn policy_password(&mut self, session: LocalHandle) -> Result<(), CommandError> {
        self.policy_command(
            session,
            CommandCode::POLICY_PASSWORD,
            Vec::new(),
            &PolicyAssertion::Password,
        )
    }

    /// Fold a live authorization by `auth_handle` into the session; the
    /// authorizing object's password travels in a cleartext slot.
    ///
    /// # Errors
    /// Pipeline errors, including secret resolution for `auth_handle`.
    pub fn policy_secret(
        &mut self,
        session: LocalHandle,
        auth_handle: LocalHandle,
        policy_ref: &[u8],
        auth: &dyn AuthSource,
    ) -> Result<(), CommandError> {
        let object_name = self.handles.resolve(auth_handle)?.name.to_vec();
        let mut inv = Invocation::new(CommandCode::POLICY_SECRET);
        inv.handles = vec![HandleArg::authorized(auth_handle), HandleArg::plain(session)];
        inv.sessions = vec![SessionSlot::Password];
        let mut w = WireWriter::new();
        w.write_sized(&[])
            .map_err(CommandError::InvalidParameter)?
            .write_sized(&[])
            .map_err(CommandError::InvalidParameter)?
            .write_sized(policy_ref)
            .map_err(CommandError::InvalidParameter)?
            .write_i32(0);
        inv.params = w.into_bytes();
        self.execute(&inv, auth)?;
        self.extend_local_policy(
            session,
            &PolicyAssertion::Secret {
                object_name,
                policy_ref: policy_ref.to_vec(),
            },
        );
        Ok(())
    }

    /// Read back the session's accumulated policy digest.
    ///
    /// # Errors
    /// Pipeline errors, or a short response buffer.
    pub fn policy_get_digest(&mut self, session: LocalHandle) -> Result<Vec<u8>, CommandError> {
        let mut inv = Invocation::new(CommandCode::POLICY_GET_DIGEST);
        inv.handles = vec![HandleArg::plain(session)];
        inv.first_result_is_buffer = true;
        let out = self.execute(&inv, &EmptyAuth)?;
        let mut r = WireReader::new(&out.params);
        let digest = r.read_sized().map_err(CommandError::MalformedResponse)?;
        Ok(digest.to_vec())
    }

    /// Read an object's public area and name.
    ///
    /// # Errors
    /// Pipeline errors, or a short response buffer.
    pub fn read_public(
        &mut self,
        object: LocalHandle,
    ) -> Result<(Vec<u8>, Vec<u8>), CommandError> {
        let mut inv = Invocation::new(CommandCode::READ_PUBLIC);
        inv.handles = vec![HandleArg::plain(object)];
        inv.first_result_is_buffer = true;
        let out = self.execute(&inv, &EmptyAuth)?;
        let mut r = WireReader::new(&out.params);
        let public = r
            .read_sized()
            .map_err(CommandError::MalformedResponse)?
            .to_vec();
        let name = r
            .read_sized()
            .map_err(CommandError::MalformedResponse)?
            .to_vec();
        Ok((public, name))
    }

    /// Adopt a device handle the caller obtained out of band: allocate a
    /// local handle, then bind its name from a read-public round trip.
    ///
    /// # Errors
    /// Pipeline or handle-table errors; the local handle is released again
    /// if the name lookup fails.
    pub fn bind_object(&mut self, device: u32) -> Result<LocalHandle, CommandError> {
        let local = self.handles.allocate(device, Vec::new())?;
        let name = match self.read_public(local) {
            Ok((_, name)) => name,
            Err(e) => {
                let _ = self.handles.release(local);
                return Err(e);
            }
        };
        self.handles.bind_name(local, name)?;
        Ok(local)
    }

    /// Enable or disable the device clear operation.
    ///
    /// # Errors
    /// Pipeline errors, including authorization failure on `auth_handle`.
    pub fn clear_control(
        &mut self,
        auth_handle: LocalHandle,
        slot: SessionSlot,
        disable: bool,
        auth: &dyn AuthSource,
    ) -> Result<(), CommandError> {
        let mut inv = Invocation::new(CommandCode::CLEAR_CONTROL);
        inv.handles = vec![HandleArg::authorized(auth_handle)];
        inv.sessions = vec![slot];
        let mut w = WireWriter::new();
        w.write_u8(u8::from(disable));
        inv.params = w.into_bytes();
        self.execute(&inv, auth)?;
        Ok(())
    }

    /// Persist a transient object at `persistent_device`, or evict the
    /// persistent object named by `object`.
    ///
    /// Persisting repoints `object` at the persistent device handle (the
    /// name is unchanged, so the local handle keeps tracking the same
    /// object); evicting releases the local handle once the device confirms.
    ///
    /// # Errors
    /// Pipeline errors, including authorization failure on `auth_handle`.
    pub fn evict_control(
        &mut self,
        auth_handle: LocalHandle,
        slot: SessionSlot,
        object: LocalHandle,
        persistent_device: u32,
        auth: &dyn AuthSource,
    ) -> Result<(), CommandError> {
        let class = self.handles.resolve(object)?.class;

        let mut inv = Invocation::new(CommandCode::EVICT_CONTROL);
        inv.handles = vec![HandleArg::authorized(auth_handle), HandleArg::plain(object)];
        inv.sessions = vec![slot];
        let mut w = WireWriter::new();
        w.write_u32(persistent_device);
        inv.params = w.into_bytes();
        self.execute(&inv, auth)?;

        match class {
            HandleClass::Transient => {
                self.handles.rebind(object, persistent_device)?;
            }
            _ => {
                self.handles.release(object)?;
            }
        }
        Ok(())
    }

    /// Run a parameterized policy command against `session` and advance the
    /// local digest mirror on success.
    fn policy_command(
        &mut self,
        session: LocalHandle,
        code: CommandCode,
        params: Vec<u8>,
        assertion: &PolicyAssertion,
    ) -> Result<(), CommandError> {
        let mut inv = Invocation::new(code);
        inv.handles = vec![HandleArg::plain(session)];
        inv.params = params;
        self.execute(&inv, &EmptyAuth)?;
        self.extend_local_policy(session, assertion);
        Ok(())
    }

    fn extend_local_policy(&mut self, session: LocalHandle, assertion: &PolicyAssertion) {
        if let Some(s) = self.session_mut(session) {
            s.policy_digest = assertion.extend(s.hash, &s.policy_digest);
            if matches!(
                assertion,
                PolicyAssertion::AuthValue | PolicyAssertion::Password
            ) {
                s.needs_auth_value = true;
            }
        }
    }
}
