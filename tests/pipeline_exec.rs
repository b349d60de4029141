//! Pipeline behavior under transient busy codes, missing authorization and
//! authorized sessions, using scripted transports and the device emulator.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;

use secmod::application::{
    Dispatcher, HandleArg, Invocation, RetryPolicy, SessionSlot,
};
use secmod::core::crypto::HashAlg;
use secmod::core::wire::{CommandCode, ResponseCode, SessionAttributes};
use secmod::domain::handle::{HandleTable, LocalHandle};
use secmod::domain::session::{SessionKind, SymDef};
use secmod::error::CommandError;
use secmod::ports::{AuthValue, EmptyAuth, SecretError};
use secmod::test_support::{ok_response, rc_only_response, FakeDevice, ScriptedTransport};

fn no_backoff() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    }
}

fn rng() -> StdRng {
    StdRng::seed_from_u64(42)
}

#[test]
fn always_busy_device_exhausts_the_retry_budget() {
    let busy = rc_only_response(ResponseCode::RETRY.value());
    let transport = ScriptedTransport::with_responses(vec![busy; 8]);
    let mut d = Dispatcher::new(transport, rng()).with_retry(no_backoff());

    let err = d.get_random(8).unwrap_err();
    match err {
        CommandError::TransientDeviceBusy { attempts, .. } => assert_eq!(attempts, 5),
        other => panic!("unexpected error: {other:?}"),
    }
    // Exactly the budget, never more.
    assert_eq!(d.transport().sent.len(), 5);
}

#[test]
fn transient_codes_retry_then_succeed() {
    let mut random = Vec::new();
    random.extend_from_slice(&[0x00, 0x04]); // 2B size prefix
    random.extend_from_slice(&[0xAA; 4]);
    let transport = ScriptedTransport::with_responses(vec![
        rc_only_response(ResponseCode::YIELDED.value()),
        rc_only_response(ResponseCode::TESTING.value()),
        ok_response(&random),
    ]);
    let mut d = Dispatcher::new(transport, rng()).with_retry(no_backoff());

    let bytes = d.get_random(4).unwrap();
    assert_eq!(bytes, vec![0xAA; 4]);
    assert_eq!(d.transport().sent.len(), 3);
}

#[test]
fn non_transient_rejection_does_not_retry() {
    let transport =
        ScriptedTransport::with_responses(vec![rc_only_response(0x0084)]);
    let mut d = Dispatcher::new(transport, rng()).with_retry(no_backoff());

    let err = d.get_random(4).unwrap_err();
    assert!(matches!(err, CommandError::DeviceRejected { .. }));
    assert_eq!(d.transport().sent.len(), 1);
}

#[test]
fn missing_authorization_fails_before_any_bytes_are_sent() {
    let mut d = Dispatcher::new(ScriptedTransport::new(), rng());

    let mut inv = Invocation::new(CommandCode::CLEAR_CONTROL);
    inv.handles = vec![HandleArg::authorized(HandleTable::LOCKOUT)];
    inv.params = vec![0x01];
    // No session slot covers the authorized handle.
    let err = d.execute(&inv, &EmptyAuth).unwrap_err();
    assert!(matches!(err, CommandError::MissingAuthorization { slot: 0 }));
    assert!(d.transport().sent.is_empty());
}

#[test]
fn password_slot_authorizes_the_auth_requiring_handle_not_the_leading_one() {
    // The handle area can put plain handles before the authorized one;
    // the session slot must still pair with the handle that needs auth.
    let transport = ScriptedTransport::with_responses(vec![rc_only_response(0x0084)]);
    let mut d = Dispatcher::new(transport, rng());
    let bystander = d.handles.allocate(0x8000_0001, vec![0x0A; 4]).unwrap();
    let secured = d.handles.allocate(0x8000_0002, vec![0x0B; 4]).unwrap();

    let source = move |object: LocalHandle| -> Result<AuthValue, SecretError> {
        if object == secured {
            Ok(AuthValue::from(&b"object-secret"[..]))
        } else {
            Ok(AuthValue::from(&b"bystander-secret"[..]))
        }
    };

    let mut inv = Invocation::new(CommandCode::POLICY_SECRET);
    inv.handles = vec![HandleArg::plain(bystander), HandleArg::authorized(secured)];
    inv.sessions = vec![SessionSlot::Password];
    // The device's verdict is irrelevant; only the request bytes matter.
    let _ = d.execute(&inv, &source);

    let sent = &d.transport().sent[0];
    let carries = |needle: &[u8]| sent.windows(needle.len()).any(|w| w == needle);
    assert!(carries(b"object-secret"));
    assert!(!carries(b"bystander-secret"));
}

#[test]
fn stale_handle_fails_before_any_bytes_are_sent() {
    let mut d = Dispatcher::new(ScriptedTransport::new(), rng());
    let h = d.handles.allocate(0x8000_0001, vec![0x01; 34]).unwrap();
    d.handles.release(h).unwrap();

    let mut inv = Invocation::new(CommandCode::READ_PUBLIC);
    inv.handles = vec![HandleArg::plain(h)];
    let err = d.execute(&inv, &EmptyAuth).unwrap_err();
    assert!(matches!(err, CommandError::UnknownHandle));
    assert!(d.transport().sent.is_empty());
}

#[test]
fn hmac_session_authorizes_repeated_commands_with_rolling_nonces() {
    let mut d = Dispatcher::new(FakeDevice::new(), rng());
    let session = d
        .start_auth_session(
            SessionKind::Hmac,
            HashAlg::Sha256,
            SymDef::Null,
            SessionAttributes::CONTINUE_SESSION,
            &[],
        )
        .unwrap();

    // The emulator verifies the command HMAC on every attempt, so repeated
    // success proves the nonce pair rolls consistently on both sides.
    let first = d
        .get_random_with(16, &[SessionSlot::Session(session)])
        .unwrap();
    assert_eq!(first.len(), 16);
    let second = d
        .get_random_with(16, &[SessionSlot::Session(session)])
        .unwrap();
    assert_eq!(second.len(), 16);

    d.flush_context(session).unwrap();
}

#[test]
fn encrypt_session_protects_and_recovers_the_random_output() {
    let mut d = Dispatcher::new(FakeDevice::new(), rng());
    let session = d
        .start_auth_session(
            SessionKind::Hmac,
            HashAlg::Sha256,
            SymDef::Aes128Cfb,
            SessionAttributes::CONTINUE_SESSION | SessionAttributes::ENCRYPT,
            &[],
        )
        .unwrap();

    // The emulator returns the buffer CFB-encrypted under the fresh nonce
    // pair; only a correctly gated and keyed decryption recovers it.
    let out = d
        .get_random_with(16, &[SessionSlot::Session(session)])
        .unwrap();
    assert_eq!(out, vec![0xA5; 16]);

    d.flush_context(session).unwrap();
}

#[test]
fn one_shot_session_is_retired_after_use() {
    let mut d = Dispatcher::new(FakeDevice::new(), rng());
    let session = d
        .start_auth_session(
            SessionKind::Hmac,
            HashAlg::Sha256,
            SymDef::Null,
            SessionAttributes::from_u8(0),
            &[],
        )
        .unwrap();

    d.get_random_with(16, &[SessionSlot::Session(session)])
        .unwrap();
    // The session was dropped locally along with its handle.
    assert!(d.session(session).is_none());
    assert!(matches!(
        d.flush_context(session).unwrap_err(),
        CommandError::UnknownHandle
    ));
}

#[test]
fn startup_roundtrip_against_emulator() {
    let mut d = Dispatcher::new(FakeDevice::new(), rng());
    d.startup(true).unwrap();
}
