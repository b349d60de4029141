//! End-to-end policy accumulation against the in-process device emulator.

use rand::rngs::StdRng;
use rand::SeedableRng;

use secmod::application::Dispatcher;
use secmod::core::crypto::HashAlg;
use secmod::core::wire::SessionAttributes;
use secmod::domain::policy::{compute_digest, PolicyAssertion};
use secmod::domain::session::{SessionKind, SymDef};
use secmod::error::CommandError;
use secmod::test_support::FakeDevice;

const TEMPLATE_DIGEST_HEX: &str =
    "70cbc990653d8b40fb71e677dfe5c8cb8bf5f4effd3dedad4a3ad6c332c83561";

fn dispatcher() -> Dispatcher<FakeDevice, StdRng> {
    Dispatcher::new(FakeDevice::new(), StdRng::seed_from_u64(7))
}

fn template_hash() -> Vec<u8> {
    (1u8..=32).collect()
}

#[test]
fn trial_session_accumulates_known_template_digest() {
    let mut d = dispatcher();
    let session = d
        .start_auth_session(
            SessionKind::Trial,
            HashAlg::Sha256,
            SymDef::Aes128Cfb,
            SessionAttributes::CONTINUE_SESSION,
            &[],
        )
        .unwrap();

    d.policy_template(session, &template_hash()).unwrap();

    let digest = d.policy_get_digest(session).unwrap();
    assert_eq!(hex::encode(&digest), TEMPLATE_DIGEST_HEX);

    // The local mirror tracked the same chain.
    assert_eq!(d.session(session).unwrap().policy_digest, digest);

    d.flush_context(session).unwrap();
}

#[test]
fn offline_computation_matches_trial_session() {
    let offline = compute_digest(
        HashAlg::Sha256,
        &[PolicyAssertion::Template {
            template_hash: template_hash(),
        }],
    );
    assert_eq!(hex::encode(offline), TEMPLATE_DIGEST_HEX);
}

#[test]
fn auth_value_assertion_extends_digest_and_marks_session() {
    let mut d = dispatcher();
    let session = d
        .start_auth_session(
            SessionKind::Trial,
            HashAlg::Sha256,
            SymDef::Null,
            SessionAttributes::CONTINUE_SESSION,
            &[],
        )
        .unwrap();

    d.policy_auth_value(session).unwrap();
    let digest = d.policy_get_digest(session).unwrap();
    let offline = compute_digest(HashAlg::Sha256, &[PolicyAssertion::AuthValue]);
    assert_eq!(digest, offline);
    assert!(d.session(session).unwrap().needs_auth_value);
}

#[test]
fn flushed_session_handle_goes_stale() {
    let mut d = dispatcher();
    let session = d
        .start_auth_session(
            SessionKind::Trial,
            HashAlg::Sha256,
            SymDef::Null,
            SessionAttributes::CONTINUE_SESSION,
            &[],
        )
        .unwrap();
    d.flush_context(session).unwrap();

    let err = d.policy_template(session, &template_hash()).unwrap_err();
    assert!(matches!(err, CommandError::UnknownHandle));
}
