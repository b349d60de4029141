//! Shared fixtures for unit and integration tests: a scripted transport that
//! replays canned responses, response-frame builders, and a small in-process
//! device emulator for end-to-end pipeline tests.

pub mod support;

pub use support::{
    ok_response, ok_response_with_handle, rc_only_response, FakeDevice, ScriptedTransport,
};
