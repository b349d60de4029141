//! Enhanced command layer for a TPM 2.0-class security coprocessor.
//!
//! The crate turns typed operations into authorized wire commands and
//! verified responses:
//!
//! * `core::wire` encodes and decodes the big-endian command frames and owns
//!   the protocol constants.
//! * `core::crypto` holds the hash, KDF and parameter-encryption primitives.
//! * `domain` models sessions, the generation-tagged handle table and policy
//!   digest accumulation.
//! * `application` runs the command pipeline (authorization, dispatch,
//!   bounded retry, response verification) and exposes the typed operations.
//! * `ports` defines the boundary traits: a byte transport to the device and
//!   callback-based secret resolution.
//!
//! `test_support` carries the transport doubles and the in-process device
//! emulator used by the crate's own tests.

pub mod application;
pub mod core;
pub mod domain;
pub mod error;
pub mod ports;
pub mod test_support;
