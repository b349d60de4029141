//! Cryptographic primitives behind session authorization: hash-agile digest
//! and HMAC dispatch, the device's counter-mode key-derivation function, and
//! the CFB keystream used for parameter encryption.

pub mod cipher;
pub mod hash;
pub mod kdf;

pub use hash::HashAlg;
pub use kdf::kdfa;
