//! Infrastructure shared by the domain and application layers: the byte-exact
//! wire codec and the cryptographic primitives behind session authorization.

pub mod crypto;
pub mod wire;
