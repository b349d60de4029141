//! Domain state of the command layer: virtualized handles, authorization
//! sessions and policy-digest math.

pub mod handle;
pub mod policy;
pub mod session;

pub use handle::{HandleClass, HandleError, HandleTable, LocalHandle};
pub use session::{Session, SessionKind, SymDef};
