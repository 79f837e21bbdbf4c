//! The pull state machine.
//!
//! [`ImageManager`] decides when an image has to be pulled, dispatches the work, folds task
//! results back into the record store and keeps every tag on exactly one image per system.

mod admin;
mod machine;
mod policy;
mod pull;
mod session;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use machine::ImageManager;
pub use policy::*;
pub use session::*;

use machine::{TaskKind, TrackedTask};

#[cfg(test)]
pub(crate) use machine::helper;
