//! Narrow interfaces to authentication, image conversion and file transfer.

mod authenticator;
mod converter;
mod transfer;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use authenticator::*;
pub use converter::*;
pub use transfer::*;
