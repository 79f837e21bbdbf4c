//! Configuration types for the image gateway.

mod defaults;
mod expiration;
mod gateway;
mod platform;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use expiration::*;
pub use gateway::*;
pub use platform::*;
