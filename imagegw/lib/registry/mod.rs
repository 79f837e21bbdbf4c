//! Docker Registry V2 client.

mod auth;
mod docker;
mod manifest;
mod traits;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use auth::*;
pub use docker::*;
pub use manifest::*;
pub use traits::*;

#[cfg(test)]
pub(crate) use manifest::helper as manifest_helper;
