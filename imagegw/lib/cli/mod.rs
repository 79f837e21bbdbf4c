//! Command line interface of the `imagegw` binary.

mod args;
mod handlers;
mod styles;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use args::*;
pub use handlers::*;
pub use styles::*;
