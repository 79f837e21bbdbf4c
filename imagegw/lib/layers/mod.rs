//! Layer ancestry reconstruction and union filesystem extraction.

mod extract;
mod graph;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use extract::*;
pub use graph::*;
