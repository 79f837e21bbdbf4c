//! The pull pipeline executed by dispatcher workers.

mod image;
mod metadata;
mod reference;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use image::*;
pub use metadata::*;
pub use reference::*;
