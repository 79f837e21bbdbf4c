//! Partitioned asynchronous execution of pull and expire tasks.

mod local;
mod task;
mod traits;
mod updater;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use local::*;
pub use task::*;
pub use traits::*;
pub use updater::*;
