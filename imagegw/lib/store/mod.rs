//! Persistent image and pull records.

mod db;
mod memory;
mod models;
mod repository;
mod sqlite;
mod status;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use db::*;
pub use memory::*;
pub use models::*;
pub use repository::*;
pub use sqlite::*;
pub use status::*;
