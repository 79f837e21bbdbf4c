//! `imagegw` pulls container images from Docker registries and stages them on HPC systems.
//!
//! # Overview
//!
//! A pull request for a tag on a system goes through a persistent state machine:
//!
//! - The manifest is fetched from a Docker Registry V2 and its digest verified
//! - The layer history is turned into a single linear chain
//! - Layers are downloaded, merged with whiteout handling and expanded into a directory tree
//! - The tree is converted into a flat image file, e.g. squashfs
//! - The image and a metadata file are transferred onto the target system
//!
//! Every pull is a record in an [`ImageRepository`](store::ImageRepository). Workers report
//! progress through heartbeats, and [`ImageManager`](manager::ImageManager) folds their results
//! back into the records, keeping each tag on exactly one image per system.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use imagegw::{
//!     config::GatewayConfig,
//!     manager::{AclSpec, ImageManager, ImageSpec},
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GatewayConfig::load("/etc/imagegw/imagegw.toml").await?;
//!     let manager = ImageManager::open(config).await?;
//!
//!     let session = manager.new_session("good:alice:users", "cluster").await?;
//!     let spec = ImageSpec::docker("cluster", "ubuntu:latest");
//!     let record = manager.pull(&session, &spec, &AclSpec::default()).await?;
//!     println!("{} is {}", record.pulltag, record.status);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`registry`] - Docker Registry V2 client
//! - [`layers`] - Layer graph and whiteout-aware extraction
//! - [`store`] - Image records and lookup metrics
//! - [`dispatch`] - Task submission and worker pools
//! - [`worker`] - The pull pipeline run by workers
//! - [`backends`] - Authentication, conversion and transfer collaborators
//! - [`manager`] - The pull state machine

#![warn(missing_docs)]

mod error;
mod log;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod backends;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod layers;
pub mod manager;
pub mod registry;
pub mod store;
pub mod utils;
pub mod worker;

pub use error::*;
pub use log::*;
