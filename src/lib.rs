//! erasetup
//!
//! A userspace control utility for the Linux device-mapper `era` target:
//! parses and validates the on-disk metadata (superblock, B-trees, space
//! map), rebuilds the space map on `open`, and drives the multi-step
//! device-mapper sequences behind `takesnap`/`dropsnap`.
//!
//! # Architecture
//!
//! - [`blockdev`]: block device abstraction over image files and real
//!   Linux block special files
//! - [`core`]: the metadata engine — superblock, tree walkers, space-map
//!   rebuild, snapshot-metadata writer, the closed error-kind set
//! - [`md`]: checksummed, optionally cached block I/O over a `BlockDevice`
//! - [`dm`]: the `dmsetup(8)` client and the take-snapshot/drop-snapshot
//!   orchestrators built on top of it
//! - [`engine`]: the `create`/`open`/`close`/`status`/`dumpsb` command
//!   handlers

pub mod blockdev;
pub mod core;
pub mod dm;
pub mod engine;
pub mod md;

pub use core::{EngineContext, EraError, Result, Superblock};
pub use dm::{DmClient, DmSetupClient};
pub use md::Md;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
