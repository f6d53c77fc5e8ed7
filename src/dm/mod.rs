//! Device-mapper client and snapshot orchestrator
//!
//! Everything in this module talks to the running kernel, not to metadata
//! on disk: [`client`] is a thin trait over the handful of `dmsetup(8)`
//! verbs the engine needs, and [`orchestrator`] sequences those verbs (plus
//! calls back into [`crate::core`] and [`crate::md`]) into the multi-step
//! take-snapshot and drop-snapshot procedures.

pub mod client;
pub mod orchestrator;

pub use client::{DmClient, DmInfo, DmSetupClient, DmTarget};
pub use orchestrator::{drop_snapshot, take_snapshot, DropSnapshotRequest, TakeSnapshotRequest};
