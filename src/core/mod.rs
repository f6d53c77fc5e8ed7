//! Era metadata engine core
//!
//! This module implements the on-disk structures of the device-mapper era
//! target: the superblock, the B-tree/array-node walkers over the era
//! array, writeset tree and bitsets, the space-map rebuild routine, and the
//! snapshot-metadata writer.

pub mod checksum;
pub mod snapshot;
pub mod spacemap;
pub mod superblock;
pub mod tree;

use thiserror::Error;

pub use checksum::xor_key;
pub use superblock::{Superblock, SuperblockRaw};
pub use tree::LeafKind;

/// Fixed metadata block size in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Superblock magic: "era" encoded as the little-endian constant from the
/// original format.
pub const SUPERBLOCK_MAGIC: u64 = 2126579579;

/// Accepted on-disk superblock version range.
pub const SUPERBLOCK_VERSION_MIN: u32 = 1;
pub const SUPERBLOCK_VERSION_MAX: u32 = 1;

/// XOR constants folded into the CRC32C of each block kind's payload.
pub const SUPERBLOCK_CSUM_XOR: u32 = 146538381;
pub const BTREE_CSUM_XOR: u32 = 121107;
pub const ARRAY_CSUM_XOR: u32 = 595846735;
pub const INDEX_CSUM_XOR: u32 = 160478;
pub const BITMAP_CSUM_XOR: u32 = 240779;
pub const SNAPSHOT_CSUM_XOR: u32 = 18275559;
pub const SNAP_SUPERBLOCK_CSUM_XOR: u32 = 13116488;

/// Snapshot superblock magic.
pub const SNAPSHOT_MAGIC: u64 = 118135908;

/// Maximum number of bitmap-index entries held by one metadata index block.
pub const MAX_METADATA_BITMAPS: usize = 255;

/// Number of metadata blocks tracked by a single space-map bitmap block.
pub const ENTRIES_PER_BLOCK: usize = 16320;

/// Number of `era[]` slots held per snapshot-array node: `(4096-24)/4`.
pub const ERAS_PER_BLOCK: usize = (BLOCK_SIZE - 24) / 4;

/// Errors produced by the metadata engine.
///
/// This is the closed error-kind set the orchestrator and CLI rely on to
/// decide exit codes and unwind behaviour.
#[derive(Error, Debug)]
pub enum EraError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch at block {block}: expected {expected:08x}, got {actual:08x}")]
    Checksum {
        block: u64,
        expected: u32,
        actual: u32,
    },

    #[error("corrupt metadata: {0}")]
    Corrupt(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("argument error: {0}")]
    Arg(String),

    #[error("block device error: {0}")]
    BlockDevice(#[from] crate::blockdev::BlockDeviceError),
}

pub type Result<T> = std::result::Result<T, EraError>;

/// Execution context threaded explicitly through engine calls.
///
/// Replaces the process-wide `verbose`/`force` globals of the tool this
/// engine is modeled on: callers build one `EngineContext` and pass it down
/// rather than reading module-level state.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineContext {
    /// Verbosity level, incremented once per `-v`.
    pub verbose: u8,
    /// Relax destructive-write checks (`-f`).
    pub force: bool,
}

impl EngineContext {
    pub fn new(verbose: u8, force: bool) -> Self {
        Self { verbose, force }
    }
}
