//! Era superblock parsing and validation
//!
//! Block 0 of the metadata device. See the data model notes in this
//! crate's design ledger for the exact field layout; the short version is
//! "one CRC32C-checksummed 224-byte packed struct, the rest of the block
//! zero-padded".

use uuid::Uuid;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use super::{
    checksum, spacemap::SpaceMapRoot, EraError, Result, BLOCK_SIZE, SUPERBLOCK_CSUM_XOR,
    SUPERBLOCK_MAGIC, SUPERBLOCK_VERSION_MAX, SUPERBLOCK_VERSION_MIN,
};
use crate::blockdev::BlockDevice;

/// On-disk size of the superblock structure proper (the rest of the block
/// is reserved/zero).
pub const SUPERBLOCK_RAW_SIZE: usize = 224;

/// On-disk, little-endian, packed layout of the era superblock.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct SuperblockRaw {
    pub csum: u32,
    pub flags: u32,
    pub blocknr: u64,
    pub uuid: [u8; 16],
    pub magic: u64,
    pub version: u32,
    pub metadata_space_map_root: [u8; 128],
    pub data_block_size: u32,
    pub metadata_block_size: u32,
    pub nr_blocks: u32,
    pub current_era: u32,
    pub current_writeset_nr_bits: u32,
    pub current_writeset_root: u64,
    pub writeset_tree_root: u64,
    pub era_array_root: u64,
    pub metadata_snap: u64,
}

/// A parsed, validated superblock plus convenient accessors.
#[derive(Debug, Clone)]
pub struct Superblock {
    raw: SuperblockRaw,
}

impl Superblock {
    /// Reads and validates the superblock from block 0 of `device`.
    pub fn read(device: &dyn BlockDevice) -> Result<Self> {
        let mut buf = [0u8; BLOCK_SIZE];
        device.read_at(0, &mut buf).map_err(EraError::BlockDevice)?;
        Self::parse(&buf)
    }

    /// Parses and validates a superblock from a full 4096-byte block.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < BLOCK_SIZE {
            return Err(EraError::Corrupt(format!(
                "superblock block too small: {} bytes",
                data.len()
            )));
        }

        checksum::verify(data, SUPERBLOCK_CSUM_XOR, 0)?;

        let raw = SuperblockRaw::read_from_bytes(&data[..SUPERBLOCK_RAW_SIZE])
            .map_err(|_| EraError::Corrupt("failed to parse superblock".to_string()))?;

        let sb = Self { raw };
        sb.validate()?;
        Ok(sb)
    }

    fn validate(&self) -> Result<()> {
        if { self.raw.blocknr } != 0 {
            return Err(EraError::Corrupt(format!(
                "superblock self block-number {} != 0",
                { self.raw.blocknr }
            )));
        }
        if { self.raw.magic } != SUPERBLOCK_MAGIC {
            return Err(EraError::Corrupt(format!(
                "bad superblock magic {:#x}",
                { self.raw.magic }
            )));
        }
        let version = self.raw.version;
        if !(SUPERBLOCK_VERSION_MIN..=SUPERBLOCK_VERSION_MAX).contains(&version) {
            return Err(EraError::Unsupported(format!(
                "unsupported superblock version {}",
                version
            )));
        }
        if self.raw.metadata_block_size != 8 {
            return Err(EraError::Unsupported(format!(
                "metadata_block_size {} (sectors) != 8",
                { self.raw.metadata_block_size }
            )));
        }
        Ok(())
    }

    pub fn magic(&self) -> u64 {
        self.raw.magic
    }

    pub fn uuid(&self) -> Uuid {
        Uuid::from_bytes(self.raw.uuid)
    }

    pub fn flags(&self) -> u32 {
        self.raw.flags
    }

    pub fn data_block_size(&self) -> u32 {
        self.raw.data_block_size
    }

    pub fn metadata_block_size(&self) -> u32 {
        self.raw.metadata_block_size
    }

    pub fn nr_blocks(&self) -> u32 {
        self.raw.nr_blocks
    }

    pub fn current_era(&self) -> u32 {
        self.raw.current_era
    }

    /// `(nr_bits, root)` of the in-flight writeset, or `None` if absent
    /// (`root == 0`).
    pub fn current_writeset(&self) -> Option<(u32, u64)> {
        let root = self.raw.current_writeset_root;
        if root == 0 {
            None
        } else {
            Some((self.raw.current_writeset_nr_bits, root))
        }
    }

    pub fn writeset_tree_root(&self) -> u64 {
        self.raw.writeset_tree_root
    }

    pub fn era_array_root(&self) -> u64 {
        self.raw.era_array_root
    }

    /// Block number of a frozen superblock copy, or `None` if none is held.
    pub fn metadata_snap(&self) -> Option<u64> {
        let snap = self.raw.metadata_snap;
        (snap != 0).then_some(snap)
    }

    pub fn space_map_root(&self) -> Result<SpaceMapRoot> {
        SpaceMapRoot::parse(&self.raw.metadata_space_map_root)
    }

    /// Serialises this superblock to a fresh 4096-byte block, recomputing
    /// the checksum.
    pub fn to_block(&self) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        encode_raw(&self.raw, &mut block);
        checksum::stamp(&mut block, SUPERBLOCK_CSUM_XOR);
        block
    }

    /// Builds a fresh superblock for `create`, with empty trees and an
    /// all-zero space-map root (populated by the first `open`/rebuild).
    pub fn new_empty(
        uuid: Uuid,
        data_block_size: u32,
        nr_blocks: u32,
    ) -> Self {
        let raw = SuperblockRaw {
            csum: 0,
            flags: 0,
            blocknr: 0,
            uuid: *uuid.as_bytes(),
            magic: SUPERBLOCK_MAGIC,
            version: 1,
            metadata_space_map_root: [0u8; 128],
            data_block_size,
            metadata_block_size: 8,
            nr_blocks,
            current_era: 0,
            current_writeset_nr_bits: 0,
            current_writeset_root: 0,
            writeset_tree_root: 0,
            era_array_root: 0,
            metadata_snap: 0,
        };
        Self { raw }
    }

    /// Returns a copy of this superblock with its space-map root and
    /// `metadata_snap` fields replaced, as step 10 of the rebuild does.
    pub fn with_rebuilt_space_map(&self, root: &SpaceMapRoot) -> Self {
        let mut raw = self.raw;
        raw.metadata_space_map_root = root.to_bytes();
        raw.metadata_snap = 0;
        Self { raw }
    }
}

fn encode_raw(raw: &SuperblockRaw, block: &mut [u8; BLOCK_SIZE]) {
    block[4..8].copy_from_slice(&raw.flags.to_le_bytes());
    block[8..16].copy_from_slice(&raw.blocknr.to_le_bytes());
    block[16..32].copy_from_slice(&raw.uuid);
    block[32..40].copy_from_slice(&raw.magic.to_le_bytes());
    block[40..44].copy_from_slice(&raw.version.to_le_bytes());
    block[44..172].copy_from_slice(&raw.metadata_space_map_root);
    block[172..176].copy_from_slice(&raw.data_block_size.to_le_bytes());
    block[176..180].copy_from_slice(&raw.metadata_block_size.to_le_bytes());
    block[180..184].copy_from_slice(&raw.nr_blocks.to_le_bytes());
    block[184..188].copy_from_slice(&raw.current_era.to_le_bytes());
    block[188..192].copy_from_slice(&raw.current_writeset_nr_bits.to_le_bytes());
    block[192..200].copy_from_slice(&raw.current_writeset_root.to_le_bytes());
    block[200..208].copy_from_slice(&raw.writeset_tree_root.to_le_bytes());
    block[208..216].copy_from_slice(&raw.era_array_root.to_le_bytes());
    block[216..224].copy_from_slice(&raw.metadata_snap.to_le_bytes());
    // block[0..4] (csum) is left for the caller to stamp.
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Superblock {
        Superblock::new_empty(Uuid::nil(), 128, 1000)
    }

    #[test]
    fn test_roundtrip_through_block() {
        let sb = sample();
        let block = sb.to_block();
        let parsed = Superblock::parse(&block).unwrap();
        assert_eq!(parsed.nr_blocks(), 1000);
        assert_eq!(parsed.data_block_size(), 128);
        assert_eq!(parsed.metadata_block_size(), 8);
        assert_eq!(parsed.current_era(), 0);
        assert!(parsed.metadata_snap().is_none());
        assert!(parsed.current_writeset().is_none());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let sb = sample();
        let mut block = sb.to_block();
        block[32] ^= 0xff;
        checksum::stamp(&mut block, SUPERBLOCK_CSUM_XOR);
        assert!(matches!(
            Superblock::parse(&block),
            Err(EraError::Corrupt(_))
        ));
    }

    #[test]
    fn test_checksum_mismatch_rejected() {
        let sb = sample();
        let mut block = sb.to_block();
        block[0] ^= 0xff;
        assert!(matches!(
            Superblock::parse(&block),
            Err(EraError::Checksum { .. })
        ));
    }

    #[test]
    fn test_bad_metadata_block_size_rejected() {
        let sb = sample();
        let mut block = sb.to_block();
        block[176..180].copy_from_slice(&4u32.to_le_bytes());
        checksum::stamp(&mut block, SUPERBLOCK_CSUM_XOR);
        assert!(matches!(
            Superblock::parse(&block),
            Err(EraError::Unsupported(_))
        ));
    }

    #[test]
    fn test_nonzero_self_blocknr_rejected() {
        let sb = sample();
        let mut block = sb.to_block();
        block[8..16].copy_from_slice(&1u64.to_le_bytes());
        checksum::stamp(&mut block, SUPERBLOCK_CSUM_XOR);
        assert!(matches!(
            Superblock::parse(&block),
            Err(EraError::Corrupt(_))
        ));
    }
}
