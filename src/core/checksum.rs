//! Checksum primitive
//!
//! Every on-disk block kind is protected by a CRC32C of its payload XORed
//! with a block-type constant. Unlike node-kind-specific checksum skip
//! offsets, every era block covers "everything after the leading 4-byte
//! checksum field" uniformly, so this module exposes one function
//! parameterised by the xor key rather than one function per block kind.

use super::{EraError, Result};

/// Computes the checksum of `data`, folding in `xor_key`.
///
/// `data` must include the leading 4-byte checksum field; it is skipped
/// automatically.
#[inline]
pub fn compute(data: &[u8], xor_key: u32) -> u32 {
    if data.len() <= 4 {
        return 0 ^ xor_key;
    }
    crc32c::crc32c(&data[4..]) ^ xor_key
}

/// Reads the stored checksum out of the leading 4 bytes of `data`.
#[inline]
pub fn stored(data: &[u8]) -> Result<u32> {
    if data.len() < 4 {
        return Err(EraError::Corrupt("block too small for checksum".into()));
    }
    Ok(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
}

/// Verifies `data`'s stored checksum against its recomputed value.
pub fn verify(data: &[u8], xor_key: u32, block: u64) -> Result<()> {
    let expected = stored(data)?;
    let actual = compute(data, xor_key);
    if expected != actual {
        return Err(EraError::Checksum {
            block,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Computes and writes the checksum into the leading 4 bytes of `data`.
pub fn stamp(data: &mut [u8], xor_key: u32) {
    let csum = compute(data, xor_key);
    data[0..4].copy_from_slice(&csum.to_le_bytes());
}

/// Convenience re-export of the XOR-key constants, grouped so callers can
/// write `checksum::xor_key::BTREE` instead of importing each constant.
pub mod xor_key {
    pub use super::super::{
        ARRAY_CSUM_XOR as ARRAY, BITMAP_CSUM_XOR as BITMAP, BTREE_CSUM_XOR as BTREE,
        INDEX_CSUM_XOR as INDEX, SNAPSHOT_CSUM_XOR as SNAPSHOT,
        SNAP_SUPERBLOCK_CSUM_XOR as SNAP_SUPERBLOCK, SUPERBLOCK_CSUM_XOR as SUPERBLOCK,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_and_verify_roundtrip() {
        let mut data = vec![0u8; 64];
        data[4..20].copy_from_slice(b"payload..........."[..16].as_ref());
        stamp(&mut data, xor_key::BTREE);
        assert!(verify(&data, xor_key::BTREE, 0).is_ok());
    }

    #[test]
    fn test_verify_mismatch() {
        let mut data = vec![0u8; 64];
        stamp(&mut data, xor_key::ARRAY);
        data[10] ^= 0xff;
        let err = verify(&data, xor_key::ARRAY, 5).unwrap_err();
        match err {
            EraError::Checksum { block, .. } => assert_eq!(block, 5),
            _ => panic!("expected Checksum error"),
        }
    }

    #[test]
    fn test_compute_tiny_block() {
        assert_eq!(compute(&[1, 2, 3], xor_key::SUPERBLOCK), xor_key::SUPERBLOCK);
    }

    #[test]
    fn test_stored_too_small() {
        assert!(stored(&[1, 2]).is_err());
    }

    #[test]
    fn test_different_xor_keys_differ() {
        let mut data = vec![0u8; 32];
        data[8] = 0xab;
        let a = compute(&data, xor_key::BTREE);
        let b = compute(&data, xor_key::ARRAY);
        assert_ne!(a, b);
    }
}
