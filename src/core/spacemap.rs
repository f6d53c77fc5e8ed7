//! Space-map encoder/decoder and rebuild
//!
//! The space-map is a reference-count index over metadata blocks: a
//! top-level index node naming up to [`MAX_METADATA_BITMAPS`] bitmap
//! blocks, each bitmap packing [`ENTRIES_PER_BLOCK`] 2-bit refcounts, plus
//! an (always-empty, in this engine) overflow B-tree root for refcounts
//! ≥ 3. `open` replaces the whole thing from scratch by walking
//! reachability, per [`rebuild`].

use super::superblock::Superblock;
use super::tree::{era_array_walk, era_bitset_walk, era_writesets_walk};
use super::{
    checksum, EraError, Result, BITMAP_CSUM_XOR, BLOCK_SIZE, BTREE_CSUM_XOR, ENTRIES_PER_BLOCK,
    INDEX_CSUM_XOR, MAX_METADATA_BITMAPS,
};
use crate::md::{Md, ReadFlags};

const INDEX_HEADER_SIZE: usize = 16;
const INDEX_ENTRY_SIZE: usize = 16;
const BITMAP_HEADER_SIZE: usize = 16;

/// The 128-byte embedded space-map root carried in the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceMapRoot {
    pub nr_blocks: u64,
    pub nr_allocated: u64,
    pub bitmap_root: u64,
    pub ref_count_root: u64,
}

impl SpaceMapRoot {
    pub fn parse(data: &[u8; 128]) -> Result<Self> {
        Ok(Self {
            nr_blocks: u64::from_le_bytes(data[0..8].try_into().unwrap()),
            nr_allocated: u64::from_le_bytes(data[8..16].try_into().unwrap()),
            bitmap_root: u64::from_le_bytes(data[16..24].try_into().unwrap()),
            ref_count_root: u64::from_le_bytes(data[24..32].try_into().unwrap()),
        })
    }

    pub fn to_bytes(&self) -> [u8; 128] {
        let mut out = [0u8; 128];
        out[0..8].copy_from_slice(&self.nr_blocks.to_le_bytes());
        out[8..16].copy_from_slice(&self.nr_allocated.to_le_bytes());
        out[16..24].copy_from_slice(&self.bitmap_root.to_le_bytes());
        out[24..32].copy_from_slice(&self.ref_count_root.to_le_bytes());
        out
    }
}

/// A growable in-memory bitmap, one bit per index, used both to track
/// block reachability during rebuild and to materialise bitset/writeset
/// contents read off disk.
#[derive(Debug, Clone)]
pub struct Bitmap {
    bits: Vec<u64>,
    len: usize,
}

impl Bitmap {
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0u64; len.div_ceil(64)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn test_bit(&self, i: usize) -> bool {
        self.bits[i / 64] & (1u64 << (i % 64)) != 0
    }

    pub fn set_bit(&mut self, i: usize) {
        self.bits[i / 64] |= 1u64 << (i % 64);
    }

    /// Sets bit `i` and returns whether it was already set.
    pub fn test_and_set_bit(&mut self, i: usize) -> bool {
        let was_set = self.test_bit(i);
        self.set_bit(i);
        was_set
    }

    /// Index of the first clear bit, or `None` if the bitmap is full.
    pub fn first_clear(&self) -> Option<usize> {
        (0..self.len).find(|&i| !self.test_bit(i))
    }

    /// Sets bit `i` directly from a packed 64-bit word (used when a
    /// bitset's array-node payload is handed over word-by-word).
    pub fn set_word(&mut self, word_index: usize, word: u64) {
        self.bits[word_index] = word;
    }
}

/// Unpacks (or packs, since the transform is self-inverse) a 2-bit
/// refcount slot, swapping high and low bits relative to natural order.
#[inline]
pub fn swap2(v: u8) -> u8 {
    let hi = v & 1;
    let lo = (v & 2) >> 1;
    (hi << 1) | lo
}

/// Reads the refcount of metadata block `i` out of a bitmap block's
/// packed payload (the `BITMAP_HEADER_SIZE`-byte-stripped body).
pub fn bitmap_get(payload: &[u8], i: usize) -> u8 {
    let byte = payload[i / 4];
    let shift = (i % 4) * 2;
    let raw = (byte >> shift) & 0b11;
    swap2(raw)
}

/// Sets the refcount of metadata block `i` in a bitmap block's packed
/// payload.
pub fn bitmap_set(payload: &mut [u8], i: usize, refcount: u8) {
    debug_assert!(refcount <= 3);
    let raw = swap2(refcount);
    let shift = (i % 4) * 2;
    let mask = 0b11u8 << shift;
    payload[i / 4] = (payload[i / 4] & !mask) | (raw << shift);
}

/// Replaces the on-disk space-map with one derived entirely from
/// reachability from `sb`, dropping any in-flight metadata snapshot.
///
/// Returns the rewritten superblock; the caller is responsible for
/// persisting it to block 0 (step 10 is the only durable side effect, per
/// the engine's error-handling contract).
pub fn rebuild(md: &mut Md, sb: &Superblock) -> Result<Superblock> {
    // Step 1: cap effective metadata length.
    let cap = MAX_METADATA_BITMAPS * ENTRIES_PER_BLOCK;
    let nr_metadata_blocks = md.nr_blocks() as usize;
    let effective_len = if nr_metadata_blocks > cap {
        tracing::warn!(
            nr_metadata_blocks,
            cap,
            "metadata device exceeds 255*ENTRIES_PER_BLOCK; rebuild truncated"
        );
        cap
    } else {
        nr_metadata_blocks
    };

    // Step 2-3: allocate the reachability bitmap and mark the superblock.
    let mut reachable = Bitmap::new(effective_len);
    reachable.set_bit(0);

    // Step 4-5: walk every reachable tree, marking blocks and validating
    // counts as we go.
    let nr_blocks = sb.nr_blocks() as u64;

    let mut mark_block = |nr: u64, reachable: &mut Bitmap| -> Result<()> {
        let idx = nr as usize;
        if idx >= effective_len {
            return Err(EraError::Unsupported(format!(
                "reachable block {} beyond truncation limit {}",
                nr, effective_len
            )));
        }
        if reachable.test_and_set_bit(idx) {
            return Err(EraError::Corrupt(format!(
                "block {} visited twice during reachability walk",
                nr
            )));
        }
        Ok(())
    };

    if let Some((bits, root)) = sb.current_writeset() {
        walk_bitset_checked(md, root, bits as u64, nr_blocks, &mut reachable, &mut mark_block)?;
    }

    if sb.writeset_tree_root() != 0 {
        let mut bitset_roots: Vec<(u64, u64)> = Vec::new();
        {
            let mut data_cb = |count: usize, _keys: Option<&[u64]>, values: &[u8]| -> Result<()> {
                for i in 0..count {
                    let off = i * 12;
                    let bits = u32::from_le_bytes(values[off..off + 4].try_into().unwrap());
                    let root = u64::from_le_bytes(values[off + 4..off + 12].try_into().unwrap());
                    if bits as u64 != nr_blocks {
                        return Err(EraError::Corrupt(format!(
                            "archived writeset reports {} bits, expected {}",
                            bits, nr_blocks
                        )));
                    }
                    bitset_roots.push((root, bits as u64));
                }
                Ok(())
            };
            let mut block_cb = |nr: u64, _b: &crate::md::Block| -> Result<()> {
                mark_block(nr, &mut reachable)
            };
            era_writesets_walk(md, sb.writeset_tree_root(), &mut data_cb, &mut block_cb)?;
        }
        for (root, bits) in bitset_roots {
            walk_bitset_checked(md, root, bits, nr_blocks, &mut reachable, &mut mark_block)?;
        }
    }

    if sb.era_array_root() != 0 {
        let mut total: u64 = 0;
        let mut data_cb = |count: usize, _keys: Option<&[u64]>, _values: &[u8]| -> Result<()> {
            total += count as u64;
            Ok(())
        };
        let mut block_cb =
            |nr: u64, _b: &crate::md::Block| -> Result<()> { mark_block(nr, &mut reachable) };
        era_array_walk(md, sb.era_array_root(), &mut data_cb, &mut block_cb)?;
        if total != nr_blocks {
            return Err(EraError::Corrupt(format!(
                "era array has {} entries, expected {}",
                total, nr_blocks
            )));
        }
    }

    // Step 6: allocate fresh blocks for the new space-map.
    let nr_bitmap_blocks = effective_len.div_ceil(ENTRIES_PER_BLOCK).max(1);
    let mut fresh_blocks = Vec::with_capacity(nr_bitmap_blocks + 2);
    for _ in 0..nr_bitmap_blocks + 2 {
        let idx = reachable
            .first_clear()
            .ok_or_else(|| EraError::Io(std::io::Error::other("no free metadata blocks")))?;
        reachable.set_bit(idx);
        fresh_blocks.push(idx as u64);
    }
    let ref_count_root = fresh_blocks[0];
    let index_block = fresh_blocks[1];
    let bitmap_blocks = &fresh_blocks[2..];

    // Step 7: emit bitmap blocks.
    let mut index_entries = Vec::with_capacity(bitmap_blocks.len());
    for (bi, &bitmap_block_nr) in bitmap_blocks.iter().enumerate() {
        let mut block = [0u8; BLOCK_SIZE];
        block[8..16].copy_from_slice(&bitmap_block_nr.to_le_bytes());
        let payload = &mut block[BITMAP_HEADER_SIZE..];
        let base = bi * ENTRIES_PER_BLOCK;
        let mut nr_free = 0u32;
        for slot in 0..ENTRIES_PER_BLOCK {
            let global = base + slot;
            let refcount = if global < effective_len && reachable.test_bit(global) {
                1
            } else {
                nr_free += 1;
                0
            };
            bitmap_set(payload, slot, refcount);
        }
        checksum::stamp(&mut block, BITMAP_CSUM_XOR);
        md.write(bitmap_block_nr, &block)?;
        index_entries.push((bitmap_block_nr, nr_free, 0u32));
    }

    // Step 8: emit the empty refcount-overflow B-tree leaf.
    {
        let mut block = [0u8; BLOCK_SIZE];
        block[4..8].copy_from_slice(&2u32.to_le_bytes()); // FLAG_LEAF
        block[8..16].copy_from_slice(&ref_count_root.to_le_bytes());
        block[16..20].copy_from_slice(&0u32.to_le_bytes()); // nr_entries
        let capacity = (BLOCK_SIZE - 32) / (8 + 4);
        let max_entries = (capacity / 3) * 3;
        block[20..24].copy_from_slice(&(max_entries as u32).to_le_bytes());
        block[24..28].copy_from_slice(&4u32.to_le_bytes()); // value_size
        checksum::stamp(&mut block, BTREE_CSUM_XOR);
        md.write(ref_count_root, &block)?;
    }

    // Step 9: emit the index node.
    {
        let mut block = [0u8; BLOCK_SIZE];
        block[8..16].copy_from_slice(&index_block.to_le_bytes());
        let mut off = INDEX_HEADER_SIZE;
        for (bitmap_nr, nr_free, none_free_before) in &index_entries {
            block[off..off + 8].copy_from_slice(&bitmap_nr.to_le_bytes());
            block[off + 8..off + 12].copy_from_slice(&nr_free.to_le_bytes());
            block[off + 12..off + 16].copy_from_slice(&none_free_before.to_le_bytes());
            off += INDEX_ENTRY_SIZE;
        }
        checksum::stamp(&mut block, INDEX_CSUM_XOR);
        md.write(index_block, &block)?;
    }

    // Step 10: rewrite the superblock.
    let nr_allocated = (0..effective_len).filter(|&i| reachable.test_bit(i)).count() as u64;
    let root = SpaceMapRoot {
        nr_blocks: nr_metadata_blocks as u64,
        nr_allocated,
        bitmap_root: index_block,
        ref_count_root,
    };
    Ok(sb.with_rebuilt_space_map(&root))
}

fn walk_bitset_checked(
    md: &mut Md,
    root: u64,
    bits: u64,
    nr_blocks: u64,
    reachable: &mut Bitmap,
    mark_block: &mut dyn FnMut(u64, &mut Bitmap) -> Result<()>,
) -> Result<()> {
    if bits != nr_blocks {
        return Err(EraError::Corrupt(format!(
            "bitset reports {} bits, expected {}",
            bits, nr_blocks
        )));
    }
    let expected_words = (bits as usize).div_ceil(64) as u64;
    let mut total_words = 0u64;
    let mut data_cb = |count: usize, _keys: Option<&[u64]>, _values: &[u8]| -> Result<()> {
        total_words += count as u64;
        Ok(())
    };
    let mut block_cb = |nr: u64, _b: &crate::md::Block| -> Result<()> { mark_block(nr, reachable) };
    era_bitset_walk(md, root, &mut data_cb, &mut block_cb)?;
    if total_words != expected_words {
        return Err(EraError::Corrupt(format!(
            "bitset has {} words, expected {}",
            total_words, expected_words
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_map_root_roundtrip() {
        let root = SpaceMapRoot {
            nr_blocks: 100,
            nr_allocated: 42,
            bitmap_root: 7,
            ref_count_root: 8,
        };
        let bytes = root.to_bytes();
        let parsed = SpaceMapRoot::parse(&bytes).unwrap();
        assert_eq!(parsed, root);
    }

    #[test]
    fn test_swap2_self_inverse() {
        for v in 0u8..4 {
            assert_eq!(swap2(swap2(v)), v);
        }
        // refcount 1 (binary 01) packs to stored nibble 2 (binary 10).
        assert_eq!(swap2(1), 2);
        assert_eq!(swap2(2), 1);
        assert_eq!(swap2(0), 0);
        assert_eq!(swap2(3), 3);
    }

    #[test]
    fn test_bitmap_set_and_get_roundtrip() {
        let mut payload = vec![0u8; 8];
        bitmap_set(&mut payload, 0, 1);
        bitmap_set(&mut payload, 1, 3);
        bitmap_set(&mut payload, 5, 2);
        assert_eq!(bitmap_get(&payload, 0), 1);
        assert_eq!(bitmap_get(&payload, 1), 3);
        assert_eq!(bitmap_get(&payload, 5), 2);
        assert_eq!(bitmap_get(&payload, 2), 0);
    }

    #[test]
    fn test_bitmap_test_and_set() {
        let mut bm = Bitmap::new(10);
        assert!(!bm.test_and_set_bit(3));
        assert!(bm.test_and_set_bit(3));
        assert!(bm.test_bit(3));
    }

    #[test]
    fn test_bitmap_first_clear() {
        let mut bm = Bitmap::new(4);
        bm.set_bit(0);
        bm.set_bit(1);
        assert_eq!(bm.first_clear(), Some(2));
        bm.set_bit(2);
        bm.set_bit(3);
        assert_eq!(bm.first_clear(), None);
    }
}
