//! Era tree walkers
//!
//! A single recursive descent handles both the outer B-tree and its leaf
//! array nodes. Three leaf kinds share this descent: the era array and
//! bitset sub-trees hold their data one indirection further down, in dense
//! "array node" blocks pointed to by B-tree leaf values; the writeset tree
//! holds its (small, fixed-size) descriptor values directly in the B-tree
//! leaf, with no further indirection.

use super::{checksum, EraError, Result, ARRAY_CSUM_XOR, BLOCK_SIZE, BTREE_CSUM_XOR};
use crate::md::{Block, Md, ReadFlags};

const BTREE_HEADER_SIZE: usize = 32;
const ARRAY_HEADER_SIZE: usize = 24;

const FLAG_INTERNAL: u32 = 1;
const FLAG_LEAF: u32 = 2;

/// Which of the three trees a walk is descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafKind {
    /// Era array: B-tree leaves point at array nodes of `u32` eras.
    Array,
    /// Bitset: B-tree leaves point at array nodes of packed `u64` words.
    Bitset,
    /// Writeset tree: B-tree leaves hold `(nr_bits, root)` descriptors
    /// directly, value_size = 12.
    Writeset,
}

impl LeafKind {
    fn leaf_value_size(self) -> usize {
        match self {
            LeafKind::Array | LeafKind::Bitset => 8,
            LeafKind::Writeset => 12,
        }
    }

    fn array_value_size(self) -> usize {
        match self {
            LeafKind::Array => 4,
            LeafKind::Bitset => 8,
            LeafKind::Writeset => unreachable!("writeset leaves have no array indirection"),
        }
    }
}

struct BTreeHeader {
    blocknr: u64,
    flags: u32,
    nr_entries: u32,
    max_entries: u32,
    value_size: u32,
}

fn parse_btree_header(block: &Block, expected_blocknr: u64) -> Result<BTreeHeader> {
    if block.len() < BTREE_HEADER_SIZE {
        return Err(EraError::Corrupt("B-tree header too small".into()));
    }
    let flags = u32::from_le_bytes(block[4..8].try_into().unwrap());
    let blocknr = u64::from_le_bytes(block[8..16].try_into().unwrap());
    let nr_entries = u32::from_le_bytes(block[16..20].try_into().unwrap());
    let max_entries = u32::from_le_bytes(block[20..24].try_into().unwrap());
    let value_size = u32::from_le_bytes(block[24..28].try_into().unwrap());

    if blocknr != expected_blocknr {
        return Err(EraError::Corrupt(format!(
            "B-tree node self block-number {} != actual {}",
            blocknr, expected_blocknr
        )));
    }
    let is_internal = flags & FLAG_INTERNAL != 0;
    let is_leaf = flags & FLAG_LEAF != 0;
    if is_internal == is_leaf {
        return Err(EraError::Corrupt(format!(
            "B-tree node {} has incoherent flags {:#x}",
            blocknr, flags
        )));
    }
    if max_entries % 3 != 0 {
        return Err(EraError::Corrupt(format!(
            "B-tree node {} max_entries {} not a multiple of 3",
            blocknr, max_entries
        )));
    }
    if nr_entries > max_entries {
        return Err(EraError::Corrupt(format!(
            "B-tree node {} nr_entries {} > max_entries {}",
            blocknr, nr_entries, max_entries
        )));
    }
    let capacity = (BLOCK_SIZE - BTREE_HEADER_SIZE) / (8 + value_size as usize);
    if max_entries as usize > capacity {
        return Err(EraError::Corrupt(format!(
            "B-tree node {} max_entries {} exceeds capacity {}",
            blocknr, max_entries, capacity
        )));
    }

    Ok(BTreeHeader {
        blocknr,
        flags,
        nr_entries,
        max_entries,
        value_size,
    })
}

fn btree_keys(block: &Block, header: &BTreeHeader) -> Result<Vec<u64>> {
    let mut keys = Vec::with_capacity(header.nr_entries as usize);
    let mut offset = BTREE_HEADER_SIZE;
    let mut prev: Option<u64> = None;
    for _ in 0..header.nr_entries {
        let key = u64::from_le_bytes(block[offset..offset + 8].try_into().unwrap());
        if let Some(p) = prev {
            if key <= p {
                return Err(EraError::Corrupt(format!(
                    "B-tree node {} keys not strictly ascending",
                    header.blocknr
                )));
            }
        }
        prev = Some(key);
        keys.push(key);
        offset += 8;
    }
    Ok(keys)
}

fn btree_values_offset(header: &BTreeHeader) -> usize {
    BTREE_HEADER_SIZE + header.max_entries as usize * 8
}

fn parse_array_header(block: &Block, expected_blocknr: u64) -> Result<(u32, u32, u32)> {
    if block.len() < ARRAY_HEADER_SIZE {
        return Err(EraError::Corrupt("array header too small".into()));
    }
    let max_entries = u32::from_le_bytes(block[4..8].try_into().unwrap());
    let nr_entries = u32::from_le_bytes(block[8..12].try_into().unwrap());
    let value_size = u32::from_le_bytes(block[12..16].try_into().unwrap());
    let blocknr = u64::from_le_bytes(block[16..24].try_into().unwrap());

    if blocknr != expected_blocknr {
        return Err(EraError::Corrupt(format!(
            "array node self block-number {} != actual {}",
            blocknr, expected_blocknr
        )));
    }
    if nr_entries > max_entries {
        return Err(EraError::Corrupt(format!(
            "array node {} nr_entries {} > max_entries {}",
            blocknr, nr_entries, max_entries
        )));
    }
    let capacity = (BLOCK_SIZE - ARRAY_HEADER_SIZE) / value_size.max(1) as usize;
    if max_entries as usize > capacity {
        return Err(EraError::Corrupt(format!(
            "array node {} max_entries {} exceeds capacity {}",
            blocknr, max_entries, capacity
        )));
    }

    Ok((max_entries, nr_entries, value_size))
}

/// Walks the tree rooted at `root`, invoking `block_cb` once per visited
/// block (B-tree node or array node) before descending further, and
/// `data_cb` once per leaf range, followed by a final `data_cb(0, None, &[])`
/// sentinel once the walk completes.
pub fn walk(
    md: &mut Md,
    root: u64,
    kind: LeafKind,
    data_cb: &mut dyn FnMut(usize, Option<&[u64]>, &[u8]) -> Result<()>,
    block_cb: &mut dyn FnMut(u64, &Block) -> Result<()>,
) -> Result<()> {
    walk_node(md, root, kind, data_cb, block_cb)?;
    data_cb(0, None, &[])
}

fn walk_node(
    md: &mut Md,
    block_nr: u64,
    kind: LeafKind,
    data_cb: &mut dyn FnMut(usize, Option<&[u64]>, &[u8]) -> Result<()>,
    block_cb: &mut dyn FnMut(u64, &Block) -> Result<()>,
) -> Result<()> {
    // Re-fetched at the top of every call, as the walked tree requires:
    // the cache may have grown since an ancestor frame read this block.
    let block = md.read(block_nr, ReadFlags::CACHED, BTREE_CSUM_XOR)?;
    block_cb(block_nr, &block)?;

    let header = parse_btree_header(&block, block_nr)?;
    let keys = btree_keys(&block, &header)?;
    let values_off = btree_values_offset(&header);

    if header.flags & FLAG_INTERNAL != 0 {
        if header.value_size != 8 {
            return Err(EraError::Corrupt(format!(
                "internal B-tree node {} value_size {} != 8",
                block_nr, header.value_size
            )));
        }
        for i in 0..header.nr_entries as usize {
            let off = values_off + i * 8;
            let child = u64::from_le_bytes(block[off..off + 8].try_into().unwrap());
            walk_node(md, child, kind, data_cb, block_cb)?;
        }
        return Ok(());
    }

    // Leaf node.
    let expected_leaf_value_size = kind.leaf_value_size();
    if header.value_size as usize != expected_leaf_value_size {
        return Err(EraError::Corrupt(format!(
            "leaf B-tree node {} value_size {} != expected {}",
            block_nr, header.value_size, expected_leaf_value_size
        )));
    }

    match kind {
        LeafKind::Writeset => {
            let len = header.nr_entries as usize * expected_leaf_value_size;
            data_cb(
                header.nr_entries as usize,
                Some(&keys),
                &block[values_off..values_off + len],
            )?;
        }
        LeafKind::Array | LeafKind::Bitset => {
            for i in 0..header.nr_entries as usize {
                let off = values_off + i * 8;
                let array_block_nr = u64::from_le_bytes(block[off..off + 8].try_into().unwrap());
                walk_array_node(md, array_block_nr, kind, data_cb, block_cb)?;
            }
        }
    }

    Ok(())
}

fn walk_array_node(
    md: &mut Md,
    block_nr: u64,
    kind: LeafKind,
    data_cb: &mut dyn FnMut(usize, Option<&[u64]>, &[u8]) -> Result<()>,
    block_cb: &mut dyn FnMut(u64, &Block) -> Result<()>,
) -> Result<()> {
    let block = md.read(block_nr, ReadFlags::CACHED, ARRAY_CSUM_XOR)?;
    block_cb(block_nr, &block)?;

    let (_max_entries, nr_entries, value_size) = parse_array_header(&block, block_nr)?;
    let expected = kind.array_value_size();
    if value_size as usize != expected {
        return Err(EraError::Corrupt(format!(
            "array node {} value_size {} != expected {}",
            block_nr, value_size, expected
        )));
    }

    let len = nr_entries as usize * value_size as usize;
    data_cb(
        nr_entries as usize,
        None,
        &block[ARRAY_HEADER_SIZE..ARRAY_HEADER_SIZE + len],
    )
}

/// Walks an era array.
pub fn era_array_walk(
    md: &mut Md,
    root: u64,
    data_cb: &mut dyn FnMut(usize, Option<&[u64]>, &[u8]) -> Result<()>,
    block_cb: &mut dyn FnMut(u64, &Block) -> Result<()>,
) -> Result<()> {
    walk(md, root, LeafKind::Array, data_cb, block_cb)
}

/// Walks a bitset sub-tree.
pub fn era_bitset_walk(
    md: &mut Md,
    root: u64,
    data_cb: &mut dyn FnMut(usize, Option<&[u64]>, &[u8]) -> Result<()>,
    block_cb: &mut dyn FnMut(u64, &Block) -> Result<()>,
) -> Result<()> {
    walk(md, root, LeafKind::Bitset, data_cb, block_cb)
}

/// Walks the writeset tree.
pub fn era_writesets_walk(
    md: &mut Md,
    root: u64,
    data_cb: &mut dyn FnMut(usize, Option<&[u64]>, &[u8]) -> Result<()>,
    block_cb: &mut dyn FnMut(u64, &Block) -> Result<()>,
) -> Result<()> {
    walk(md, root, LeafKind::Writeset, data_cb, block_cb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::ImageFile;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn new_md(nr_blocks: u64) -> Md {
        let temp = NamedTempFile::new().unwrap();
        let img = ImageFile::create(temp.path(), nr_blocks * BLOCK_SIZE as u64).unwrap();
        Md::new(Arc::new(img))
    }

    fn write_array_leaf(md: &mut Md, block_nr: u64, values: &[u32]) {
        let mut block = [0u8; BLOCK_SIZE];
        let max_entries = ((BLOCK_SIZE - ARRAY_HEADER_SIZE) / 4) as u32;
        block[4..8].copy_from_slice(&max_entries.to_le_bytes());
        block[8..12].copy_from_slice(&(values.len() as u32).to_le_bytes());
        block[12..16].copy_from_slice(&4u32.to_le_bytes());
        block[16..24].copy_from_slice(&block_nr.to_le_bytes());
        let mut off = ARRAY_HEADER_SIZE;
        for v in values {
            block[off..off + 4].copy_from_slice(&v.to_le_bytes());
            off += 4;
        }
        checksum::stamp(&mut block, ARRAY_CSUM_XOR);
        md.write(block_nr, &block).unwrap();
    }

    fn write_btree_leaf_array(md: &mut Md, block_nr: u64, keys: &[u64], children: &[u64]) {
        let mut block = [0u8; BLOCK_SIZE];
        block[4..8].copy_from_slice(&(FLAG_LEAF).to_le_bytes());
        block[8..16].copy_from_slice(&block_nr.to_le_bytes());
        block[16..20].copy_from_slice(&(keys.len() as u32).to_le_bytes());
        let max_entries = 3u32;
        block[20..24].copy_from_slice(&max_entries.to_le_bytes());
        block[24..28].copy_from_slice(&8u32.to_le_bytes());
        let mut off = BTREE_HEADER_SIZE;
        for k in keys {
            block[off..off + 8].copy_from_slice(&k.to_le_bytes());
            off += 8;
        }
        let values_off = BTREE_HEADER_SIZE + max_entries as usize * 8;
        let mut voff = values_off;
        for c in children {
            block[voff..voff + 8].copy_from_slice(&c.to_le_bytes());
            voff += 8;
        }
        checksum::stamp(&mut block, BTREE_CSUM_XOR);
        md.write(block_nr, &block).unwrap();
    }

    #[test]
    fn test_walk_single_leaf_array_tree() {
        let mut md = new_md(8);
        write_array_leaf(&mut md, 2, &[10, 20, 30]);
        write_btree_leaf_array(&mut md, 1, &[0], &[2]);

        let mut collected = Vec::new();
        let mut data_cb = |count: usize, keys: Option<&[u64]>, values: &[u8]| -> Result<()> {
            if count == 0 {
                return Ok(());
            }
            assert!(keys.is_none());
            for chunk in values.chunks(4) {
                collected.push(u32::from_le_bytes(chunk.try_into().unwrap()));
            }
            Ok(())
        };
        let mut blocks_seen = Vec::new();
        let mut block_cb = |nr: u64, _b: &Block| -> Result<()> {
            blocks_seen.push(nr);
            Ok(())
        };

        era_array_walk(&mut md, 1, &mut data_cb, &mut block_cb).unwrap();
        assert_eq!(collected, vec![10, 20, 30]);
        assert_eq!(blocks_seen, vec![1, 2]);
    }

    #[test]
    fn test_walk_rejects_mismatched_self_blocknr() {
        let mut md = new_md(4);
        write_array_leaf(&mut md, 2, &[1]);
        write_btree_leaf_array(&mut md, 1, &[0], &[2]);
        // Corrupt the array node's self block-number.
        let mut block = *md.read(2, ReadFlags::NO_CRC, ARRAY_CSUM_XOR).unwrap();
        block[16..24].copy_from_slice(&99u64.to_le_bytes());
        checksum::stamp(&mut block, ARRAY_CSUM_XOR);
        md.write(2, &block).unwrap();

        let mut data_cb = |_: usize, _: Option<&[u64]>, _: &[u8]| -> Result<()> { Ok(()) };
        let mut block_cb = |_: u64, _: &Block| -> Result<()> { Ok(()) };
        let result = era_array_walk(&mut md, 1, &mut data_cb, &mut block_cb);
        assert!(matches!(result, Err(EraError::Corrupt(_))));
    }

    #[test]
    fn test_walk_rejects_non_ascending_keys() {
        let mut md = new_md(4);
        write_array_leaf(&mut md, 2, &[1]);
        write_array_leaf(&mut md, 3, &[2]);
        write_btree_leaf_array(&mut md, 1, &[5, 5], &[2, 3]);

        let mut data_cb = |_: usize, _: Option<&[u64]>, _: &[u8]| -> Result<()> { Ok(()) };
        let mut block_cb = |_: u64, _: &Block| -> Result<()> { Ok(()) };
        let result = era_array_walk(&mut md, 1, &mut data_cb, &mut block_cb);
        assert!(matches!(result, Err(EraError::Corrupt(_))));
    }
}
