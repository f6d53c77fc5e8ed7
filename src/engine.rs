//! Top-level command handlers (`create`, `open`, `close`, `status`, `dumpsb`)
//!
//! These drive the same `DmClient`/`blockdev`/`core` collaborators the
//! [`crate::dm::orchestrator`] snapshot state machines use, but each is a
//! single linear sequence rather than a stateful machine with unwind: a
//! failure partway through just removes whatever dm device it already
//! created and returns.

use std::sync::Arc;

use crate::blockdev::{self, BlockDevice};
use crate::core::spacemap;
use crate::core::{EngineContext, EraError, Result, Superblock, BLOCK_SIZE, SUPERBLOCK_CSUM_XOR};
use crate::dm::{DmClient, DmTarget};
use crate::md::{Md, ReadFlags};

const SECTOR_SIZE: u64 = 512;
const MIN_CHUNK_SECTORS: u32 = 8;
pub const DEFAULT_CHUNK_SECTORS: u32 = 128;
const UUID_PREFIX: &str = "ERA-";

/// Parses a chunk-size argument the way the original tool's `parse_chunk`
/// does: a bare number of bytes, or a value suffixed `k`/`m`/`g` (powers of
/// 1024 bytes) or `s` (explicit sectors). Returns the chunk size in
/// sectors.
pub fn parse_chunk(text: &str) -> Result<u32> {
    let (digits, suffix) = match text.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&text[..text.len() - 1], Some(c.to_ascii_lowercase())),
        _ => (text, None),
    };
    let mut bytes: i64 = digits
        .parse()
        .map_err(|_| EraError::Arg(format!("can't parse chunk size: {}", text)))?;
    if bytes <= 0 {
        return Err(EraError::Arg(format!("can't parse chunk size: {}", text)));
    }
    match suffix {
        None => {}
        Some('s') => bytes *= SECTOR_SIZE as i64,
        Some('k') => bytes *= 1024,
        Some('m') => bytes *= 1024 * 1024,
        Some('g') => bytes *= 1024 * 1024 * 1024,
        Some(_) => return Err(EraError::Arg(format!("can't parse chunk size: {}", text))),
    }
    if bytes % SECTOR_SIZE as i64 != 0 {
        return Err(EraError::Arg(format!(
            "chunk size is not divisible by {}",
            SECTOR_SIZE
        )));
    }
    let chunk = bytes / SECTOR_SIZE as i64;
    if chunk < MIN_CHUNK_SECTORS as i64 {
        return Err(EraError::Arg(format!(
            "chunk too small, minimum is {} bytes",
            MIN_CHUNK_SECTORS as u64 * SECTOR_SIZE
        )));
    }
    if chunk > u32::MAX as i64 {
        return Err(EraError::Arg(format!("chunk too big: {}", text)));
    }
    Ok(chunk as u32)
}

fn read_block0(device: &dyn BlockDevice) -> Result<[u8; BLOCK_SIZE]> {
    let mut buf = [0u8; BLOCK_SIZE];
    device.read_at(0, &mut buf).map_err(EraError::BlockDevice)?;
    Ok(buf)
}

/// Refuses to clobber an existing, parseable superblock (or any nonzero
/// block 0) unless `ctx.force` is set.
fn check_clear_to_write(ctx: &EngineContext, device: &dyn BlockDevice, what: &str) -> Result<()> {
    let block = read_block0(device)?;
    if ctx.force {
        return Ok(());
    }
    let description = match Superblock::parse(&block) {
        Ok(_) => "valid era superblock",
        Err(_) if block.iter().any(|&b| b != 0) => "existing data",
        Err(_) => return Ok(()),
    };
    Err(EraError::Arg(format!(
        "{} found on {}\n  use --force to ignore this check",
        description, what
    )))
}

fn open_major_minor(path: &str, read_only: bool) -> Result<(Box<dyn BlockDevice>, u32, u32)> {
    let device = blockdev::open(path, read_only)?;
    let (major, minor) = blockdev::PhysicalDevice::open(path, read_only)
        .and_then(|p| p.major_minor())
        .unwrap_or((0, 0));
    Ok((device, major, minor))
}

/// `create <name> <meta> <data> [chunk]`: zeroes the metadata device's
/// superblock block and brings up a fresh `era`+`-orig` device pair. The
/// kernel target formats the on-disk metadata itself the first time it
/// sees an all-zero superblock; this command doesn't write trees.
pub fn create(
    ctx: &EngineContext,
    dm: &dyn DmClient,
    name: &str,
    meta_path: &str,
    data_path: &str,
    chunk: u32,
) -> Result<()> {
    let (data_device, data_major, data_minor) = open_major_minor(data_path, true)?;
    let sectors = data_device.size() / SECTOR_SIZE;

    let meta_device = blockdev::open(meta_path, false)?;
    check_clear_to_write(ctx, meta_device.as_ref(), meta_path)?;
    let (_, meta_major, meta_minor) = open_major_minor(meta_path, false)?;

    let orig_name = format!("{}-orig", name);
    let era_uuid = format!("{}{}-{}", UUID_PREFIX, meta_major, meta_minor);

    dm.create(name, &[DmTarget::new(0, sectors, "error", "")])?;

    let zero = [0u8; BLOCK_SIZE];
    if let Err(e) = meta_device.write_at(0, &zero).map_err(EraError::BlockDevice) {
        let _ = dm.remove(name);
        return Err(e);
    }

    if let Err(e) = dm.create(
        &orig_name,
        &[DmTarget::new(0, sectors, "linear", format!("{}:{} 0", data_major, data_minor))],
    ) {
        let _ = dm.remove(name);
        return Err(e);
    }

    let orig_info = dm.info(&orig_name)?;
    let table = format!(
        "{}:{} {}:{} {}",
        meta_major, meta_minor, orig_info.major, orig_info.minor, chunk
    );
    if let Err(e) = dm
        .reload(name, &[DmTarget::new(0, sectors, "era", table)])
        .and_then(|_| dm.resume(name))
    {
        let _ = dm.remove(&orig_name);
        let _ = dm.remove(name);
        return Err(e);
    }

    tracing::info!(era_uuid, orig_name, "created era device {}", name);
    Ok(())
}

/// `open <name> <meta> <data>`: validates the on-disk superblock, rebuilds
/// the space map (recomputing reference counts the way a clean shutdown
/// would have left them), checks the data device size still matches
/// `nr_blocks`, then brings the `era`+`-orig` pair up.
pub fn open(ctx: &EngineContext, dm: &dyn DmClient, name: &str, meta_path: &str, data_path: &str) -> Result<()> {
    let (data_device, data_major, data_minor) = open_major_minor(data_path, true)?;
    let sectors = data_device.size() / SECTOR_SIZE;

    let meta_device: Arc<dyn BlockDevice> = Arc::from(blockdev::open(meta_path, false)?);
    let (_, meta_major, meta_minor) = open_major_minor(meta_path, false)?;

    let mut md = Md::new(meta_device.clone());
    let sb_raw = md.read(0, ReadFlags::CACHED, SUPERBLOCK_CSUM_XOR)?;
    let sb = Superblock::parse(&*sb_raw)?;

    let chunk = sb.data_block_size();
    let nr_blocks = sb.nr_blocks();

    let rebuilt = spacemap::rebuild(&mut md, &sb)?;
    md.write(0, &rebuilt.to_block())?;

    let chunks = sectors.div_ceil(chunk as u64) as u32;
    if !ctx.force && chunks != nr_blocks {
        return Err(EraError::Arg(format!(
            "can't open era device: data device resized\n  {} chunks in superblock\n  {} chunks in {}\n\nuse --force if you really resized the data device and want to adjust era metadata accordingly",
            nr_blocks, chunks, data_path
        )));
    }

    let orig_name = format!("{}-orig", name);
    dm.create(
        &orig_name,
        &[DmTarget::new(0, sectors, "linear", format!("{}:{} 0", data_major, data_minor))],
    )?;
    let orig_info = dm.info(&orig_name)?;

    let table = format!(
        "{}:{} {}:{} {}",
        meta_major, meta_minor, orig_info.major, orig_info.minor, chunk
    );
    dm.create(name, &[DmTarget::new(0, sectors, "era", table)])
        .and_then(|_| dm.resume(name))
        .inspect_err(|_| {
            let _ = dm.remove(&orig_name);
        })?;

    Ok(())
}

/// `close <name>`: removes a live `era`+`-orig` pair. Refuses if the
/// origin carries more than one target or anything other than a plain
/// `linear` table (i.e. a snapshot is still attached).
pub fn close(dm: &dyn DmClient, name: &str) -> Result<()> {
    let info = dm.info(name)?;
    if !info.exists {
        return Err(EraError::NotFound(format!("device does not exist: {}", name)));
    }

    let orig_name = format!("{}-orig", name);
    let orig_info = dm.info(&orig_name)?;
    if !orig_info.exists {
        return Err(EraError::NotFound(format!("data device does not exist: {}", orig_name)));
    }
    if orig_info.target_count > 1 {
        return Err(EraError::Busy(format!("too many targets in data device {}", orig_name)));
    }

    let table = dm.table(&orig_name)?;
    let target = table
        .first()
        .ok_or_else(|| EraError::Corrupt(format!("can't get target or table for device {}", orig_name)))?;
    match target.target_type.as_str() {
        "snapshot-origin" => {
            return Err(EraError::Busy(
                "data device has snapshots, please remove them first".to_string(),
            ))
        }
        "linear" => {}
        other => {
            return Err(EraError::Unsupported(format!(
                "data device uses unknown target type {}",
                other
            )))
        }
    }

    dm.remove(name)?;
    dm.remove(&orig_name)?;
    Ok(())
}

/// One live device's status line, as `status` reports it.
#[derive(Debug, Clone)]
pub struct DeviceStatus {
    pub name: String,
    pub target_type: String,
    pub status: String,
}

/// `status [name]`: with a name, the one device's status line; without,
/// every device on the system (as `dmsetup ls` enumerates them).
pub fn status(dm: &dyn DmClient, name: Option<&str>) -> Result<Vec<DeviceStatus>> {
    let names = match name {
        Some(n) => vec![n.to_string()],
        None => dm.list()?,
    };
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        let table = dm.table(&name)?;
        let target_type = table
            .first()
            .map(|t| t.target_type.clone())
            .unwrap_or_else(|| "-".to_string());
        let status = dm.status(&name)?;
        out.push(DeviceStatus {
            name,
            target_type,
            status,
        });
    }
    Ok(out)
}

/// `dumpsb <metadata-device>`: reads and returns the parsed superblock
/// without touching device-mapper at all.
pub fn dumpsb(meta_path: &str) -> Result<Superblock> {
    let device = blockdev::open(meta_path, true)?;
    Superblock::read(device.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chunk_bare_bytes() {
        // a bare number is bytes, same as the tool this engine is modeled on
        assert_eq!(parse_chunk("65536").unwrap(), 128);
    }

    #[test]
    fn test_parse_chunk_kilobytes() {
        // 64KiB / 512 = 128 sectors
        assert_eq!(parse_chunk("64k").unwrap(), 128);
    }

    #[test]
    fn test_parse_chunk_sector_suffix() {
        assert_eq!(parse_chunk("256s").unwrap(), 256);
    }

    #[test]
    fn test_parse_chunk_too_small_rejected() {
        assert!(parse_chunk("1s").is_err());
    }

    #[test]
    fn test_parse_chunk_not_sector_aligned_rejected() {
        assert!(parse_chunk("100").is_err());
    }

    #[test]
    fn test_parse_chunk_garbage_rejected() {
        assert!(parse_chunk("abc").is_err());
    }
}
