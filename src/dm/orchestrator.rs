//! Orchestrator: take-snapshot and drop-snapshot state machines
//!
//! This is the only layer that understands unwind. Every other routine in
//! the engine returns a single error up the stack; here, a failure at any
//! state walks back through the idempotent unwind actions of every state
//! already reached, in reverse, so a mid-sequence crash never leaves a
//! kernel device suspended or a reserved name dangling.

use std::sync::Arc;

use uuid::Uuid;

use crate::blockdev::{self, BlockDevice};
use crate::core::snapshot::{self, SnapshotSuperblock};
use crate::core::{EraError, Result, BLOCK_SIZE};
use crate::md::{Md, ReadFlags};

use super::client::{DmClient, DmTarget};

const SECTOR_SIZE: u64 = 512;
/// Sectors per 4096-byte metadata block.
const SECTORS_PER_BLOCK: u64 = BLOCK_SIZE as u64 / SECTOR_SIZE;
/// `snapshot` target chunk size, in sectors, the orchestrator always uses.
const SNAP_CHUNK_SECTORS: u64 = 16;

#[derive(Debug, Clone)]
pub struct TakeSnapshotRequest {
    /// Name of the live `era` device as known to device-mapper.
    pub era_name: String,
    /// Path to the block device or image file that will hold the
    /// snapshot's own metadata plus COW store.
    pub snapshot_device_path: String,
}

#[derive(Debug, Clone)]
pub struct DropSnapshotRequest {
    pub snapshot_device_path: String,
}

/// States of the take-snapshot sequence, in reached order. Each carries an
/// idempotent unwind action invoked, in reverse, from the highest state
/// reached back to `Init`, on any failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum State {
    Init,
    EraInspected,
    CowReady,
    OriginConverted,
    MdSnapTaken,
    MdCopied,
    MdSnapDropped,
    Suspended,
    BitmapRead,
    SnapLoaded,
    OriginResumed,
    EraResumed,
    BitmapDigested,
    SbWritten,
}

struct EraParams {
    meta_major: u32,
    meta_minor: u32,
    orig_major: u32,
    orig_minor: u32,
    chunk: u32,
}

fn parse_era_table(table: &[DmTarget]) -> Result<EraParams> {
    let target = table
        .first()
        .ok_or_else(|| EraError::Corrupt("era device has an empty table".to_string()))?;
    if target.target_type != "era" {
        return Err(EraError::Unsupported(format!(
            "expected target type era, got {}",
            target.target_type
        )));
    }
    let mut parts = target.params.split_whitespace();
    let meta = parts
        .next()
        .ok_or_else(|| EraError::Corrupt("era table missing metadata device".to_string()))?;
    let orig = parts
        .next()
        .ok_or_else(|| EraError::Corrupt("era table missing origin device".to_string()))?;
    let chunk: u32 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| EraError::Corrupt("era table missing chunk size".to_string()))?;

    let (meta_major, meta_minor) = parse_major_minor(meta)?;
    let (orig_major, orig_minor) = parse_major_minor(orig)?;

    Ok(EraParams {
        meta_major,
        meta_minor,
        orig_major,
        orig_minor,
        chunk,
    })
}

fn parse_major_minor(s: &str) -> Result<(u32, u32)> {
    let (maj, min) = s
        .split_once(':')
        .ok_or_else(|| EraError::Corrupt(format!("expected major:minor, got {}", s)))?;
    let major: u32 = maj
        .parse()
        .map_err(|_| EraError::Corrupt(format!("bad major number in {}", s)))?;
    let minor: u32 = min
        .parse()
        .map_err(|_| EraError::Corrupt(format!("bad minor number in {}", s)))?;
    Ok((major, minor))
}

/// Extracts the in-flight metadata snapshot block number from an era
/// target's status line, or `None` if the last token is `-`.
fn parse_metadata_snap_from_status(status: &str) -> Option<u64> {
    let last = status.split_whitespace().last()?;
    if last == "-" {
        None
    } else {
        last.parse().ok()
    }
}

/// Runs the take-snapshot sequence end to end, unwinding every side effect
/// reached so far if any step fails.
pub fn take_snapshot(dm: &dyn DmClient, req: &TakeSnapshotRequest) -> Result<()> {
    let mut reached = State::Init;
    let mut origin_suspended = false;
    let mut era_suspended = false;
    let mut origin_converted = false;
    let mut original_origin_table: Option<Vec<DmTarget>> = None;
    let mut metadata_snap_taken = false;
    let mut snap_name = String::new();
    let mut cow_name = String::new();
    let mut orig_name = String::new();

    let result = (|| -> Result<()> {
        // INIT -> ERA_INSPECTED
        let info = dm.info(&req.era_name)?;
        if !info.exists {
            return Err(EraError::NotFound(format!("device {} not found", req.era_name)));
        }
        let table = dm.table(&req.era_name)?;
        let params = parse_era_table(&table)?;
        let status = dm.status(&req.era_name)?;
        if parse_metadata_snap_from_status(&status).is_some() {
            return Err(EraError::Busy(format!(
                "device {} already has a metadata snapshot in progress",
                req.era_name
            )));
        }
        reached = State::EraInspected;

        // ERA_INSPECTED -> COW_READY
        let meta_path = blockdev::resolve_devnode(params.meta_major, params.meta_minor)?;
        let orig_path = blockdev::resolve_devnode(params.orig_major, params.orig_minor)?;
        orig_name = find_device_name_for_major_minor(dm, params.orig_major, params.orig_minor)?;

        let orig_device = blockdev::open(
            orig_path.to_str().ok_or_else(|| EraError::Arg("non-UTF8 origin device path".to_string()))?,
            true,
        )?;
        let orig_sectors = orig_device.size() / SECTOR_SIZE;
        let nr_blocks = orig_sectors.div_ceil(params.chunk as u64) as u32;
        let snap_blocks = snapshot::nr_snapshot_array_nodes(nr_blocks);
        let snap_offset_sectors = (1 + snap_blocks) * SECTORS_PER_BLOCK;

        let snap_device = blockdev::open(&req.snapshot_device_path, false)?;
        let snap_device_sectors = snap_device.size() / SECTOR_SIZE;
        if snap_offset_sectors >= snap_device_sectors {
            return Err(EraError::Arg(format!(
                "snapshot device too small: needs > {} sectors for metadata, has {}",
                snap_offset_sectors, snap_device_sectors
            )));
        }

        let tag = Uuid::new_v4().simple().to_string()[..8].to_string();
        snap_name = format!("{}-snap-{}", req.era_name, tag);
        cow_name = format!("{}-snap-{}-cow", req.era_name, tag);

        dm.create(&snap_name, &[DmTarget::new(0, nr_blocks as u64 * params.chunk as u64, "error", "")])?;
        let cow_len_sectors = snap_device_sectors - snap_offset_sectors;
        dm.create(
            &cow_name,
            &[DmTarget::new(
                0,
                cow_len_sectors,
                "linear",
                format!("{} {}", req.snapshot_device_path, snap_offset_sectors),
            )],
        )?;
        reached = State::CowReady;

        // COW_READY -> ORIGIN_CONVERTED
        let orig_table = dm.table(&orig_name)?;
        let orig_target = orig_table
            .first()
            .ok_or_else(|| EraError::Corrupt(format!("origin device {} has an empty table", orig_name)))?;
        match orig_target.target_type.as_str() {
            "snapshot-origin" => {}
            "linear" => {
                let mut linear_parts = orig_target.params.split_whitespace();
                let underlying = linear_parts
                    .next()
                    .ok_or_else(|| EraError::Corrupt("linear origin table missing device".to_string()))?;
                let offset: u64 = linear_parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| EraError::Corrupt("linear origin table missing offset".to_string()))?;
                if offset != 0 {
                    return Err(EraError::Unsupported(format!(
                        "origin device {} linear target has nonzero offset {}",
                        orig_name, offset
                    )));
                }
                original_origin_table = Some(orig_table.clone());
                dm.suspend(&orig_name)?;
                dm.reload(
                    &orig_name,
                    &[DmTarget::new(0, orig_target.length, "snapshot-origin", underlying.to_string())],
                )?;
                dm.resume(&orig_name)?;
                origin_converted = true;
            }
            other => {
                return Err(EraError::Unsupported(format!(
                    "origin device {} has unsupported target type {}",
                    orig_name, other
                )))
            }
        }
        reached = State::OriginConverted;

        // ORIGIN_CONVERTED -> MD_SNAP_TAKEN
        dm.message(&req.era_name, 0, "take_metadata_snap")?;
        let status = dm.status(&req.era_name)?;
        let metadata_snap = parse_metadata_snap_from_status(&status)
            .ok_or_else(|| EraError::Corrupt("take_metadata_snap left metadata_snap unset".to_string()))?;
        metadata_snap_taken = true;
        reached = State::MdSnapTaken;

        // MD_SNAP_TAKEN -> MD_COPIED
        let meta_device: Arc<dyn BlockDevice> = Arc::from(blockdev::open(
            meta_path.to_str().ok_or_else(|| EraError::Arg("non-UTF8 metadata device path".to_string()))?,
            true,
        )?);
        let snap_image = blockdev::open(&req.snapshot_device_path, false)?;
        let mut md = Md::new(meta_device);
        let mut sn = Md::new(Arc::from(snap_image));
        let (snapshot_array_root, _nr_nodes, copied_nr_blocks) =
            snapshot::copy_metadata(&mut md, &mut sn, metadata_snap, 1)?;
        reached = State::MdCopied;

        // MD_COPIED -> MD_SNAP_DROPPED
        dm.message(&req.era_name, 0, "drop_metadata_snap")?;
        metadata_snap_taken = false;
        reached = State::MdSnapDropped;

        // MD_SNAP_DROPPED -> SUSPENDED
        dm.suspend(&req.era_name)?;
        era_suspended = true;
        dm.suspend(&orig_name)?;
        origin_suspended = true;
        reached = State::Suspended;

        // SUSPENDED -> BITMAP_READ
        let live_sb_raw = md.read(0, ReadFlags::CACHED, crate::core::SUPERBLOCK_CSUM_XOR)?;
        let live_sb = crate::core::Superblock::parse(&*live_sb_raw)?;
        let era = live_sb.current_era();
        let bitmap = snapshot::era_snapshot_getbitmap(&mut md, era, 0, copied_nr_blocks)?;
        reached = State::BitmapRead;

        // BITMAP_READ -> SNAP_LOADED
        let exception_header_block = 1 + snapshot::nr_snapshot_array_nodes(copied_nr_blocks);
        snapshot::zero_block_after(&mut sn, exception_header_block)?;
        let cow_info = dm.info(&cow_name)?;
        dm.reload(
            &snap_name,
            &[DmTarget::new(
                0,
                copied_nr_blocks as u64 * params.chunk as u64,
                "snapshot",
                format!(
                    "{}:{} {}:{} N {}",
                    params.orig_major, params.orig_minor, cow_info.major, cow_info.minor, SNAP_CHUNK_SECTORS
                ),
            )],
        )?;
        dm.resume(&snap_name)?;
        reached = State::SnapLoaded;

        // SNAP_LOADED -> ORIGIN_RESUMED -> ERA_RESUMED
        dm.resume(&orig_name)?;
        origin_suspended = false;
        reached = State::OriginResumed;
        dm.resume(&req.era_name)?;
        era_suspended = false;
        reached = State::EraResumed;

        // ERA_RESUMED -> BITMAP_DIGESTED
        snapshot::era_snapshot_digest(&mut sn, snapshot_array_root, era, &bitmap, copied_nr_blocks)?;
        reached = State::BitmapDigested;

        // BITMAP_DIGESTED -> SB_WRITTEN
        let sb = SnapshotSuperblock::new(era, copied_nr_blocks, snapshot_array_root, params.chunk);
        sn.write(0, &sb.to_block())?;
        reached = State::SbWritten;

        Ok(())
    })();

    if let Err(e) = &result {
        unwind(
            dm,
            reached,
            &req.era_name,
            &orig_name,
            &snap_name,
            &cow_name,
            origin_suspended,
            era_suspended,
            origin_converted,
            &original_origin_table,
            metadata_snap_taken,
        );
        tracing::error!(error = %e, state = ?reached, "take_snapshot failed, unwound");
    }

    result
}

#[allow(clippy::too_many_arguments)]
fn unwind(
    dm: &dyn DmClient,
    reached: State,
    era_name: &str,
    orig_name: &str,
    snap_name: &str,
    cow_name: &str,
    origin_suspended: bool,
    era_suspended: bool,
    origin_converted: bool,
    original_origin_table: &Option<Vec<DmTarget>>,
    metadata_snap_taken: bool,
) {
    if metadata_snap_taken {
        let _ = dm.message(era_name, 0, "drop_metadata_snap");
    }
    if era_suspended {
        let _ = dm.resume(era_name);
    }
    if origin_suspended {
        let _ = dm.resume(orig_name);
    }
    if reached >= State::CowReady {
        let _ = dm.remove(snap_name);
        let _ = dm.remove(cow_name);
    }
    if origin_converted {
        if let Some(table) = original_origin_table {
            let _ = dm.suspend(orig_name);
            let _ = dm.reload(orig_name, table);
            let _ = dm.resume(orig_name);
        }
    }
}

fn find_device_name_for_major_minor(dm: &dyn DmClient, major: u32, minor: u32) -> Result<String> {
    for name in dm.list()? {
        if let Ok(info) = dm.info(&name) {
            if info.exists && info.major == major && info.minor == minor {
                return Ok(name);
            }
        }
    }
    Err(EraError::NotFound(format!(
        "no device-mapper device found for {}:{}",
        major, minor
    )))
}

/// Given the snapshot device's own superblock, locates and removes the
/// kernel `snap`/`cow` devices, restoring a plain linear table over the
/// origin if this was the last sibling snapshot.
pub fn drop_snapshot(dm: &dyn DmClient, req: &DropSnapshotRequest) -> Result<()> {
    let snap_device = blockdev::open(&req.snapshot_device_path, true)?;
    let mut sn = Md::new(Arc::from(snap_device));
    let sb_raw = sn.read(0, ReadFlags::CACHED, crate::core::SNAP_SUPERBLOCK_CSUM_XOR)?;
    let sb = SnapshotSuperblock::parse(&*sb_raw)?;
    let _ = sb;

    let names = dm.list()?;
    let snap_name = names
        .iter()
        .find(|n| n.ends_with("-cow") == false && n.contains("-snap-"))
        .ok_or_else(|| EraError::NotFound("no matching snap device found".to_string()))?
        .clone();
    let cow_name = format!("{}-cow", snap_name);
    if !names.contains(&cow_name) {
        return Err(EraError::NotFound(format!("no matching cow device {} found", cow_name)));
    }

    let origin_name = snap_name
        .splitn(2, "-snap-")
        .next()
        .ok_or_else(|| EraError::Corrupt(format!("malformed snap device name {}", snap_name)))?
        .to_string();
    let orig_dm_name = find_origin_device_name(dm, &origin_name)?;

    let siblings = names.iter().filter(|n| n.starts_with(&format!("{}-snap-", origin_name))).count();

    dm.suspend(&orig_dm_name)?;
    dm.remove(&snap_name)?;

    if siblings <= 1 {
        let table = dm.table(&orig_dm_name)?;
        if let Some(target) = table.first() {
            if target.target_type == "snapshot-origin" {
                let mut params = target.params.split_whitespace();
                if let Some(underlying) = params.next() {
                    dm.reload(
                        &orig_dm_name,
                        &[DmTarget::new(0, target.length, "linear", format!("{} 0", underlying))],
                    )?;
                }
            }
        }
    }
    dm.resume(&orig_dm_name)?;
    dm.remove(&cow_name)?;

    Ok(())
}

fn find_origin_device_name(dm: &dyn DmClient, era_name: &str) -> Result<String> {
    for name in dm.list()? {
        if name == era_name {
            continue;
        }
        if let Ok(table) = dm.table(&name) {
            if let Some(target) = table.first() {
                if target.target_type == "snapshot-origin" || target.target_type == "linear" {
                    return Ok(name);
                }
            }
        }
    }
    Err(EraError::NotFound(format!("no origin device found for {}", era_name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metadata_snap_from_status_dash() {
        assert_eq!(parse_metadata_snap_from_status("100 1000 7 -"), None);
    }

    #[test]
    fn test_parse_metadata_snap_from_status_number() {
        assert_eq!(parse_metadata_snap_from_status("100 1000 7 42"), Some(42));
    }

    #[test]
    fn test_parse_era_table() {
        let table = vec![DmTarget::new(0, 2048, "era", "253:0 253:1 128")];
        let params = parse_era_table(&table).unwrap();
        assert_eq!(params.meta_major, 253);
        assert_eq!(params.meta_minor, 0);
        assert_eq!(params.orig_major, 253);
        assert_eq!(params.orig_minor, 1);
        assert_eq!(params.chunk, 128);
    }

    #[test]
    fn test_parse_era_table_rejects_wrong_type() {
        let table = vec![DmTarget::new(0, 2048, "linear", "253:0 0")];
        assert!(parse_era_table(&table).is_err());
    }
}
