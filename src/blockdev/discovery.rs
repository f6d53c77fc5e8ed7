//! Block-device discovery
//!
//! Given a `(major, minor)` pair recorded in a device-mapper table or
//! status line, resolves the devnode path that can actually be opened.
//! Tries, in order: the stable `/dev/block/<major>:<minor>` symlink, the
//! `DEVNAME=` line of the matching `/sys/dev/block` uevent file, and
//! finally a recursive scan of `/dev` comparing `st_rdev`.

use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use super::{BlockDeviceError, Result};

/// Resolves `(major, minor)` to an openable device path.
pub fn resolve_devnode(major: u32, minor: u32) -> Result<PathBuf> {
    let by_block = PathBuf::from(format!("/dev/block/{}:{}", major, minor));
    if by_block.exists() {
        return Ok(by_block);
    }

    if let Some(path) = resolve_via_uevent(major, minor)? {
        return Ok(path);
    }

    if let Some(path) = scan_dev(Path::new("/dev"), major, minor)? {
        return Ok(path);
    }

    Err(BlockDeviceError::NotFound(format!(
        "no devnode for {}:{}",
        major, minor
    )))
}

fn resolve_via_uevent(major: u32, minor: u32) -> Result<Option<PathBuf>> {
    let uevent_path = format!("/sys/dev/block/{}:{}/uevent", major, minor);
    let contents = match fs::read_to_string(&uevent_path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(BlockDeviceError::Io(e)),
    };

    for line in contents.lines() {
        if let Some(name) = line.strip_prefix("DEVNAME=") {
            return Ok(Some(PathBuf::from("/dev").join(name)));
        }
    }
    Ok(None)
}

fn scan_dev(dir: &Path, major: u32, minor: u32) -> Result<Option<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return Ok(None),
    };

    for entry in entries {
        let entry = entry.map_err(BlockDeviceError::Io)?;
        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(ft) => ft,
            Err(_) => continue,
        };

        if file_type.is_dir() {
            if let Some(found) = scan_dev(&path, major, minor)? {
                return Ok(Some(found));
            }
            continue;
        }

        if !file_type.is_block_device() {
            continue;
        }

        if let Ok(metadata) = fs::metadata(&path) {
            use std::os::unix::fs::MetadataExt;
            let rdev = metadata.rdev();
            let (m, n) = unsafe { (libc::major(rdev), libc::minor(rdev)) };
            if m == major && n == minor {
                return Ok(Some(path));
            }
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_via_uevent_missing() {
        // A major:minor pair that almost certainly has no /sys entry.
        let result = resolve_via_uevent(4095, 4095).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_resolve_devnode_not_found() {
        let result = resolve_devnode(4095, 4095);
        assert!(matches!(result, Err(BlockDeviceError::NotFound(_))));
    }
}
