//! Physical block device access for Linux
//!
//! Opens a block special file with `O_DIRECT`, as the metadata/data/
//! snapshot devices handed to `erasetup` normally are, and reads its size
//! through the `BLKGETSIZE64` ioctl rather than trusting `stat`'s `st_size`
//! (which is 0 for block devices).

use super::{BlockDevice, BlockDeviceError, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::sync::RwLock;

// BLKGETSIZE64 is `_IOR(0x12, 114, size_t)`; nix's ioctl_read! generates the
// request-code arithmetic and a typed wrapper around the raw ioctl(2) call.
nix::ioctl_read!(ioctl_blkgetsize64, 0x12, 114, u64);

const SECTOR_SIZE: u32 = 512;

/// A Linux block special file opened for direct I/O.
pub struct PhysicalDevice {
    file: RwLock<File>,
    path: String,
    size: u64,
    read_only: bool,
}

impl PhysicalDevice {
    /// Opens a block device by path, e.g. `/dev/mapper/era0`.
    pub fn open(path: &str, read_only: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .custom_flags(libc::O_DIRECT)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    BlockDeviceError::NotFound(path.to_string())
                } else {
                    BlockDeviceError::Io(e)
                }
            })?;

        let st = nix::sys::stat::fstat(file.as_raw_fd())?;
        if (st.st_mode & libc::S_IFMT) != libc::S_IFBLK {
            return Err(BlockDeviceError::NotABlockDevice(path.to_string()));
        }

        let size = blkgetsize64(&file)?;

        Ok(Self {
            file: RwLock::new(file),
            path: path.to_string(),
            size,
            read_only,
        })
    }

    /// Returns the path this device was opened from.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Extracts `(major, minor)` from the device's `st_rdev`, as the
    /// orchestrator needs when building device-mapper tables that
    /// reference this device by number.
    pub fn major_minor(&self) -> Result<(u32, u32)> {
        let file = self.file.read().unwrap();
        let st = nix::sys::stat::fstat(file.as_raw_fd())?;
        let rdev = st.st_rdev;
        Ok((
            unsafe { libc::major(rdev) },
            unsafe { libc::minor(rdev) },
        ))
    }
}

fn blkgetsize64(file: &File) -> Result<u64> {
    let mut size: u64 = 0;
    unsafe { ioctl_blkgetsize64(file.as_raw_fd(), &mut size as *mut u64) }?;
    Ok(size)
}

impl BlockDevice for PhysicalDevice {
    fn size(&self) -> u64 {
        self.size
    }

    fn sector_size(&self) -> u32 {
        SECTOR_SIZE
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        use std::os::unix::fs::FileExt;

        if offset >= self.size {
            return Err(BlockDeviceError::InvalidOffset {
                offset,
                size: self.size,
            });
        }

        let file = self.file.read().unwrap();
        Ok(file.read_at(buf, offset)?)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        use std::os::unix::fs::FileExt;

        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        if offset >= self.size {
            return Err(BlockDeviceError::InvalidOffset {
                offset,
                size: self.size,
            });
        }

        let file = self.file.write().unwrap();
        Ok(file.write_at(buf, offset)?)
    }

    fn flush_device(&self) -> Result<()> {
        self.file.write().unwrap().sync_data()?;
        Ok(())
    }
}

unsafe impl Send for PhysicalDevice {}
unsafe impl Sync for PhysicalDevice {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device() {
        let result = PhysicalDevice::open("/dev/erasetup-test-nonexistent", true);
        assert!(result.is_err());
    }

    #[test]
    fn test_open_regular_file_rejected() {
        use tempfile::NamedTempFile;
        let temp = NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), vec![0u8; 4096]).unwrap();
        // A regular file opened with O_DIRECT may succeed on some
        // filesystems, but fstat must still reject it as not-a-block-device.
        let result = PhysicalDevice::open(temp.path().to_str().unwrap(), true);
        match result {
            Err(BlockDeviceError::NotABlockDevice(_)) | Err(BlockDeviceError::Io(_)) => {}
            other => panic!("expected rejection, got {:?}", other.map(|_| ())),
        }
    }
}
