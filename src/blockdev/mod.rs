//! Block device abstraction layer
//!
//! Unified interface over the two kinds of backing store the engine reads
//! and writes: real Linux block special files (metadata/data/snapshot
//! devices) and regular image files (used by `create`'s image-backed mode
//! and by tests).

pub mod discovery;
pub mod image;
pub mod physical;

use thiserror::Error;

pub use discovery::resolve_devnode;
pub use image::ImageFile;
pub use physical::PhysicalDevice;

/// Errors that can occur during block device operations.
#[derive(Error, Debug)]
pub enum BlockDeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("invalid offset: {offset} (device size: {size})")]
    InvalidOffset { offset: u64, size: u64 },

    #[error("read beyond end of device")]
    ReadBeyondEnd,

    #[error("device is read-only")]
    ReadOnly,

    #[error("not a block device: {0}")]
    NotABlockDevice(String),

    #[error("ioctl failed: {0}")]
    Ioctl(#[from] nix::errno::Errno),
}

pub type Result<T> = std::result::Result<T, BlockDeviceError>;

/// Trait for block device access.
pub trait BlockDevice: Send + Sync {
    /// Returns the total size of the device in bytes.
    fn size(&self) -> u64;

    /// Returns the sector size of the device.
    fn sector_size(&self) -> u32;

    /// Returns true if the device is read-only.
    fn is_read_only(&self) -> bool;

    /// Reads data at the specified offset.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Writes data at the specified offset.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize>;

    /// Flushes any buffered data to the device.
    fn flush_device(&self) -> Result<()>;
}

/// Opens a block device from the given path.
///
/// A path that stats as a block special file is opened as a
/// [`PhysicalDevice`] with `O_DIRECT`; anything else (a regular file,
/// typically created by `create` for image-backed testing) is opened as an
/// [`ImageFile`].
pub fn open(path: &str, read_only: bool) -> Result<Box<dyn BlockDevice>> {
    match nix::sys::stat::stat(path) {
        Ok(st) if (st.st_mode & libc::S_IFMT) == libc::S_IFBLK => {
            Ok(Box::new(PhysicalDevice::open(path, read_only)?))
        }
        Ok(_) => Ok(Box::new(ImageFile::open(path, read_only)?)),
        Err(nix::errno::Errno::ENOENT) => Err(BlockDeviceError::NotFound(path.to_string())),
        Err(e) => Err(BlockDeviceError::Ioctl(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_device_error_display() {
        let err = BlockDeviceError::NotFound("test".to_string());
        assert_eq!(format!("{}", err), "device not found: test");

        let err = BlockDeviceError::InvalidOffset {
            offset: 1000,
            size: 500,
        };
        assert!(format!("{}", err).contains("1000"));
        assert!(format!("{}", err).contains("500"));

        let err = BlockDeviceError::ReadOnly;
        assert!(format!("{}", err).contains("read-only"));
    }

    #[test]
    fn test_open_image_file() {
        use tempfile::NamedTempFile;

        let temp = NamedTempFile::new().unwrap();
        let path = temp.path().to_str().unwrap();

        std::fs::write(path, vec![0u8; 1024]).unwrap();

        let device = open(path, true).unwrap();
        assert_eq!(device.size(), 1024);
        assert!(device.is_read_only());
    }

    #[test]
    fn test_open_nonexistent_file() {
        let result = open("/nonexistent/path/to/file.img", true);
        assert!(matches!(result, Err(BlockDeviceError::NotFound(_))));
    }
}
