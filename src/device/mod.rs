//! Block device primitives: capacity and partition table reload.
//!
//! Both operations need OS-specific syscalls, implemented for Linux and
//! macOS. Other platforms get [`UnsupportedDevice`], which fails every call with
//! [`DeviceError::Unsupported`]. Skipping a reload would leave the kernel
//! with a partition table that no longer matches the disk, so there is no
//! no-op fallback.

use std::fs::File;
use std::io;
use std::path::Path;
use thiserror::Error;

#[cfg(target_os = "macos")]
mod darwin;
#[cfg(target_os = "linux")]
mod linux;
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
mod unsupported;

#[cfg(target_os = "macos")]
pub use darwin::DarwinDevice;
#[cfg(target_os = "linux")]
pub use linux::LinuxDevice;
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub use unsupported::UnsupportedDevice;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(
        "rootcast is missing code for {operation} on {os}; \
         write the image to a file and copy it to the device instead"
    )]
    Unsupported {
        operation: &'static str,
        os: &'static str,
    },

    #[error("{operation} failed: {source}")]
    Io {
        operation: &'static str,
        source: io::Error,
    },
}

/// OS access to an open block device.
pub trait BlockDevice {
    /// Addressable size of the device in bytes.
    fn size(&self, device: &File) -> Result<u64, DeviceError>;

    /// Make the kernel re-read the partition table of `device`.
    fn reload_partition_table(&self, device: &File) -> Result<(), DeviceError>;
}

/// The implementation compiled in for this platform.
#[cfg(target_os = "linux")]
pub fn platform() -> LinuxDevice {
    LinuxDevice
}

/// The implementation compiled in for this platform.
#[cfg(target_os = "macos")]
pub fn platform() -> DarwinDevice {
    DarwinDevice
}

/// The implementation compiled in for this platform.
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn platform() -> UnsupportedDevice {
    UnsupportedDevice
}

/// Whether `path` names a block device (as opposed to an image file).
#[cfg(unix)]
pub fn is_block_device(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false)
}

/// Whether `path` names a block device (as opposed to an image file).
#[cfg(not(unix))]
pub fn is_block_device(_path: &Path) -> bool {
    false
}
