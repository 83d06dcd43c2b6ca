//! Linux block device ioctls.

use super::{BlockDevice, DeviceError};
use nix::errno::Errno;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::thread;
use std::time::Duration;

// <linux/fs.h>: BLKGETSIZE64 = _IOR(0x12, 114, size_t), BLKRRPART = _IO(0x12, 95)
nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);
nix::ioctl_none!(blkrrpart, 0x12, 95);

/// udev commonly holds the device open right after we close a partition.
const RELOAD_ATTEMPTS: u32 = 5;
const RELOAD_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxDevice;

impl BlockDevice for LinuxDevice {
    fn size(&self, device: &File) -> Result<u64, DeviceError> {
        let mut size: u64 = 0;
        // SAFETY: the fd is valid for the lifetime of `device` and `size` is
        // a u64 as BLKGETSIZE64 requires.
        unsafe { blkgetsize64(device.as_raw_fd(), &mut size) }.map_err(|errno| {
            DeviceError::Io {
                operation: "BLKGETSIZE64",
                source: errno.into(),
            }
        })?;
        Ok(size)
    }

    fn reload_partition_table(&self, device: &File) -> Result<(), DeviceError> {
        let mut attempt = 1;
        loop {
            // SAFETY: BLKRRPART takes no argument; the fd is valid.
            match unsafe { blkrrpart(device.as_raw_fd()) } {
                Ok(_) => return Ok(()),
                Err(Errno::EBUSY) if attempt < RELOAD_ATTEMPTS => {
                    log::debug!("BLKRRPART: device busy, retry {}", attempt);
                    thread::sleep(RELOAD_BACKOFF * attempt);
                    attempt += 1;
                }
                Err(errno) => {
                    return Err(DeviceError::Io {
                        operation: "BLKRRPART",
                        source: errno.into(),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_of_regular_file_is_rejected() {
        let tmp = tempfile::tempfile().unwrap();
        let err = LinuxDevice.size(&tmp).unwrap_err();
        assert!(matches!(err, DeviceError::Io { operation: "BLKGETSIZE64", .. }));
    }

    #[test]
    fn test_reload_on_regular_file_is_rejected() {
        let tmp = tempfile::tempfile().unwrap();
        let err = LinuxDevice.reload_partition_table(&tmp).unwrap_err();
        assert!(matches!(err, DeviceError::Io { operation: "BLKRRPART", .. }));
    }
}
