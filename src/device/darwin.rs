//! macOS disk ioctls.

use super::{BlockDevice, DeviceError};
use std::fs::File;
use std::os::fd::AsRawFd;

// <sys/disk.h>
nix::ioctl_read!(dkiocgetblocksize, b'd', 24, u32);
nix::ioctl_read!(dkiocgetblockcount, b'd', 25, u64);
nix::ioctl_none!(dkiocsynchronizecache, b'd', 22);

#[derive(Debug, Clone, Copy, Default)]
pub struct DarwinDevice;

fn io_error(operation: &'static str) -> impl FnOnce(nix::errno::Errno) -> DeviceError {
    move |errno| DeviceError::Io {
        operation,
        source: errno.into(),
    }
}

impl BlockDevice for DarwinDevice {
    fn size(&self, device: &File) -> Result<u64, DeviceError> {
        let mut block_size: u32 = 0;
        let mut block_count: u64 = 0;
        // SAFETY: the fd is valid for the lifetime of `device` and the
        // out-parameters have the widths <sys/disk.h> declares.
        unsafe { dkiocgetblocksize(device.as_raw_fd(), &mut block_size) }
            .map_err(io_error("DKIOCGETBLOCKSIZE"))?;
        unsafe { dkiocgetblockcount(device.as_raw_fd(), &mut block_count) }
            .map_err(io_error("DKIOCGETBLOCKCOUNT"))?;
        block_count
            .checked_mul(u64::from(block_size))
            .ok_or(DeviceError::Io {
                operation: "DKIOCGETBLOCKCOUNT",
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, "size overflows u64"),
            })
    }

    /// Flush the drive cache. IOKit re-probes the partition map when the
    /// last writer closes the whole-disk node, so the caller must drop
    /// `device` afterwards.
    fn reload_partition_table(&self, device: &File) -> Result<(), DeviceError> {
        // SAFETY: DKIOCSYNCHRONIZECACHE takes no argument; the fd is valid.
        unsafe { dkiocsynchronizecache(device.as_raw_fd()) }
            .map_err(io_error("DKIOCSYNCHRONIZECACHE"))?;
        Ok(())
    }
}
