//! Fallback for platforms without block device support.

use super::{BlockDevice, DeviceError};
use std::fs::File;

#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedDevice;

impl BlockDevice for UnsupportedDevice {
    fn size(&self, _device: &File) -> Result<u64, DeviceError> {
        Err(DeviceError::Unsupported {
            operation: "getting device sizes",
            os: std::env::consts::OS,
        })
    }

    fn reload_partition_table(&self, _device: &File) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported {
            operation: "re-reading partition tables",
            os: std::env::consts::OS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_call_fails_loudly() {
        let tmp = tempfile::tempfile().unwrap();
        assert!(matches!(
            UnsupportedDevice.size(&tmp),
            Err(DeviceError::Unsupported { .. })
        ));
        assert!(matches!(
            UnsupportedDevice.reload_partition_table(&tmp),
            Err(DeviceError::Unsupported { .. })
        ));
    }
}
