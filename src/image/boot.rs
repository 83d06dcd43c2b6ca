//! Boot partition contents.
//!
//! The boot partition is FAT32 and holds systemd-boot, its loader
//! configuration, one boot entry and the kernel. The boot entry pins the
//! root filesystem by partition UUID; the appliance rewrites it when it
//! switches to the other root.

use crate::config::BootConfig;
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

pub const ENTRY_NAME: &str = "rootcast";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootFileSource {
    Path(PathBuf),
    Inline(Vec<u8>),
}

/// A file placed on the boot partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootFile {
    /// Path inside the partition, `/`-separated, no leading slash.
    pub dest: String,
    pub source: BootFileSource,
}

impl BootFile {
    fn path(dest: &str, src: &std::path::Path) -> Self {
        Self {
            dest: dest.to_string(),
            source: BootFileSource::Path(src.to_path_buf()),
        }
    }

    fn inline(dest: &str, content: String) -> Self {
        Self {
            dest: dest.to_string(),
            source: BootFileSource::Inline(content.into_bytes()),
        }
    }

    pub fn len(&self) -> std::io::Result<u64> {
        match &self.source {
            BootFileSource::Path(p) => Ok(fs::metadata(p)?.len()),
            BootFileSource::Inline(b) => Ok(b.len() as u64),
        }
    }

    pub fn read(&self) -> std::io::Result<Vec<u8>> {
        match &self.source {
            BootFileSource::Path(p) => fs::read(p),
            BootFileSource::Inline(b) => Ok(b.clone()),
        }
    }
}

fn efi_names(goarch: &str) -> (&'static str, &'static str) {
    match goarch {
        "arm64" => ("EFI/BOOT/BOOTAA64.EFI", "EFI/systemd/systemd-bootaa64.efi"),
        _ => ("EFI/BOOT/BOOTX64.EFI", "EFI/systemd/systemd-bootx64.efi"),
    }
}

pub fn loader_conf() -> String {
    format!("default {}.conf\ntimeout 0\nconsole-mode keep\n", ENTRY_NAME)
}

pub fn boot_entry(root_partuuid: &Uuid, has_initrd: bool, extra_cmdline: &str) -> String {
    let mut entry = format!("title {}\nlinux /vmlinuz\n", ENTRY_NAME);
    if has_initrd {
        entry.push_str("initrd /initrd.img\n");
    }
    let mut options = format!("root=PARTUUID={} rootfstype=squashfs ro", root_partuuid);
    let extra = extra_cmdline.trim();
    if !extra.is_empty() {
        options.push(' ');
        options.push_str(extra);
    }
    entry.push_str(&format!("options {}\n", options));
    entry
}

/// Files of the boot partition, in the order they are written.
pub fn boot_files(boot: &BootConfig, root_partuuid: &Uuid, goarch: &str) -> Vec<BootFile> {
    let (fallback, systemd) = efi_names(goarch);
    let mut files = vec![
        BootFile::path(fallback, &boot.loader_efi),
        BootFile::path(systemd, &boot.loader_efi),
        BootFile::inline("loader/loader.conf", loader_conf()),
        BootFile::inline(
            &format!("loader/entries/{}.conf", ENTRY_NAME),
            boot_entry(root_partuuid, boot.initrd.is_some(), &boot.cmdline),
        ),
        BootFile::path("vmlinuz", &boot.kernel),
    ];
    if let Some(ref initrd) = boot.initrd {
        files.push(BootFile::path("initrd.img", initrd));
    }
    files
}

/// Total payload bytes, failing if a payload file is missing.
pub fn payload_size(files: &[BootFile]) -> std::io::Result<u64> {
    let mut total = 0;
    for file in files {
        total += file.len().map_err(|e| {
            std::io::Error::new(e.kind(), format!("boot payload {}: {}", file.dest, e))
        })?;
    }
    Ok(total)
}

/// FAT volume ID derived from the disk GUID.
pub fn volume_id(disk_guid: &Uuid) -> u32 {
    let b = disk_guid.to_bytes_le();
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}
