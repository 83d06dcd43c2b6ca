//! Disk image assembly.
//!
//! An image is made of four pieces: the GPT, a FAT32 boot partition, a
//! squashfs root filesystem in root A and, when configured, a data
//! partition that is left unformatted. Root B stays zeroed until the first
//! update writes it.

pub mod boot;
pub mod gpt;
pub mod layout;
pub mod mtools;
pub mod rootfs;
pub mod writer;

use crate::device::DeviceError;
use crate::process::Cmd;
use anyhow::Result;
use boot::{BootFile, BootFileSource};
use layout::LayoutError;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("{}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Tool(#[from] anyhow::Error),
}

impl ImageError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(io::Error) -> ImageError + '_ {
        move |source| ImageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Creates the filesystem images that go into partitions.
///
/// The host implementation runs mkfs.vfat, mtools and mksquashfs.
pub trait Imager {
    /// Create a FAT32 image of exactly `size` bytes at `out` holding `files`.
    fn boot_image(&self, files: &[BootFile], out: &Path, size: u64, volume_id: u32) -> Result<()>;

    /// Create a read-only root filesystem image of `staging` at `out`.
    fn root_image(&self, staging: &Path, out: &Path) -> Result<()>;

    /// Host tools this imager needs, checked before any work starts.
    fn required_tools(&self) -> &'static [&'static str] {
        &[]
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HostImager;

impl Imager for HostImager {
    fn boot_image(&self, files: &[BootFile], out: &Path, size: u64, volume_id: u32) -> Result<()> {
        {
            let file = fs::File::create(out)?;
            file.set_len(size)?;
        }

        Cmd::new("mkfs.vfat")
            .args(["-F", "32", "-n", "BOOT"])
            .args(["-i", &format!("{:08X}", volume_id)])
            .arg("--invariant")
            .arg_path(out)
            .error_msg("mkfs.vfat failed. Install dosfstools: sudo dnf install dosfstools")
            .run()?;

        let mut created = BTreeSet::new();
        for file in files {
            mtools::mtools_mkdir_parents(out, &file.dest, &mut created)?;
            match &file.source {
                BootFileSource::Path(src) => mtools::mtools_copy(out, src, &file.dest)?,
                BootFileSource::Inline(content) => {
                    mtools::mtools_write_file(out, &file.dest, content)?
                }
            }
        }
        Ok(())
    }

    fn root_image(&self, staging: &Path, out: &Path) -> Result<()> {
        rootfs::create_squashfs(staging, out)
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["mkfs.vfat", "mmd", "mcopy", "mksquashfs"]
    }
}
