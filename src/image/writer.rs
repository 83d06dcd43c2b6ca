//! Writing an assembled layout to its output target.
//!
//! Both targets receive the same bytes: the primary GPT at the start, the
//! boot and root A partition images at their offsets and the backup GPT at
//! the end. A file target is written under a temporary name and renamed
//! into place on success.

use super::layout::{PartitionLayout, PartitionRole};
use super::ImageError;
use crate::device::BlockDevice;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Filesystem images of the partitions that carry content.
#[derive(Debug, Clone)]
pub struct PartitionImages {
    pub boot: PathBuf,
    pub root: PathBuf,
}

/// An opened block device.
pub struct DeviceTarget {
    path: PathBuf,
    file: File,
}

impl DeviceTarget {
    pub fn open(path: &Path) -> Result<Self, ImageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(ImageError::io(path))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self, ops: &dyn BlockDevice) -> Result<u64, ImageError> {
        Ok(ops.size(&self.file)?)
    }

    /// Write the image, flush it and ask the kernel to re-read the table.
    pub fn write(
        mut self,
        ops: &dyn BlockDevice,
        layout: &PartitionLayout,
        images: &PartitionImages,
    ) -> Result<(), ImageError> {
        write_all_parts(&mut self.file, layout, images).map_err(ImageError::io(&self.path))?;
        self.file.sync_all().map_err(ImageError::io(&self.path))?;
        ops.reload_partition_table(&self.file)?;
        Ok(())
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

/// Write a complete disk image file at `path`.
///
/// The file is sparse: regions without content read back as zeros.
pub fn write_image_file(
    path: &Path,
    layout: &PartitionLayout,
    images: &PartitionImages,
) -> Result<(), ImageError> {
    let partial = partial_path(path);
    let result = (|| -> io::Result<()> {
        let mut file = File::create(&partial)?;
        file.set_len(layout.capacity)?;
        write_all_parts(&mut file, layout, images)?;
        file.sync_all()
    })();

    if let Err(source) = result {
        if let Err(e) = fs::remove_file(&partial) {
            log::warn!("failed to remove {}: {}", partial.display(), e);
        }
        return Err(ImageError::Io {
            path: partial,
            source,
        });
    }
    fs::rename(&partial, path).map_err(ImageError::io(path))?;
    Ok(())
}

fn write_all_parts<W: Write + Seek>(
    out: &mut W,
    layout: &PartitionLayout,
    images: &PartitionImages,
) -> io::Result<()> {
    let table = layout.gpt();
    out.seek(SeekFrom::Start(0))?;
    out.write_all(&table.primary())?;

    for (role, image) in [
        (PartitionRole::Boot, &images.boot),
        (PartitionRole::RootA, &images.root),
    ] {
        let part = layout.get(role).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("layout has no {} partition", role))
        })?;
        copy_at(out, image, part.offset, part.size)?;
    }

    let (offset, backup) = table.backup();
    out.seek(SeekFrom::Start(offset))?;
    out.write_all(&backup)?;
    out.flush()
}

fn copy_at<W: Write + Seek>(out: &mut W, src: &Path, offset: u64, limit: u64) -> io::Result<()> {
    let mut input = File::open(src)?;
    let len = input.metadata()?.len();
    if len > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is {} bytes, partition holds {}", src.display(), len, limit),
        ));
    }
    out.seek(SeekFrom::Start(offset))?;
    let copied = io::copy(&mut input, out)?;
    log::debug!("wrote {} bytes of {} at offset {}", copied, src.display(), offset);
    Ok(())
}
