//! mtools file operations for FAT32 image manipulation.
//!
//! Every call pins `SOURCE_DATE_EPOCH` so directory entries carry a fixed
//! timestamp instead of the build time.

use crate::process::Cmd;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Timestamp written into FAT directory entries (1980-01-01, the FAT epoch).
pub const FAT_EPOCH: &str = "315532800";

fn mtool(program: &str, image: &Path) -> Cmd {
    Cmd::new(program)
        .env("SOURCE_DATE_EPOCH", FAT_EPOCH)
        .env("MTOOLS_SKIP_CHECK", "1")
        .arg("-i")
        .arg_path(image)
}

/// Create a directory (`EFI/BOOT`) inside the image.
pub fn mtools_mkdir(image: &Path, dir: &str) -> Result<()> {
    mtool("mmd", image)
        .arg(format!("::/{}", dir))
        .error_msg(format!("mmd {} failed", dir))
        .run()?;
    Ok(())
}

/// Copy a host file into the image.
pub fn mtools_copy(image: &Path, src: &Path, dest: &str) -> Result<()> {
    mtool("mcopy", image)
        .arg("-o")
        .arg_path(src)
        .arg(format!("::/{}", dest))
        .error_msg(format!("mcopy {} -> {} failed", src.display(), dest))
        .run()?;
    Ok(())
}

/// Write `content` to `dest` inside the image.
pub fn mtools_write_file(image: &Path, dest: &str, content: &[u8]) -> Result<()> {
    let staged = tempfile::NamedTempFile::new().context("Failed to create temp file for mcopy")?;
    fs::write(staged.path(), content)
        .with_context(|| format!("Failed to stage {} for mcopy", dest))?;
    mtools_copy(image, staged.path(), dest)
}

/// Create every parent directory of `dest` that is not yet in `created`.
pub fn mtools_mkdir_parents(
    image: &Path,
    dest: &str,
    created: &mut std::collections::BTreeSet<String>,
) -> Result<()> {
    let mut prefix = String::new();
    let parts: Vec<&str> = dest.split('/').collect();
    for part in &parts[..parts.len().saturating_sub(1)] {
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(part);
        if created.insert(prefix.clone()) {
            mtools_mkdir(image, &prefix)?;
        }
    }
    Ok(())
}
