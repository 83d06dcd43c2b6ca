//! Scoped temporary work directories.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A temporary work directory that is removed when dropped.
///
/// Removal is best effort: a failure is logged and never replaces the error
/// that caused the scope to unwind.
#[derive(Debug)]
pub struct ScratchDir {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl ScratchDir {
    /// Create a fresh directory named `<prefix>XXXXXX` in the system temp dir.
    pub fn new(prefix: &str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir()
            .with_context(|| format!("Failed to create temporary directory {}*", prefix))?;
        let path = dir.path().to_path_buf();
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the directory on disk (`--keep`), returning its path.
    pub fn keep(mut self) -> PathBuf {
        match self.dir.take() {
            Some(dir) => dir.into_path(),
            None => self.path.clone(),
        }
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                log::warn!(
                    "failed to remove temporary directory {}: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_removed_on_drop() {
        let scratch = ScratchDir::new("rootcast-test-").unwrap();
        let path = scratch.path().to_path_buf();
        fs::write(path.join("file"), b"x").unwrap();
        drop(scratch);
        assert!(!path.exists());
    }

    #[test]
    fn test_removed_on_error_path() {
        fn failing(path_out: &mut PathBuf) -> Result<()> {
            let scratch = ScratchDir::new("rootcast-test-")?;
            *path_out = scratch.path().to_path_buf();
            anyhow::bail!("compile failed")
        }
        let mut path = PathBuf::new();
        assert!(failing(&mut path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_keep() {
        let scratch = ScratchDir::new("rootcast-test-").unwrap();
        let expected = scratch.path().to_path_buf();
        let path = scratch.keep();
        assert_eq!(path, expected);
        assert!(path.exists());
        fs::remove_dir_all(&path).unwrap();
    }
}
