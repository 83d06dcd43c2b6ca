//! Root filesystem staging and squashfs packing.
//!
//! The staging tree is the complete read-only root: compiled programs under
//! `/user`, the hostname, the SBOM and empty mount points for the pseudo
//! filesystems and the persistent data partition.

use crate::build::BuiltBinary;
use crate::process::Cmd;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Mount points the init process expects to exist on the read-only root.
pub const MOUNT_POINTS: &[&str] = &["dev", "proc", "sys", "tmp", "perm"];

pub const SBOM_PATH: &str = "etc/rootcast/sbom.json";

/// What goes into the root filesystem.
pub struct RootfsContents<'a> {
    pub hostname: &'a str,
    pub binaries: &'a [BuiltBinary],
    pub sbom_json: &'a [u8],
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    set_mode(path, 0o755)
}

/// Populate `staging` (which must be empty) with the root filesystem tree.
pub fn stage_rootfs(staging: &Path, contents: &RootfsContents<'_>) -> Result<()> {
    for dir in MOUNT_POINTS.iter().chain(["etc/rootcast", "user"].iter()) {
        create_dir(&staging.join(dir))?;
    }
    let tmp = staging.join("tmp");
    set_mode(&tmp, 0o1777)?;

    let hostname = staging.join("etc/hostname");
    fs::write(&hostname, format!("{}\n", contents.hostname))
        .with_context(|| format!("Failed to write {}", hostname.display()))?;
    set_mode(&hostname, 0o644)?;

    let sbom = staging.join(SBOM_PATH);
    fs::write(&sbom, contents.sbom_json)
        .with_context(|| format!("Failed to write {}", sbom.display()))?;
    set_mode(&sbom, 0o644)?;

    for binary in contents.binaries {
        let dest = staging.join("user").join(&binary.name);
        fs::copy(&binary.path, &dest).with_context(|| {
            format!(
                "Failed to copy {} into the root filesystem",
                binary.path.display()
            )
        })?;
        set_mode(&dest, 0o755)?;
    }
    log::debug!(
        "staged root filesystem with {} programs ({} bytes) at {}",
        contents.binaries.len(),
        tree_size(staging),
        staging.display()
    );
    Ok(())
}

/// Total size of the regular files below `dir`.
pub fn tree_size(dir: &Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Create a squashfs image of `staging` at `output`.
///
/// Timestamps and ownership are normalized so identical trees produce
/// identical images.
pub fn create_squashfs(staging: &Path, output: &Path) -> Result<()> {
    if output.exists() {
        fs::remove_file(output)?;
    }
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }

    Cmd::new("mksquashfs")
        .arg_path(staging)
        .arg_path(output)
        .args(["-comp", "gzip"])
        .args(["-b", "1M"])
        .args(["-all-time", "0", "-mkfs-time", "0"])
        .arg("-all-root")
        .arg("-no-xattrs")
        .arg("-noappend")
        .arg("-no-progress")
        .error_msg("mksquashfs failed. Install squashfs-tools: sudo dnf install squashfs-tools")
        .run()?;

    let metadata = fs::metadata(output)?;
    log::info!("squashfs created: {} MB", metadata.len() / 1024 / 1024);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_rootfs_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = tmp.path().join("hello");
        fs::write(&bin, b"\x7fELF").unwrap();
        let staging = tmp.path().join("root");
        fs::create_dir(&staging).unwrap();

        let binaries = vec![BuiltBinary {
            package: "example.com/cmd/hello".into(),
            name: "hello".into(),
            path: bin,
            prebuilt: false,
        }];
        stage_rootfs(
            &staging,
            &RootfsContents {
                hostname: "appliance",
                binaries: &binaries,
                sbom_json: b"{}\n",
            },
        )
        .unwrap();

        for dir in MOUNT_POINTS {
            assert!(staging.join(dir).is_dir(), "{} missing", dir);
        }
        assert_eq!(
            fs::read_to_string(staging.join("etc/hostname")).unwrap(),
            "appliance\n"
        );
        assert_eq!(fs::read(staging.join(SBOM_PATH)).unwrap(), b"{}\n");
        assert_eq!(fs::read(staging.join("user/hello")).unwrap(), b"\x7fELF");
        assert_eq!(tree_size(&staging), "appliance\n".len() as u64 + 3 + 4);
    }
}
