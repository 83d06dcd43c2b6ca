//! Software Bill Of Materials.
//!
//! The SBOM records what a build *would* produce from a configuration: the
//! hash of the declarative config, the hashes of every `go.mod` and
//! `go.sum` that pins the dependency versions of the configured packages,
//! and the content hashes of the opaque inputs (boot payloads, pre-built
//! binaries). It is recomputed on every call; nothing is cached.

use crate::config::{BootConfig, ConfigSnapshot};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SbomError {
    #[error(
        "package {package}: {} not found; add the package with its build \
         directory before building",
        path.display()
    )]
    NotFound { package: String, path: PathBuf },

    #[error("failed to read {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("failed to serialize SBOM: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl SbomError {
    /// The common, user-actionable case of a package without a build dir.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SbomError::NotFound { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHash {
    /// Path relative to the instance (`config.json`, `builddir/.../go.mod`).
    pub path: String,
    /// Lowercase hex SHA-256.
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sbom {
    pub config_hash: FileHash,
    /// Sorted by path.
    pub go_mod_hashes: Vec<FileHash>,
    /// Boot partition payloads by destination (`boot/vmlinuz`, ...).
    #[serde(default)]
    pub boot_hashes: Vec<FileHash>,
    /// Binaries of `skip_build` packages (`prebuilt/<name>`).
    #[serde(default)]
    pub prebuilt_hashes: Vec<FileHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbomWithHash {
    /// SHA-256 of the compact serialization of `sbom`.
    pub sbom_hash: String,
    pub sbom: Sbom,
}

/// Output selection for `rootcast sbom`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbomFormat {
    Json,
    Hash,
}

impl FromStr for SbomFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(SbomFormat::Json),
            "hash" => Ok(SbomFormat::Hash),
            other => Err(format!("unknown format {:?}: expected one of json or hash", other)),
        }
    }
}

impl fmt::Display for SbomFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SbomFormat::Json => "json",
            SbomFormat::Hash => "hash",
        })
    }
}

impl SbomFormat {
    pub fn render(self, marshaled: &[u8], with_hash: &SbomWithHash) -> Vec<u8> {
        match self {
            SbomFormat::Json => marshaled.to_vec(),
            SbomFormat::Hash => format!("{}\n", with_hash.sbom_hash).into_bytes(),
        }
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Build directory of `pkg`: the longest prefix of its import path that
/// exists under `builddir`, or `builddir` itself.
pub fn build_dir_for(builddir: &Path, pkg: &str) -> PathBuf {
    let mut candidate = pkg.trim_matches('/');
    while !candidate.is_empty() {
        let dir = builddir.join(candidate);
        if dir.join("go.mod").exists() {
            return dir;
        }
        candidate = match candidate.rfind('/') {
            Some(idx) => &candidate[..idx],
            None => "",
        };
    }
    builddir.to_path_buf()
}

fn relative_name(builddir: &Path, file: &Path) -> String {
    let rel = file.strip_prefix(builddir).unwrap_or(file);
    let mut name = String::from("builddir");
    for component in rel.components() {
        name.push('/');
        name.push_str(&component.as_os_str().to_string_lossy());
    }
    name
}

fn read(path: &Path) -> Result<Option<Vec<u8>>, SbomError> {
    match fs::read(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(SbomError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn file_hash(path: String, file: &Path) -> Result<Option<FileHash>, SbomError> {
    Ok(read(file)?.map(|content| FileHash {
        path,
        hash: sha256_hex(&content),
    }))
}

/// Boot payloads that exist on disk. Missing ones are reported when the
/// boot partition is assembled.
fn boot_hashes(boot: &BootConfig) -> Result<Vec<FileHash>, SbomError> {
    let mut files = vec![("boot/loader.efi", &boot.loader_efi), ("boot/vmlinuz", &boot.kernel)];
    if let Some(ref initrd) = boot.initrd {
        files.push(("boot/initrd.img", initrd));
    }
    let mut hashes = Vec::new();
    for (name, path) in files {
        if path.as_os_str().is_empty() {
            continue;
        }
        hashes.extend(file_hash(name.to_string(), path)?);
    }
    Ok(hashes)
}

fn prebuilt_hashes(
    snapshot: &ConfigSnapshot,
    prebuilt_dir: &Path,
) -> Result<Vec<FileHash>, SbomError> {
    let mut hashes = BTreeMap::new();
    for pkg in snapshot.packages().iter().filter(|p| snapshot.skips(p)) {
        let name = crate::build::binary_name(pkg);
        if let Some(entry) = file_hash(format!("prebuilt/{}", name), &prebuilt_dir.join(name))? {
            hashes.insert(entry.path.clone(), entry);
        }
    }
    Ok(hashes.into_values().collect())
}

/// Generate the SBOM of `snapshot`, resolving build directories in `builddir`.
///
/// Returns the pretty-printed document (newline-terminated) and the parsed
/// structure. Two calls with the same logical configuration and the same
/// input files yield identical bytes.
pub fn generate_sbom(
    snapshot: &ConfigSnapshot,
    builddir: &Path,
) -> Result<(Vec<u8>, SbomWithHash), SbomError> {
    generate_sbom_with_prebuilt(snapshot, builddir, None)
}

/// [`generate_sbom`], also hashing the pre-built binaries in `prebuilt_dir`.
pub fn generate_sbom_with_prebuilt(
    snapshot: &ConfigSnapshot,
    builddir: &Path,
    prebuilt_dir: Option<&Path>,
) -> Result<(Vec<u8>, SbomWithHash), SbomError> {
    let config_json = snapshot.canonical_json()?;
    let config_hash = FileHash {
        path: crate::config::CONFIG_FILE.to_string(),
        hash: sha256_hex(&config_json),
    };

    // keyed by relative path: sorted and deduplicated across packages
    let mut hashes: BTreeMap<String, String> = BTreeMap::new();
    for pkg in snapshot.packages() {
        if snapshot.skips(pkg) {
            continue;
        }
        let dir = build_dir_for(builddir, pkg);
        let go_mod = dir.join("go.mod");
        let content = read(&go_mod)?.ok_or_else(|| SbomError::NotFound {
            package: pkg.clone(),
            path: go_mod.clone(),
        })?;
        hashes.insert(relative_name(builddir, &go_mod), sha256_hex(&content));

        let go_sum = dir.join("go.sum");
        if let Some(content) = read(&go_sum)? {
            hashes.insert(relative_name(builddir, &go_sum), sha256_hex(&content));
        }
    }

    let sbom = Sbom {
        config_hash,
        go_mod_hashes: hashes
            .into_iter()
            .map(|(path, hash)| FileHash { path, hash })
            .collect(),
        boot_hashes: boot_hashes(snapshot.boot())?,
        prebuilt_hashes: match prebuilt_dir {
            Some(dir) => prebuilt_hashes(snapshot, dir)?,
            None => Vec::new(),
        },
    };
    let sbom_hash = sha256_hex(&serde_json::to_vec(&sbom)?);
    let with_hash = SbomWithHash { sbom_hash, sbom };

    let mut marshaled = serde_json::to_vec_pretty(&with_hash)?;
    marshaled.push(b'\n');
    log::debug!("SBOM hash {}", with_hash.sbom_hash);
    Ok((marshaled, with_hash))
}
