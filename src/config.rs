//! Instance configuration.
//!
//! An instance lives in `<parent>/<name>/` and contains `config.json`, the
//! per-package `builddir/` tree and the host-specific credential files.
//! The parent directory and toolchain settings come from the environment
//! (with `.env` loaded by `main`).
//!
//! Two views of the configuration exist. [`ConfigSnapshot`] is the frozen
//! declarative input and is the only thing the SBOM path accepts.
//! [`WorkingConfig`] owns its own copy plus the runtime-only
//! [`InternalFlags`] the build path adjusts.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE: &str = "config.json";
pub const PASSWORD_FILE: &str = "http-password.txt";
pub const PORT_FILE: &str = "http-port.txt";
pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_GOARCH: &str = "amd64";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("instance {name:?} does not exist at {}", dir.display())]
    NoInstance { name: String, dir: PathBuf },

    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn is_not_found(&self) -> bool {
        match self {
            ConfigError::NoInstance { .. } => true,
            ConfigError::Read { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Extra build inputs for one package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageConfig {
    pub build_flags: Vec<String>,
    pub build_tags: Vec<String>,
}

/// Boot partition payloads. These are opaque files supplied by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    /// systemd-boot EFI binary.
    pub loader_efi: PathBuf,
    pub kernel: PathBuf,
    pub initrd: Option<PathBuf>,
    /// Extra kernel command line, appended after `root=PARTUUID=...`.
    pub cmdline: String,
}

/// Sizing of the partitions, in MiB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub boot_mib: u64,
    pub root_mib: u64,
    /// `None`: no data partition. `Some(0)`: fill the remaining space.
    pub data_mib: Option<u64>,
    /// Size of image files. Devices always use their own capacity.
    pub image_mib: Option<u64>,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            boot_mib: 100,
            root_mib: 500,
            data_mib: Some(0),
            image_mib: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Host to push updates to, if it differs from the instance hostname.
    pub hostname: Option<String>,
}

/// `config.json` as stored on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub hostname: String,
    pub packages: Vec<String>,
    pub package_config: BTreeMap<String, PackageConfig>,
    /// Packages supplied as pre-built binaries instead of being compiled.
    pub skip_build: BTreeSet<String>,
    pub boot: BootConfig,
    pub layout: LayoutConfig,
    pub update: UpdateConfig,
}

impl BuildConfig {
    /// Configuration used when an instance has no `config.json` yet.
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            ..Self::default()
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self =
            serde_json::from_slice(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.hostname.trim().is_empty() {
            return Err(ConfigError::Invalid("hostname must not be empty".into()));
        }
        let mut seen = BTreeSet::new();
        for pkg in &self.packages {
            if !seen.insert(pkg) {
                return Err(ConfigError::Invalid(format!(
                    "package {} is listed twice",
                    pkg
                )));
            }
        }
        Ok(())
    }

    /// Freeze the declarative configuration for hashing.
    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            hostname: self.hostname.clone(),
            packages: self.packages.clone(),
            package_config: self.package_config.clone(),
            skip_build: self.skip_build.clone(),
            boot: self.boot.clone(),
            layout: self.layout.clone(),
            update: self.update.clone(),
        }
    }
}

/// Immutable copy of a [`BuildConfig`], taken before any runtime adjustment.
///
/// Fields are private; the serialized form is what the SBOM hashes, with
/// every map ordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigSnapshot {
    hostname: String,
    packages: Vec<String>,
    package_config: BTreeMap<String, PackageConfig>,
    skip_build: BTreeSet<String>,
    boot: BootConfig,
    layout: LayoutConfig,
    update: UpdateConfig,
}

impl ConfigSnapshot {
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn packages(&self) -> &[String] {
        &self.packages
    }

    pub fn boot(&self) -> &BootConfig {
        &self.boot
    }

    /// Whether `pkg` is supplied as a pre-built binary.
    pub fn skips(&self, pkg: &str) -> bool {
        self.skip_build.contains(pkg)
    }

    /// Canonical serialization (compact JSON, ordered maps).
    pub fn canonical_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Runtime-only settings the build path may adjust freely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalFlags {
    /// Target architecture (`GOARCH`).
    pub goarch: String,
    /// Go toolchain binary.
    pub go: PathBuf,
}

impl Default for InternalFlags {
    fn default() -> Self {
        Self {
            goarch: DEFAULT_GOARCH.to_string(),
            go: PathBuf::from("go"),
        }
    }
}

impl InternalFlags {
    /// Read `ROOTCAST_GOARCH` and `ROOTCAST_GO` from the environment.
    pub fn from_env() -> Self {
        let mut flags = Self::default();
        if let Ok(arch) = std::env::var("ROOTCAST_GOARCH") {
            if !arch.is_empty() {
                flags.goarch = arch;
            }
        }
        if let Ok(go) = std::env::var("ROOTCAST_GO") {
            if !go.is_empty() {
                flags.go = PathBuf::from(go);
            }
        }
        flags
    }
}

/// Mutable configuration consumed by the build path.
#[derive(Debug, Clone)]
pub struct WorkingConfig {
    pub config: BuildConfig,
    pub internal: InternalFlags,
    /// Root of the per-package build directories.
    pub builddir: PathBuf,
}

impl WorkingConfig {
    pub fn new(config: BuildConfig, builddir: PathBuf) -> Self {
        Self {
            config,
            internal: InternalFlags::from_env(),
            builddir,
        }
    }
}

/// Resolve the directory holding all instances.
///
/// `ROOTCAST_PARENT_DIR` wins; otherwise `~/.config/rootcast`.
pub fn parent_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("ROOTCAST_PARENT_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rootcast")
}

/// A named instance directory.
#[derive(Debug, Clone)]
pub struct Instance {
    pub name: String,
    pub dir: PathBuf,
}

impl Instance {
    pub fn open(parent: &Path, name: &str) -> Result<Self, ConfigError> {
        let dir = parent.join(name);
        if !dir.is_dir() {
            return Err(ConfigError::NoInstance {
                name: name.to_string(),
                dir,
            });
        }
        Ok(Self {
            name: name.to_string(),
            dir,
        })
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    pub fn builddir(&self) -> PathBuf {
        self.dir.join("builddir")
    }

    /// Binaries of `skip_build` packages, supplied out of band.
    pub fn prebuilt_dir(&self) -> PathBuf {
        self.dir.join("prebuilt")
    }

    /// Read `config.json`, falling back to a bare config for old setups
    /// that predate it.
    pub fn read_config(&self) -> Result<BuildConfig, ConfigError> {
        match BuildConfig::from_file(&self.config_path()) {
            Err(e) if e.is_not_found() => {
                log::warn!(
                    "{} not found, using default configuration",
                    self.config_path().display()
                );
                Ok(BuildConfig::new(&self.name))
            }
            other => other,
        }
    }

    fn read_host_file(&self, name: &str) -> Result<Option<String>, ConfigError> {
        let path = self.dir.join(name);
        match fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s.trim().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ConfigError::Read { path, source }),
        }
    }

    /// Shared secret for the update API.
    pub fn http_password(&self) -> Result<String, ConfigError> {
        match self.read_host_file(PASSWORD_FILE)? {
            Some(pw) if !pw.is_empty() => Ok(pw),
            _ => Err(ConfigError::Read {
                path: self.dir.join(PASSWORD_FILE),
                source: io::Error::new(io::ErrorKind::NotFound, "no update password configured"),
            }),
        }
    }

    pub fn http_port(&self) -> Result<u16, ConfigError> {
        match self.read_host_file(PORT_FILE)? {
            None => Ok(DEFAULT_HTTP_PORT),
            Some(p) if p.is_empty() => Ok(DEFAULT_HTTP_PORT),
            Some(p) => p
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{}: bad port {:?}", PORT_FILE, p))),
        }
    }

    /// Where and how to reach the instance's update API.
    pub fn update_endpoint(&self, config: &BuildConfig) -> Result<UpdateEndpoint, ConfigError> {
        let host = config
            .update
            .hostname
            .clone()
            .unwrap_or_else(|| config.hostname.clone());
        Ok(UpdateEndpoint {
            host,
            port: self.http_port()?,
            password: self.http_password()?,
        })
    }
}

/// Address of an instance's update API plus its shared secret.
///
/// The password stays out of the URL; it is sent verbatim as the basic
/// auth credential.
#[derive(Clone, PartialEq, Eq)]
pub struct UpdateEndpoint {
    pub host: String,
    pub port: u16,
    pub password: String,
}

impl UpdateEndpoint {
    pub fn base_url(&self) -> String {
        if self.host.contains(':') {
            format!("http://[{}]:{}/", self.host, self.port)
        } else {
            format!("http://{}:{}/", self.host, self.port)
        }
    }
}

impl fmt::Debug for UpdateEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn sample() -> BuildConfig {
        let mut cfg = BuildConfig::new("scanner");
        cfg.packages = vec!["example.com/cmd/hello".into()];
        cfg.package_config.insert(
            "example.com/cmd/hello".into(),
            PackageConfig {
                build_flags: vec!["-ldflags=-s".into()],
                build_tags: vec!["netgo".into()],
            },
        );
        cfg
    }

    #[test]
    fn test_parse_minimal_config() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        fs::write(&path, r#"{"hostname":"scanner","packages":["example.com/cmd/hello"]}"#)
            .unwrap();
        let cfg = BuildConfig::from_file(&path).unwrap();
        assert_eq!(cfg.hostname, "scanner");
        assert_eq!(cfg.layout, LayoutConfig::default());
        assert!(cfg.package_config.is_empty());
    }

    #[test]
    fn test_duplicate_package_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        fs::write(&path, r#"{"hostname":"h","packages":["a/b","a/b"]}"#).unwrap();
        let err = BuildConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_snapshot_is_independent_of_working_config() {
        let cfg = sample();
        let snapshot = cfg.snapshot();
        let before = snapshot.canonical_json().unwrap();

        let mut working = WorkingConfig::new(cfg, PathBuf::from("/nonexistent"));
        working.internal.goarch = "arm64".into();
        working.config.packages.push("example.com/cmd/internal".into());

        assert_eq!(snapshot.canonical_json().unwrap(), before);
        assert_eq!(snapshot.packages(), ["example.com/cmd/hello".to_string()]);
    }

    #[test]
    fn test_canonical_json_ignores_map_insertion_order() {
        let mut a = BuildConfig::new("h");
        a.package_config.insert("z".into(), PackageConfig::default());
        a.package_config.insert("a".into(), PackageConfig::default());
        let mut b = BuildConfig::new("h");
        b.package_config.insert("a".into(), PackageConfig::default());
        b.package_config.insert("z".into(), PackageConfig::default());
        assert_eq!(
            a.snapshot().canonical_json().unwrap(),
            b.snapshot().canonical_json().unwrap()
        );
    }

    #[test]
    fn test_host_files() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("scanner")).unwrap();
        let instance = Instance::open(tmp.path(), "scanner").unwrap();

        assert!(instance.http_password().is_err());
        assert_eq!(instance.http_port().unwrap(), DEFAULT_HTTP_PORT);

        fs::write(instance.dir.join(PASSWORD_FILE), "s3cret\n").unwrap();
        fs::write(instance.dir.join(PORT_FILE), "8080\n").unwrap();
        let endpoint = instance.update_endpoint(&sample()).unwrap();
        assert_eq!(endpoint.base_url(), "http://scanner:8080/");
        assert_eq!(endpoint.password, "s3cret");
        assert!(!format!("{:?}", endpoint).contains("s3cret"));
    }

    #[test]
    fn test_password_with_url_reserved_characters_is_kept_verbatim() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("scanner")).unwrap();
        let instance = Instance::open(tmp.path(), "scanner").unwrap();
        fs::write(instance.dir.join(PASSWORD_FILE), "p@ss/w#rd:%20\n").unwrap();

        let endpoint = instance.update_endpoint(&sample()).unwrap();
        assert_eq!(endpoint.password, "p@ss/w#rd:%20");
        assert_eq!(endpoint.base_url(), "http://scanner:80/");
    }

    #[test]
    fn test_missing_instance() {
        let tmp = tempfile::tempdir().unwrap();
        let err = Instance::open(tmp.path(), "nope").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    #[serial]
    fn test_internal_flags_from_env() {
        std::env::set_var("ROOTCAST_GOARCH", "arm64");
        std::env::remove_var("ROOTCAST_GO");
        let flags = InternalFlags::from_env();
        std::env::remove_var("ROOTCAST_GOARCH");
        assert_eq!(flags.goarch, "arm64");
        assert_eq!(flags.go, PathBuf::from("go"));
    }

    #[test]
    #[serial]
    fn test_parent_dir_override() {
        std::env::set_var("ROOTCAST_PARENT_DIR", "/srv/instances");
        let dir = parent_dir();
        std::env::remove_var("ROOTCAST_PARENT_DIR");
        assert_eq!(dir, PathBuf::from("/srv/instances"));
    }
}
