//! Shared test utilities for rootcast tests.
//!
//! Nothing here needs host tools: the Go toolchain is a shell script, the
//! filesystem tools are replaced by [`TestImager`] and a running instance
//! by [`FakeInstance`].
#![allow(dead_code)]

use rootcast::config::{BuildConfig, Instance, LayoutConfig, WorkingConfig};
use rootcast::device::{BlockDevice, DeviceError};
use rootcast::image::boot::BootFile;
use rootcast::image::Imager;
use rootcast::update::protocol::{self, Features};
use rootcast::update::{Transport, UpdateError, Upload};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const MIB: u64 = 1024 * 1024;

/// `go build -o OUT [flags] PKG`: writes a fake binary naming the package,
/// or fails like the compiler when the package path contains "broken".
const STUB_GO: &str = r#"#!/bin/sh
out=""
pkg=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2; continue ;;
  esac
  pkg="$1"
  shift
done
case "$pkg" in
  *broken*) echo "$pkg/main.go:3:2: undefined: frobnicate" >&2; exit 1 ;;
  *library*) exit 0 ;;
esac
printf 'ELF %s %s/%s\n' "$pkg" "$GOOS" "$GOARCH" > "$out"
"#;

/// Test environment with a temporary instance directory.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    pub instance: Instance,
    pub go: PathBuf,
    /// Scratch space for outputs
    pub out: PathBuf,
}

impl TestEnv {
    /// Instance `scanner` whose builddir holds a module for every package.
    pub fn new(packages: &[&str]) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base = temp_dir.path();

        let dir = base.join("instances/scanner");
        fs::create_dir_all(dir.join("builddir")).expect("Failed to create builddir");
        let instance = Instance {
            name: "scanner".into(),
            dir,
        };
        for pkg in packages {
            add_module(&instance.builddir(), pkg);
        }

        let go = base.join("go");
        fs::write(&go, STUB_GO).expect("Failed to write stub go");
        fs::set_permissions(&go, fs::Permissions::from_mode(0o755)).expect("chmod stub go");

        let boot = base.join("boot");
        fs::create_dir_all(&boot).unwrap();
        fs::write(boot.join("systemd-bootx64.efi"), b"MZ systemd-boot").unwrap();
        fs::write(boot.join("vmlinuz"), b"MZ kernel").unwrap();

        let out = base.join("out");
        fs::create_dir_all(&out).unwrap();

        Self {
            _temp_dir: temp_dir,
            instance,
            go,
            out,
        }
    }

    pub fn base(&self) -> &Path {
        self._temp_dir.path()
    }

    /// Configuration with small partitions and the given packages.
    pub fn config(&self, packages: &[&str]) -> BuildConfig {
        let mut cfg = BuildConfig::new("scanner");
        cfg.packages = packages.iter().map(|p| p.to_string()).collect();
        cfg.boot.loader_efi = self.base().join("boot/systemd-bootx64.efi");
        cfg.boot.kernel = self.base().join("boot/vmlinuz");
        cfg.boot.cmdline = "console=ttyS0".into();
        cfg.layout = LayoutConfig {
            boot_mib: 4,
            root_mib: 8,
            data_mib: None,
            image_mib: None,
        };
        cfg
    }

    /// Working configuration that compiles with the stub toolchain.
    pub fn working(&self, config: BuildConfig) -> WorkingConfig {
        let mut working = WorkingConfig::new(config, self.instance.builddir());
        working.internal.go = self.go.clone();
        working.internal.goarch = "amd64".into();
        working
    }
}

/// Create `<builddir>/<pkg>/go.mod`.
pub fn add_module(builddir: &Path, pkg: &str) {
    let dir = builddir.join(pkg);
    fs::create_dir_all(&dir).expect("Failed to create module dir");
    fs::write(dir.join("go.mod"), format!("module {}\n\ngo 1.22\n", pkg)).unwrap();
    fs::write(dir.join("go.sum"), format!("{} v0.0.0 h1:stub=\n", pkg)).unwrap();
}

/// Imager writing plain, deterministic files instead of real filesystems.
pub struct TestImager;

impl Imager for TestImager {
    fn boot_image(
        &self,
        files: &[BootFile],
        out: &Path,
        size: u64,
        volume_id: u32,
    ) -> anyhow::Result<()> {
        let mut image = fs::File::create(out)?;
        image.set_len(size)?;
        writeln!(image, "FAT32 {:08X}", volume_id)?;
        for file in files {
            image.write_all(file.dest.as_bytes())?;
            image.write_all(b"\n")?;
            image.write_all(&file.read()?)?;
            image.write_all(b"\n")?;
        }
        let end = image.stream_position()?;
        anyhow::ensure!(end <= size, "boot payload does not fit");
        Ok(())
    }

    fn root_image(&self, staging: &Path, out: &Path) -> anyhow::Result<()> {
        let mut image = fs::File::create(out)?;
        for entry in walkdir::WalkDir::new(staging).sort_by_file_name() {
            let entry = entry?;
            let rel = entry.path().strip_prefix(staging)?;
            writeln!(image, "{}", rel.display())?;
            if entry.file_type().is_file() {
                image.write_all(&fs::read(entry.path())?)?;
            }
        }
        Ok(())
    }
}

/// Block device stand-in reporting a fixed size.
pub struct FakeDevice {
    pub size: u64,
    pub reloads: AtomicUsize,
}

impl FakeDevice {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            reloads: AtomicUsize::new(0),
        }
    }

    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

impl BlockDevice for FakeDevice {
    fn size(&self, _file: &fs::File) -> Result<u64, DeviceError> {
        Ok(self.size)
    }

    fn reload_partition_table(&self, _file: &fs::File) -> Result<(), DeviceError> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Create a sparse file of `size` bytes, marked with `marker` at offset 0.
pub fn create_disk(path: &Path, size: u64, marker: &[u8]) {
    let mut f = fs::File::create(path).unwrap();
    f.set_len(size).unwrap();
    f.seek(SeekFrom::Start(0)).unwrap();
    f.write_all(marker).unwrap();
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

#[derive(Debug, Default)]
struct FakeState {
    features: Vec<String>,
    /// uploadtemp contents by name
    staged: BTreeMap<String, Vec<u8>>,
    roots: [Vec<u8>; 2],
    active: usize,
    /// service path -> binary on the active root
    installed: BTreeMap<String, Vec<u8>>,
    /// service path -> diverted binary, lost on reboot
    diversions: BTreeMap<String, Vec<u8>>,
    fail_after: Option<u64>,
    corrupt_root: bool,
    /// POST path whose next request fails without taking effect
    fail_post: Option<String>,
    switches: usize,
    reboots: usize,
}

/// In-memory running instance speaking the update protocol.
#[derive(Debug, Clone, Default)]
pub struct FakeInstance {
    state: Arc<Mutex<FakeState>>,
}

impl FakeInstance {
    pub fn new(features: &[&str]) -> Self {
        let fake = Self::default();
        fake.state.lock().unwrap().features = features.iter().map(|f| f.to_string()).collect();
        fake
    }

    /// An instance supporting committing updates.
    pub fn full() -> Self {
        Self::new(&[protocol::FEATURE_PARTUUID, protocol::FEATURE_UPDATE_HASH])
    }

    pub fn with_service(self, path: &str, binary: &[u8]) -> Self {
        self.state
            .lock()
            .unwrap()
            .installed
            .insert(path.to_string(), binary.to_vec());
        self
    }

    pub fn with_root(self, index: usize, content: &[u8]) -> Self {
        self.state.lock().unwrap().roots[index] = content.to_vec();
        self
    }

    /// Drop the connection once `bytes` of the next upload have arrived.
    pub fn fail_next_upload_after(&self, bytes: u64) {
        self.state.lock().unwrap().fail_after = Some(bytes);
    }

    /// Report a wrong hash for the next root written.
    pub fn corrupt_next_root(&self) {
        self.state.lock().unwrap().corrupt_root = true;
    }

    /// Drop the connection on the next POST to `path`.
    pub fn fail_next_post(&self, path: &str) {
        self.state.lock().unwrap().fail_post = Some(path.to_string());
    }

    pub fn staged(&self, name: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().staged.get(name).cloned()
    }

    /// The binary `service` currently runs.
    pub fn running(&self, service: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state
            .diversions
            .get(service)
            .or_else(|| state.installed.get(service))
            .cloned()
    }

    pub fn active(&self) -> usize {
        self.state.lock().unwrap().active
    }

    pub fn root(&self, index: usize) -> Vec<u8> {
        self.state.lock().unwrap().roots[index].clone()
    }

    pub fn switches(&self) -> usize {
        self.state.lock().unwrap().switches
    }

    pub fn reboots(&self) -> usize {
        self.state.lock().unwrap().reboots
    }

    /// Power cycle without going through the update API.
    pub fn power_cycle(&self) {
        self.state.lock().unwrap().diversions.clear();
    }

    /// Append `chunk` to the destination; `Err` simulates a dropped connection.
    fn receive(&self, root: bool, name: &str, chunk: &[u8]) -> Result<(), UpdateError> {
        let mut state = self.state.lock().unwrap();
        let inactive = 1 - state.active;
        let dest = if root {
            &mut state.roots[inactive]
        } else {
            state.staged.entry(name.to_string()).or_default()
        };
        dest.extend_from_slice(chunk);
        let received = dest.len() as u64;
        if let Some(limit) = state.fail_after {
            if received >= limit {
                state.fail_after = None;
                return Err(UpdateError::Transfer {
                    path: name.to_string(),
                    source: "connection reset by peer".into(),
                });
            }
        }
        Ok(())
    }
}

impl Transport for FakeInstance {
    async fn features(&self) -> Result<Features, UpdateError> {
        Ok(Features {
            protocol: protocol::PROTOCOL_VERSION,
            features: self.state.lock().unwrap().features.clone(),
        })
    }

    async fn put(&self, path: &str, mut body: Upload) -> Result<Vec<u8>, UpdateError> {
        let root = path == protocol::ROOT_PATH;
        let name = path.strip_prefix("uploadtemp/").unwrap_or(path).to_string();
        {
            let mut state = self.state.lock().unwrap();
            let inactive = 1 - state.active;
            if root {
                state.roots[inactive].clear();
            } else {
                state.staged.insert(name.clone(), Vec::new());
            }
        }

        loop {
            let chunk = body.next_chunk().await.map_err(|e| UpdateError::Transfer {
                path: path.to_string(),
                source: Box::new(e),
            })?;
            match chunk {
                Some(chunk) => self.receive(root, &name, &chunk)?,
                None => break,
            }
        }

        if !root {
            return Ok(Vec::new());
        }
        let mut state = self.state.lock().unwrap();
        let inactive = 1 - state.active;
        if std::mem::take(&mut state.corrupt_root) {
            state.roots[inactive].push(0);
        }
        Ok(sha256_hex(&state.roots[inactive]).into_bytes())
    }

    async fn divert(&self, service_path: &str, staged_name: &str) -> Result<(), UpdateError> {
        let mut state = self.state.lock().unwrap();
        if !state.installed.contains_key(service_path) {
            return Err(UpdateError::UnknownService(service_path.to_string()));
        }
        let binary = state
            .staged
            .get(staged_name)
            .cloned()
            .ok_or_else(|| UpdateError::NotStaged(staged_name.to_string()))?;
        state.diversions.insert(service_path.to_string(), binary);
        Ok(())
    }

    async fn post(&self, path: &str) -> Result<(), UpdateError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_post.as_deref() == Some(path) {
            state.fail_post = None;
            return Err(UpdateError::Transfer {
                path: path.to_string(),
                source: "connection reset by peer".into(),
            });
        }
        match path {
            protocol::SWITCH_PATH => {
                state.active = 1 - state.active;
                state.switches += 1;
            }
            protocol::REBOOT_PATH => {
                state.diversions.clear();
                state.reboots += 1;
            }
            other => {
                return Err(UpdateError::Status {
                    path: other.to_string(),
                    status: 404,
                    body: "not found".into(),
                })
            }
        }
        Ok(())
    }
}

/// One request as seen by [`StubServer`].
#[derive(Debug, Clone)]
pub struct Recorded {
    pub request_line: String,
    /// Header names lowercased.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Minimal HTTP/1.1 server answering a fixed script of responses, one
/// connection per request.
pub struct StubServer {
    pub url: String,
    handle: tokio::task::JoinHandle<Vec<Recorded>>,
}

impl StubServer {
    pub async fn start(script: Vec<(u16, &'static str)>) -> Self {
        use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let mut recorded = Vec::new();
            for (status, body) in script {
                let (stream, _) = listener.accept().await.unwrap();
                let mut reader = BufReader::new(stream);

                let mut request_line = String::new();
                reader.read_line(&mut request_line).await.unwrap();
                let mut headers = BTreeMap::new();
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).await.unwrap();
                    let line = line.trim_end();
                    if line.is_empty() {
                        break;
                    }
                    if let Some((k, v)) = line.split_once(':') {
                        headers.insert(k.trim().to_lowercase(), v.trim().to_string());
                    }
                }
                let len: usize = headers
                    .get("content-length")
                    .map(|v| v.parse().unwrap())
                    .unwrap_or(0);
                let mut req_body = vec![0u8; len];
                reader.read_exact(&mut req_body).await.unwrap();

                let response = format!(
                    "HTTP/1.1 {} Stub\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let mut stream = reader.into_inner();
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.shutdown().await.unwrap();

                recorded.push(Recorded {
                    request_line: request_line.trim_end().to_string(),
                    headers,
                    body: req_body,
                });
            }
            recorded
        });
        Self { url, handle }
    }

    /// Wait for the whole script to be served.
    pub async fn requests(self) -> Vec<Recorded> {
        self.handle.await.unwrap()
    }
}
