//! Pushing builds to a running instance.
//!
//! A binary is staged with [`UpdateTarget::put`] and then either diverted
//! ([`UpdateTarget::divert`]: the service runs the staged binary until the
//! next reboot) or a full root filesystem is committed
//! ([`UpdateTarget::update_root`]: written to the inactive root partition,
//! verified, then made active).
//!
//! Operations on one target must not overlap; the target holds no locks.

pub mod http;
pub mod progress;
pub mod protocol;

pub use http::HttpTransport;
pub use progress::{CancelHandle, CancelSignal, Reporter, TransferSession};
pub use protocol::Features;

use crate::config::UpdateEndpoint;
use sha2::{Digest, Sha256};
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const CHUNK_SIZE: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("cannot reach {url}: {source}")]
    Connect { url: String, source: BoxError },

    #[error("update protocol error: {0}")]
    Protocol(String),

    /// The instance lacks a capability; never worked around.
    #[error("instance does not support {0}")]
    Unsupported(String),

    /// Safe to retry: uploads replace rather than append.
    #[error("transfer to {path} failed: {source}")]
    Transfer { path: String, source: BoxError },

    #[error("{path}: HTTP {status}: {body}")]
    Status { path: String, status: u16, body: String },

    #[error("instance has no service {0}")]
    UnknownService(String),

    #[error("{0} was not uploaded before diverting to it")]
    NotStaged(String),

    #[error("instance wrote {actual}, expected {expected}; not switching")]
    HashMismatch { expected: String, actual: String },

    #[error("transfer cancelled")]
    Cancelled,

    /// The new root is active; only the reboot request was lost.
    #[error("new root committed but the reboot request failed: {0}")]
    RebootFailed(#[source] Box<UpdateError>),

    #[error("cannot {operation} in state {state}")]
    InvalidState {
        operation: &'static str,
        state: TargetState,
    },

    #[error("{}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

impl UpdateError {
    pub fn is_retryable(&self) -> bool {
        match self {
            UpdateError::Connect { .. } | UpdateError::Transfer { .. } => true,
            UpdateError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Created,
    CapabilityChecked,
    TransferInProgress,
    Diverted,
    Committed,
    Idle,
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TargetState::Created => "created",
            TargetState::CapabilityChecked => "capability-checked",
            TargetState::TransferInProgress => "transfer-in-progress",
            TargetState::Diverted => "diverted",
            TargetState::Committed => "committed",
            TargetState::Idle => "idle",
        };
        f.write_str(name)
    }
}

/// Request body of an upload.
///
/// Chunks are counted into the attached [`TransferSession`] as they are
/// handed to the transport.
pub struct Upload {
    reader: Pin<Box<dyn AsyncRead + Send>>,
    len: Option<u64>,
    session: Option<TransferSession>,
}

impl Upload {
    pub fn new<R: AsyncRead + Send + 'static>(reader: R) -> Self {
        Self {
            reader: Box::pin(reader),
            len: None,
            session: None,
        }
    }

    pub fn with_len(mut self, len: u64) -> Self {
        self.len = Some(len);
        self
    }

    pub async fn from_file(path: &Path) -> Result<Self, UpdateError> {
        let io_err = |source| UpdateError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = tokio::fs::File::open(path).await.map_err(io_err)?;
        let len = file.metadata().await.map_err(io_err)?.len();
        Ok(Self::new(file).with_len(len))
    }

    pub fn len(&self) -> Option<u64> {
        self.len
    }

    fn track(mut self, session: &TransferSession) -> Self {
        session.begin(self.len);
        self.session = Some(session.clone());
        self
    }

    /// Next chunk of the body, `None` at the end.
    pub async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let n = self.reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        if let Some(ref session) = self.session {
            session.add(n as u64);
        }
        Ok(Some(buf))
    }

    /// The body as a stream of chunks.
    pub fn into_stream(self) -> impl futures_util::Stream<Item = io::Result<Vec<u8>>> + Send {
        futures_util::stream::unfold(Some(self), |state| async move {
            let mut upload = state?;
            match upload.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(upload))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

/// How requests reach an instance.
pub trait Transport {
    fn features(&self) -> impl Future<Output = Result<Features, UpdateError>> + Send;

    /// PUT `body` to `path`, returning the response body.
    fn put(&self, path: &str, body: Upload)
        -> impl Future<Output = Result<Vec<u8>, UpdateError>> + Send;

    fn divert(
        &self,
        service_path: &str,
        staged_name: &str,
    ) -> impl Future<Output = Result<(), UpdateError>> + Send;

    /// POST without a body.
    fn post(&self, path: &str) -> impl Future<Output = Result<(), UpdateError>> + Send;
}

async fn cancellable<T>(
    cancel: &CancelSignal,
    op: impl Future<Output = Result<T, UpdateError>>,
) -> Result<T, UpdateError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UpdateError::Cancelled),
        r = op => r,
    }
}

/// Hex SHA-256 of a file.
pub async fn hash_file(path: &Path) -> Result<String, UpdateError> {
    let io_err = |source| UpdateError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = tokio::fs::File::open(path).await.map_err(io_err)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await.map_err(io_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// One running instance.
pub struct UpdateTarget<T> {
    transport: T,
    state: TargetState,
    features: Option<Features>,
}

impl UpdateTarget<HttpTransport> {
    /// Connect to the instance at `endpoint` and probe its capabilities.
    pub async fn connect(
        endpoint: &UpdateEndpoint,
        client: reqwest::Client,
    ) -> Result<Self, UpdateError> {
        let mut target = Self::with_transport(HttpTransport::from_endpoint(endpoint, client)?);
        target.probe().await?;
        Ok(target)
    }
}

impl<T: Transport> UpdateTarget<T> {
    pub fn with_transport(transport: T) -> Self {
        Self {
            transport,
            state: TargetState::Created,
            features: None,
        }
    }

    pub fn state(&self) -> TargetState {
        self.state
    }

    pub fn supports_partuuid(&self) -> bool {
        self.features
            .as_ref()
            .is_some_and(|f| f.supports(protocol::FEATURE_PARTUUID))
    }

    fn require(
        &self,
        operation: &'static str,
        allowed: &[TargetState],
    ) -> Result<(), UpdateError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(UpdateError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// Learn what the instance supports.
    pub async fn probe(&mut self) -> Result<&Features, UpdateError> {
        self.require("probe", &[TargetState::Created, TargetState::Idle])?;
        let features = self.transport.features().await?;
        features.check_version()?;
        log::debug!("instance features: {:?}", features.features);
        self.state = TargetState::CapabilityChecked;
        Ok(&*self.features.insert(features))
    }

    /// Stage `body` as `name` on the instance.
    ///
    /// Re-uploading the same name replaces the earlier content, so a failed
    /// put can simply be repeated.
    pub async fn put(
        &mut self,
        name: &str,
        body: Upload,
        session: &TransferSession,
        cancel: &CancelSignal,
    ) -> Result<(), UpdateError> {
        self.require(
            "put",
            &[
                TargetState::CapabilityChecked,
                TargetState::TransferInProgress,
                TargetState::Diverted,
                TargetState::Idle,
            ],
        )?;
        let path = protocol::upload_path(name)?;
        let previous = self.state;
        self.state = TargetState::TransferInProgress;

        let result = cancellable(cancel, self.transport.put(&path, body.track(session))).await;
        match result {
            Ok(_) => {
                log::debug!("staged {} ({} bytes)", name, session.transferred());
                Ok(())
            }
            Err(e) => {
                self.state = previous;
                Err(e)
            }
        }
    }

    /// Run the staged `staged_name` as the executable of `service_path`
    /// until the next reboot.
    pub async fn divert(&mut self, service_path: &str, staged_name: &str) -> Result<(), UpdateError> {
        self.require("divert", &[TargetState::TransferInProgress])?;
        self.transport.divert(service_path, staged_name).await?;
        self.state = TargetState::Diverted;
        Ok(())
    }

    /// Commit a new root filesystem image.
    ///
    /// The instance writes it to its inactive root partition and reports
    /// the hash of what it wrote. Only when that matches is the active
    /// partition switched and the instance rebooted.
    pub async fn update_root(
        &mut self,
        image: &Path,
        session: &TransferSession,
        cancel: &CancelSignal,
    ) -> Result<(), UpdateError> {
        self.require("update", &[TargetState::CapabilityChecked, TargetState::Idle])?;
        if !self.supports_partuuid() {
            return Err(UpdateError::Unsupported(
                "switching roots by partition UUID; refusing to overwrite the active root".into(),
            ));
        }
        let verifies = self
            .features
            .as_ref()
            .is_some_and(|f| f.supports(protocol::FEATURE_UPDATE_HASH));
        if !verifies {
            return Err(UpdateError::Unsupported("verifying written root images".into()));
        }

        let expected = hash_file(image).await?;
        let body = Upload::from_file(image).await?.track(session);
        let previous = self.state;
        self.state = TargetState::TransferInProgress;

        let written = match cancellable(cancel, self.transport.put(protocol::ROOT_PATH, body)).await {
            Ok(w) => w,
            Err(e) => {
                self.state = previous;
                return Err(e);
            }
        };
        let actual = String::from_utf8_lossy(&written).trim().to_lowercase();
        if actual != expected {
            self.state = previous;
            return Err(UpdateError::HashMismatch { expected, actual });
        }

        if let Err(e) = self.transport.post(protocol::SWITCH_PATH).await {
            self.state = previous;
            return Err(e);
        }
        self.state = TargetState::Committed;
        self.reboot()
            .await
            .map_err(|e| UpdateError::RebootFailed(Box::new(e)))
    }

    pub async fn reboot(&mut self) -> Result<(), UpdateError> {
        self.transport.post(protocol::REBOOT_PATH).await
    }

    /// Done with this target.
    pub fn finish(&mut self) {
        self.state = TargetState::Idle;
    }
}
