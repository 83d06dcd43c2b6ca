//! Cross-compilation of the configured Go packages.
//!
//! Every resolved package is compiled into `<output_dir>/<basename>`.
//! Packages in the skip set are not compiled; their binaries are expected
//! in the output directory already.

mod compile;

pub use compile::{go_build_command, CompileJob};

use crate::config::WorkingConfig;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("configuration error: {0}")]
    Config(String),

    /// The compiler's diagnostic, unmodified.
    #[error("compiling {package} failed:\n{diagnostic}")]
    Compile { package: String, diagnostic: String },

    /// `go build` succeeded without writing a binary: not a `main` package.
    #[error("compiling {package} produced no binary; {} not installed", path.display())]
    NotInstalled { package: String, path: PathBuf },

    #[error("{package} is not built here, but its binary {} is missing", path.display())]
    MissingPrebuilt { package: String, path: PathBuf },

    #[error("{}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Tool(#[from] anyhow::Error),
}

impl BuildError {
    /// What the user most likely needs to do about this error.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            BuildError::NotInstalled { .. } => {
                Some("are you not in a directory where .go files declare package main?")
            }
            _ => None,
        }
    }
}

/// What to compile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildRequest {
    /// Explicit package list; empty means the configured packages.
    pub packages: Vec<String>,
    pub flags: BTreeMap<String, Vec<String>>,
    pub tags: BTreeMap<String, Vec<String>>,
    pub skip: BTreeSet<String>,
}

impl BuildRequest {
    /// Request for the configured packages with their configured flags.
    pub fn from_config(cfg: &WorkingConfig) -> Self {
        let mut req = Self {
            skip: cfg.config.skip_build.clone(),
            ..Self::default()
        };
        for (pkg, pc) in &cfg.config.package_config {
            if !pc.build_flags.is_empty() {
                req.flags.insert(pkg.clone(), pc.build_flags.clone());
            }
            if !pc.build_tags.is_empty() {
                req.tags.insert(pkg.clone(), pc.build_tags.clone());
            }
        }
        req
    }

    pub fn with_packages(mut self, packages: Vec<String>) -> Self {
        self.packages = packages;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltBinary {
    pub package: String,
    /// File name under `/user`.
    pub name: String,
    pub path: PathBuf,
    /// Supplied out of band rather than compiled.
    pub prebuilt: bool,
}

/// Binary name of a package: the last import path element, without a
/// `@version` suffix.
pub fn binary_name(pkg: &str) -> &str {
    let pkg = pkg.split('@').next().unwrap_or(pkg).trim_end_matches('/');
    pkg.rsplit('/').next().unwrap_or(pkg)
}

/// A package to compile or pick up, in configuration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPackage {
    pub package: String,
    pub name: String,
    pub skip: bool,
}

/// Resolve which packages the request covers.
///
/// Duplicate binary names would overwrite each other under `/user` and are
/// rejected.
pub fn resolve_packages(
    cfg: &WorkingConfig,
    req: &BuildRequest,
) -> Result<Vec<ResolvedPackage>, BuildError> {
    let source = if req.packages.is_empty() {
        &cfg.config.packages
    } else {
        &req.packages
    };

    let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
    let mut resolved = Vec::new();
    for pkg in source {
        let name = binary_name(pkg);
        if name.is_empty() {
            return Err(BuildError::Config(format!("invalid package {:?}", pkg)));
        }
        if let Some(other) = seen.insert(name, pkg) {
            if other == pkg {
                continue;
            }
            return Err(BuildError::Config(format!(
                "packages {} and {} both produce a binary named {}",
                other, pkg, name
            )));
        }
        resolved.push(ResolvedPackage {
            package: pkg.clone(),
            name: name.to_string(),
            skip: req.skip.contains(pkg),
        });
    }
    Ok(resolved)
}

/// Compile the request into `output_dir`, blocking on a tokio runtime.
pub fn build(
    output_dir: &Path,
    cfg: &WorkingConfig,
    req: &BuildRequest,
) -> Result<Vec<BuiltBinary>, BuildError> {
    let runtime = tokio::runtime::Runtime::new().map_err(|source| BuildError::Io {
        path: output_dir.to_path_buf(),
        source,
    })?;
    runtime.block_on(build_async(output_dir, cfg, req))
}

/// Compile the request into `output_dir`.
///
/// Compilers run concurrently, at most one per available CPU. The first
/// failure cancels the others and is returned.
pub async fn build_async(
    output_dir: &Path,
    cfg: &WorkingConfig,
    req: &BuildRequest,
) -> Result<Vec<BuiltBinary>, BuildError> {
    let resolved = resolve_packages(cfg, req)?;
    std::fs::create_dir_all(output_dir).map_err(|source| BuildError::Io {
        path: output_dir.to_path_buf(),
        source,
    })?;

    let mut built: Vec<Option<BuiltBinary>> = vec![None; resolved.len()];
    let mut jobs = Vec::new();
    for (idx, pkg) in resolved.iter().enumerate() {
        let path = output_dir.join(&pkg.name);
        if pkg.skip {
            if !path.is_file() {
                return Err(BuildError::MissingPrebuilt {
                    package: pkg.package.clone(),
                    path,
                });
            }
            built[idx] = Some(BuiltBinary {
                package: pkg.package.clone(),
                name: pkg.name.clone(),
                path,
                prebuilt: true,
            });
        } else {
            jobs.push((idx, CompileJob::new(cfg, req, &pkg.package, path)));
        }
    }

    let limit = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    log::info!("compiling {} packages ({} at a time)", jobs.len(), limit);

    let semaphore = Arc::new(Semaphore::new(limit));
    let mut set = JoinSet::new();
    for (idx, job) in jobs {
        let semaphore = Arc::clone(&semaphore);
        set.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| BuildError::Tool(anyhow::anyhow!("worker pool closed: {}", e)))?;
            job.run().await.map(|bin| (idx, bin))
        });
    }

    while let Some(joined) = set.join_next().await {
        let outcome = joined
            .map_err(|e| BuildError::Tool(anyhow::anyhow!("compile task failed: {}", e)))
            .and_then(|r| r);
        match outcome {
            Ok((idx, bin)) => built[idx] = Some(bin),
            Err(e) => {
                // Dropping the aborted tasks kills their compilers.
                set.abort_all();
                return Err(e);
            }
        }
    }

    Ok(built.into_iter().flatten().collect())
}
