//! CLI command handlers.
//!
//! - `build` - compile the configured packages
//! - `sbom` - print the SBOM or its hash
//! - `overwrite` - write a full image to a file or device
//! - `update` - commit a new root filesystem to a running instance
//! - `run` - build the package in the current directory and divert to it

mod build;
mod overwrite;
mod run;
mod sbom;
mod update;

pub use build::cmd_build;
pub use overwrite::cmd_overwrite;
pub use run::cmd_run;
pub use sbom::cmd_sbom;
pub use update::cmd_update;

use anyhow::{Context, Result};
use rootcast::config::{self, BuildConfig, Instance, WorkingConfig};
use rootcast::update::{CancelHandle, CancelSignal};

/// The instance a command operates on.
pub struct InstanceContext {
    pub instance: Instance,
    pub config: BuildConfig,
}

impl InstanceContext {
    pub fn open(name: &str) -> Result<Self> {
        let parent = config::parent_dir();
        let instance = Instance::open(&parent, name)
            .with_context(|| format!("Failed to open instance {}", name))?;
        let config = instance
            .read_config()
            .with_context(|| format!("Failed to read {}", instance.config_path().display()))?;
        Ok(Self { instance, config })
    }

    pub fn working(&self) -> WorkingConfig {
        WorkingConfig::new(self.config.clone(), self.instance.builddir())
    }
}

/// Cancel `signal` on Ctrl-C. Must be called within a tokio runtime.
pub(crate) fn cancel_on_ctrl_c() -> CancelSignal {
    let (handle, signal): (CancelHandle, CancelSignal) = CancelSignal::pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted, cancelling transfer...");
            handle.cancel();
        }
    });
    signal
}

pub(crate) fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("Failed to start tokio runtime")
}
