//! Run command - builds the Go package in the current directory, uploads
//! it and diverts the matching service to it until the next reboot.

use anyhow::{Context, Result};
use std::path::PathBuf;

use super::{cancel_on_ctrl_c, runtime, InstanceContext};
use rootcast::build::{BuildRequest, CompileJob};
use rootcast::scratch::ScratchDir;
use rootcast::update::{Reporter, TransferSession, UpdateTarget, Upload};

pub fn cmd_run(ctx: &InstanceContext, keep: bool) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let name = cwd
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("Current directory has no name")?;

    let mut cfg = ctx.working();
    cfg.builddir = cwd;

    let scratch = ScratchDir::new("rootcast-run-")?;
    let binary: PathBuf = scratch.path().join(&name);
    let endpoint = ctx.instance.update_endpoint(&ctx.config)?;
    let staged = format!("rootcast-run/{}", name);
    let service = format!("/user/{}", name);

    runtime()?.block_on(async {
        println!("Building {}...", name);
        let job = CompileJob::new(&cfg, &BuildRequest::default(), ".", binary.clone());
        job.run().await.map_err(|e| match e.hint() {
            Some(hint) => anyhow::Error::new(e).context(hint),
            None => anyhow::Error::new(e),
        })?;

        let cancel = cancel_on_ctrl_c();
        let mut target = UpdateTarget::connect(&endpoint, reqwest::Client::new())
            .await
            .context("Failed to connect to instance")?;

        let session = TransferSession::new();
        let reporter = Reporter::spawn(session.clone(), format!("Uploading {}", name), cancel.clone());
        let upload = Upload::from_file(&binary).await?;
        let result = target.put(&staged, upload, &session, &cancel).await;
        reporter.stop().await;
        result.with_context(|| format!("Failed to upload {}", name))?;

        target
            .divert(&service, &staged)
            .await
            .with_context(|| format!("Failed to divert {}", service))?;
        target.finish();
        println!("  [OK] {} now runs the uploaded binary until the next reboot", service);
        Ok::<(), anyhow::Error>(())
    })?;

    if keep {
        println!("Kept build directory {}", scratch.keep().display());
    }
    Ok(())
}
