//! Update command - commits a freshly built root filesystem to an instance.

use anyhow::{Context, Result};

use super::{cancel_on_ctrl_c, runtime, InstanceContext};
use rootcast::device;
use rootcast::image::HostImager;
use rootcast::pack::Packer;
use rootcast::scratch::ScratchDir;
use rootcast::update::{Reporter, TransferSession, UpdateError, UpdateTarget};

pub fn cmd_update(ctx: &InstanceContext) -> Result<()> {
    println!("=== Updating {} ===\n", ctx.instance.name);
    let cfg = ctx.working();

    let scratch = ScratchDir::new("rootcast-update-")?;
    let image = scratch.path().join("root.squashfs");
    let imager = HostImager;
    let platform = device::platform();
    let sbom = Packer::new(&cfg, &imager, &platform)
        .with_prebuilt_dir(ctx.instance.prebuilt_dir())
        .root_image(&image)
        .context("Failed to build root filesystem")?;
    println!("  [OK] root filesystem {}", sbom.sbom_hash);

    let endpoint = ctx.instance.update_endpoint(&ctx.config)?;
    runtime()?.block_on(async {
        let cancel = cancel_on_ctrl_c();
        let mut target = UpdateTarget::connect(&endpoint, reqwest::Client::new())
            .await
            .context("Failed to connect to instance")?;

        let session = TransferSession::new();
        let reporter = Reporter::spawn(session.clone(), "Updating root", cancel.clone());
        let result = target.update_root(&image, &session, &cancel).await;
        reporter.stop().await;
        match result {
            Ok(()) => println!("  [OK] switched to the new root, rebooting"),
            Err(UpdateError::RebootFailed(e)) => {
                println!("  [OK] switched to the new root");
                println!("  [WARN] reboot request failed ({}); reboot the instance manually", e);
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context("Root update failed; the instance stays on its current root"))
            }
        }

        target.finish();
        Ok::<(), anyhow::Error>(())
    })
}
