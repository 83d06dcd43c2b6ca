//! Overwrite command - writes a complete image to a file or a device.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;

use super::InstanceContext;
use rootcast::device::{self, is_block_device};
use rootcast::image::HostImager;
use rootcast::pack::{OutputTarget, Packer};
use rootcast::timing::Timer;

pub fn cmd_overwrite(ctx: &InstanceContext, full: Option<PathBuf>, device_path: Option<PathBuf>) -> Result<()> {
    let target = match (full, device_path) {
        (Some(file), None) => {
            if is_block_device(&file) {
                bail!(
                    "{} is a block device; use --device to overwrite it",
                    file.display()
                );
            }
            OutputTarget::File(file)
        }
        (None, Some(dev)) => {
            if !is_block_device(&dev) {
                bail!("{} is not a block device", dev.display());
            }
            OutputTarget::Device(dev)
        }
        _ => bail!("exactly one of --full or --device is required"),
    };

    println!("=== Overwriting {} ===\n", target.path().display());
    let cfg = ctx.working();
    let imager = HostImager;
    let platform = device::platform();
    let packer = Packer::new(&cfg, &imager, &platform).with_prebuilt_dir(ctx.instance.prebuilt_dir());

    let timer = Timer::start("overwrite");
    let outcome = packer
        .run(&target)
        .with_context(|| format!("Failed to write {}", target.path().display()))?;
    timer.finish();

    println!("\n=== Image Complete ===");
    println!("  SBOM:     {}", outcome.sbom.sbom_hash);
    println!("  Programs: {}", outcome.binaries.len());
    Ok(())
}
