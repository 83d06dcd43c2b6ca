//! SBOM command - prints what a build of the instance would contain.

use anyhow::{Context, Result};
use std::io::Write;

use super::InstanceContext;
use rootcast::sbom::{generate_sbom_with_prebuilt, SbomFormat};

pub fn cmd_sbom(ctx: &InstanceContext, format: SbomFormat) -> Result<()> {
    let snapshot = ctx.config.snapshot();
    let builddir = ctx.instance.builddir();
    let prebuilt = ctx.instance.prebuilt_dir();
    let (marshaled, with_hash) = match generate_sbom_with_prebuilt(&snapshot, &builddir, Some(&prebuilt)) {
        Ok(sbom) => sbom,
        Err(e) if e.is_not_found() => {
            eprintln!("[WARN] {}", e);
            eprintln!(
                "Populate {} with the package's module (go.mod, go.sum) and retry.",
                builddir.display()
            );
            return Ok(());
        }
        Err(e) => return Err(e).context("Failed to generate SBOM"),
    };

    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(&format.render(&marshaled, &with_hash))
        .context("Failed to write SBOM")?;
    Ok(())
}
