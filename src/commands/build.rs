//! Build command - compiles the configured packages.

use anyhow::{Context, Result};
use std::path::PathBuf;

use super::InstanceContext;
use rootcast::build::{self, BuildRequest};
use rootcast::timing::Timer;

pub fn cmd_build(ctx: &InstanceContext, output: Option<PathBuf>, packages: Vec<String>) -> Result<()> {
    println!("=== Building {} ===\n", ctx.instance.name);
    let output = output.unwrap_or_else(|| ctx.instance.dir.join("bin"));
    let cfg = ctx.working();
    let req = BuildRequest::from_config(&cfg).with_packages(packages);

    let timer = Timer::start("compile");
    let binaries = build::build(&output, &cfg, &req)
        .with_context(|| format!("Failed to build into {}", output.display()))?;
    timer.finish();

    for bin in &binaries {
        let note = if bin.prebuilt { " (prebuilt)" } else { "" };
        println!("  [OK] {}{}", bin.path.display(), note);
    }
    println!("\n=== Build Complete ===");
    Ok(())
}
