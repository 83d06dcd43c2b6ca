//! rootcast - appliance image builder and updater.
//!
//! Builds A/B disk images for a single-purpose appliance:
//! - FAT32 boot partition (systemd-boot, kernel)
//! - Two squashfs root partitions, one active at a time
//! - Optional data partition
//!
//! and pushes new roots or single binaries to running instances.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use commands::InstanceContext;
use rootcast::sbom::SbomFormat;

#[derive(Parser)]
#[command(name = "rootcast")]
#[command(about = "Appliance image builder and updater")]
#[command(
    after_help = "QUICK START:\n  rootcast -i scanner overwrite --full disk.img  Build a disk image\n  rootcast -i scanner update                     Commit a new root\n  rootcast -i scanner run                        Try the package in the current directory"
)]
struct Cli {
    /// Instance name (directory under $ROOTCAST_PARENT_DIR)
    #[arg(short, long, global = true, default_value = "hello")]
    instance: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile the configured packages
    Build {
        /// Output directory (default: <instance>/bin)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Packages to build instead of the configured ones
        packages: Vec<String>,
    },

    /// Print the SBOM of the instance
    Sbom {
        /// Output format: json or hash
        #[arg(long, default_value = "json")]
        format: SbomFormat,
    },

    /// Write a complete image to a file or a block device
    Overwrite {
        /// Write a full disk image file
        #[arg(long, conflicts_with = "device", required_unless_present = "device")]
        full: Option<PathBuf>,
        /// Overwrite a block device
        #[arg(long)]
        device: Option<PathBuf>,
    },

    /// Build a new root filesystem and commit it to the running instance
    Update,

    /// Build the package in the current directory and run it on the instance
    /// until the next reboot
    Run {
        /// Keep the temporary build directory
        #[arg(long)]
        keep: bool,
    },
}

fn main() -> Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let ctx = InstanceContext::open(&cli.instance)?;

    match cli.command {
        Commands::Build { output, packages } => commands::cmd_build(&ctx, output, packages)?,
        Commands::Sbom { format } => commands::cmd_sbom(&ctx, format)?,
        Commands::Overwrite { full, device } => commands::cmd_overwrite(&ctx, full, device)?,
        Commands::Update => commands::cmd_update(&ctx)?,
        Commands::Run { keep } => commands::cmd_run(&ctx, keep)?,
    }

    Ok(())
}
