//! Full image builds.
//!
//! A pack run computes the SBOM and the partition layout first, so that a
//! target that is too small fails before anything is compiled. Nothing is
//! written to the target until every partition image exists and fits.

use crate::build::{self, BuildError, BuildRequest, BuiltBinary};
use crate::config::{ConfigSnapshot, WorkingConfig};
use crate::device::BlockDevice;
use crate::image::layout::{LayoutError, LayoutSpec, PartitionLayout, PartitionRole};
use crate::image::writer::{self, DeviceTarget, PartitionImages};
use crate::image::{boot, rootfs, ImageError, Imager};
use crate::process::require_tools;
use crate::sbom::{generate_sbom_with_prebuilt, SbomError, SbomWithHash};
use crate::scratch::ScratchDir;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PackError {
    #[error(transparent)]
    Sbom(#[from] SbomError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Image(#[from] ImageError),
}

impl From<anyhow::Error> for PackError {
    fn from(e: anyhow::Error) -> Self {
        PackError::Image(ImageError::Tool(e))
    }
}

impl PackError {
    /// The partition that did not fit, for capacity errors.
    pub fn overflowing_partition(&self) -> Option<PartitionRole> {
        match self {
            PackError::Layout(e) | PackError::Image(ImageError::Layout(e)) => e.role(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// A full disk image file, created or replaced.
    File(PathBuf),
    /// A block device, overwritten in place.
    Device(PathBuf),
}

impl OutputTarget {
    pub fn path(&self) -> &Path {
        match self {
            OutputTarget::File(p) | OutputTarget::Device(p) => p,
        }
    }
}

#[derive(Debug)]
pub struct PackOutcome {
    pub sbom: SbomWithHash,
    pub layout: PartitionLayout,
    pub binaries: Vec<BuiltBinary>,
}

/// Root filesystem built in a scratch directory.
struct PreparedRoot {
    binaries: Vec<BuiltBinary>,
    image: PathBuf,
}

pub struct Packer<'a> {
    cfg: &'a WorkingConfig,
    snapshot: ConfigSnapshot,
    imager: &'a dyn Imager,
    device: &'a dyn BlockDevice,
    prebuilt_dir: Option<PathBuf>,
}

impl<'a> Packer<'a> {
    /// The SBOM snapshot is taken here, before any build-time adjustment.
    pub fn new(cfg: &'a WorkingConfig, imager: &'a dyn Imager, device: &'a dyn BlockDevice) -> Self {
        Self {
            cfg,
            snapshot: cfg.config.snapshot(),
            imager,
            device,
            prebuilt_dir: None,
        }
    }

    pub fn with_prebuilt_dir(mut self, dir: PathBuf) -> Self {
        self.prebuilt_dir = Some(dir);
        self
    }

    fn sbom(&self) -> Result<(Vec<u8>, SbomWithHash), PackError> {
        Ok(generate_sbom_with_prebuilt(
            &self.snapshot,
            &self.cfg.builddir,
            self.prebuilt_dir.as_deref(),
        )?)
    }

    /// Copy skipped packages' binaries into the compile output directory.
    fn stage_prebuilt(&self, output_dir: &Path, req: &BuildRequest) -> Result<(), PackError> {
        let Some(ref dir) = self.prebuilt_dir else {
            return Ok(());
        };
        for pkg in &req.skip {
            let name = build::binary_name(pkg);
            let src = dir.join(name);
            if !src.is_file() {
                continue;
            }
            let dest = output_dir.join(name);
            fs::copy(&src, &dest).map_err(ImageError::io(&src))?;
        }
        Ok(())
    }

    fn prepare_root(&self, scratch: &Path, sbom_json: &[u8]) -> Result<PreparedRoot, PackError> {
        let bin_dir = scratch.join("bin");
        fs::create_dir_all(&bin_dir).map_err(ImageError::io(&bin_dir))?;
        let req = BuildRequest::from_config(self.cfg);
        self.stage_prebuilt(&bin_dir, &req)?;

        println!("Compiling packages...");
        let binaries = build::build(&bin_dir, self.cfg, &req)?;
        for bin in &binaries {
            let how = if bin.prebuilt { "prebuilt" } else { "built" };
            println!("  [OK] {} ({})", bin.package, how);
        }

        let staging = scratch.join("root");
        fs::create_dir_all(&staging).map_err(ImageError::io(&staging))?;
        rootfs::stage_rootfs(
            &staging,
            &rootfs::RootfsContents {
                hostname: self.snapshot.hostname(),
                binaries: &binaries,
                sbom_json,
            },
        )?;

        println!("Creating root filesystem image...");
        let image = scratch.join("root.img");
        self.imager.root_image(&staging, &image)?;
        Ok(PreparedRoot { binaries, image })
    }

    /// Build only the root filesystem image into `out`, for updates.
    pub fn root_image(&self, out: &Path) -> Result<SbomWithHash, PackError> {
        require_tools(self.imager.required_tools().iter().copied())?;
        let (sbom_json, sbom) = self.sbom()?;
        let scratch = ScratchDir::new("rootcast-pack-")?;
        let root = self.prepare_root(scratch.path(), &sbom_json)?;

        let spec = LayoutSpec::from_config(&self.cfg.config.layout, &self.cfg.internal.goarch);
        let len = fs::metadata(&root.image).map_err(ImageError::io(&root.image))?.len();
        if len > spec.root_size {
            return Err(LayoutError::PartitionTooSmall {
                role: PartitionRole::RootB,
                content: len,
                size: spec.root_size,
            }
            .into());
        }
        fs::copy(&root.image, out).map_err(ImageError::io(out))?;
        Ok(sbom)
    }

    /// Build a complete image and write it to `target`.
    pub fn run(&self, target: &OutputTarget) -> Result<PackOutcome, PackError> {
        require_tools(self.imager.required_tools().iter().copied())?;

        println!("Generating SBOM...");
        let (sbom_json, sbom) = self.sbom()?;
        println!("  [OK] {}", sbom.sbom_hash);

        let spec = LayoutSpec::from_config(&self.cfg.config.layout, &self.cfg.internal.goarch);
        let (device, capacity) = match target {
            OutputTarget::File(_) => (None, None),
            OutputTarget::Device(path) => {
                let dev = DeviceTarget::open(path)?;
                let size = dev.capacity(self.device)?;
                log::info!("{} holds {} bytes", path.display(), size);
                (Some(dev), Some(size))
            }
        };
        let layout = PartitionLayout::compute(&spec, capacity, sbom.sbom_hash.as_bytes())?;
        layout.print();

        let scratch = ScratchDir::new("rootcast-pack-")?;
        let root = self.prepare_root(scratch.path(), &sbom_json)?;

        let root_a = layout
            .get(PartitionRole::RootA)
            .ok_or_else(|| LayoutError::Invalid("layout has no root-a partition".into()))?;
        let boot_part = layout
            .get(PartitionRole::Boot)
            .ok_or_else(|| LayoutError::Invalid("layout has no boot partition".into()))?;

        let files = boot::boot_files(&self.cfg.config.boot, &root_a.part_uuid, &self.cfg.internal.goarch);
        let payload = boot::payload_size(&files).map_err(|source| ImageError::Io {
            path: self.cfg.config.boot.loader_efi.clone(),
            source,
        })?;
        layout.check_fits(PartitionRole::Boot, payload)?;

        println!("Creating boot partition image...");
        let boot_image = scratch.path().join("boot.img");
        self.imager.boot_image(
            &files,
            &boot_image,
            boot_part.size,
            boot::volume_id(&layout.disk_guid),
        )?;

        let root_len = fs::metadata(&root.image).map_err(ImageError::io(&root.image))?.len();
        layout.check_fits(PartitionRole::RootA, root_len)?;
        let boot_len = fs::metadata(&boot_image).map_err(ImageError::io(&boot_image))?.len();
        layout.check_fits(PartitionRole::Boot, boot_len)?;

        let images = PartitionImages {
            boot: boot_image,
            root: root.image,
        };
        match (target, device) {
            (OutputTarget::Device(path), Some(dev)) => {
                println!("Writing {}...", path.display());
                dev.write(self.device, &layout, &images)?;
            }
            (target, _) => {
                println!("Writing {}...", target.path().display());
                writer::write_image_file(target.path(), &layout, &images)?;
            }
        }
        println!("  [OK] {}", target.path().display());

        Ok(PackOutcome {
            sbom,
            layout,
            binaries: root.binaries,
        })
    }
}
