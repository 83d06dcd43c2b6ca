//! Partition layout computation.
//!
//! The disk holds, in order: a FAT32 boot partition, two equally sized root
//! partitions (A and B) and an optional data partition. Only one root is
//! active at a time; updates write the other one and then flip the pointer.
//!
//! Every partition starts on an [`ALIGNMENT`] boundary after the primary GPT,
//! and the last one ends before the backup GPT.

use super::gpt::{
    self, GptEntry, GptTable, ATTR_LEGACY_BOOTABLE, BACKUP_SECTORS, PRIMARY_SECTORS,
    SECTOR_SIZE,
};
use crate::config::LayoutConfig;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub const MIB: u64 = 1024 * 1024;

/// Partition alignment (1MB alignment is standard).
pub const ALIGNMENT: u64 = MIB;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PartitionRole {
    Boot,
    RootA,
    RootB,
    Data,
}

impl PartitionRole {
    pub fn name(self) -> &'static str {
        match self {
            PartitionRole::Boot => "boot",
            PartitionRole::RootA => "root-a",
            PartitionRole::RootB => "root-b",
            PartitionRole::Data => "data",
        }
    }
}

impl fmt::Display for PartitionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Fat32,
    Squashfs,
    /// Formatted by the appliance on first boot.
    Unformatted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub role: PartitionRole,
    pub offset: u64,
    pub size: u64,
    pub content: ContentType,
    pub part_uuid: Uuid,
    pub type_guid: Uuid,
}

impl Partition {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error(
        "target too small: partition {role} would end at {end} bytes, \
         but only {available} bytes are usable (capacity {capacity})"
    )]
    DeviceTooSmall {
        role: PartitionRole,
        end: u64,
        available: u64,
        capacity: u64,
    },

    #[error("partition {role} too small: content is {content} bytes, partition holds {size}")]
    PartitionTooSmall {
        role: PartitionRole,
        content: u64,
        size: u64,
    },

    #[error("invalid layout: {0}")]
    Invalid(String),
}

impl LayoutError {
    /// The partition that did not fit, if this is a capacity error.
    pub fn role(&self) -> Option<PartitionRole> {
        match self {
            LayoutError::DeviceTooSmall { role, .. } | LayoutError::PartitionTooSmall { role, .. } => {
                Some(*role)
            }
            LayoutError::Invalid(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSize {
    None,
    Fixed(u64),
    /// Whatever remains after the root partitions.
    Fill,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutSpec {
    pub boot_size: u64,
    pub root_size: u64,
    pub data: DataSize,
    /// Capacity of image files; `None` sizes the image to fit.
    pub image_size: Option<u64>,
    pub root_type: Uuid,
}

impl LayoutSpec {
    pub fn from_config(config: &LayoutConfig, goarch: &str) -> Self {
        let data = match config.data_mib {
            None => DataSize::None,
            Some(0) => DataSize::Fill,
            Some(n) => DataSize::Fixed(n * MIB),
        };
        Self {
            boot_size: config.boot_mib * MIB,
            root_size: config.root_mib * MIB,
            data,
            image_size: config.image_mib.map(|n| n * MIB),
            root_type: root_type_for(goarch),
        }
    }
}

/// Discoverable-partitions type GUID for a root filesystem of `goarch`.
pub fn root_type_for(goarch: &str) -> Uuid {
    match goarch {
        "arm64" => gpt::LINUX_ROOT_ARM64,
        _ => gpt::LINUX_ROOT_X86_64,
    }
}

fn align_up(v: u64, to: u64) -> u64 {
    v.div_ceil(to) * to
}

fn align_down(v: u64, to: u64) -> u64 {
    v / to * to
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLayout {
    pub disk_guid: Uuid,
    pub capacity: u64,
    pub partitions: Vec<Partition>,
}

impl PartitionLayout {
    /// Lay out `spec` on a target of `capacity` bytes.
    ///
    /// `capacity` is the device size for block devices. For image files it
    /// is `None`, and `spec.image_size` (or the smallest fitting size) is
    /// used instead. GUIDs derive from `seed`, so equal inputs give equal
    /// layouts.
    pub fn compute(
        spec: &LayoutSpec,
        capacity: Option<u64>,
        seed: &[u8],
    ) -> Result<Self, LayoutError> {
        if spec.boot_size == 0 || spec.root_size == 0 {
            return Err(LayoutError::Invalid(
                "boot and root partitions need a non-zero size".into(),
            ));
        }
        let capacity = match capacity.or(spec.image_size) {
            Some(c) => align_down(c, SECTOR_SIZE),
            None => Self::minimal_size(spec),
        };
        let available = capacity.saturating_sub(BACKUP_SECTORS * SECTOR_SIZE);

        let mut planned = vec![
            (PartitionRole::Boot, spec.boot_size),
            (PartitionRole::RootA, spec.root_size),
            (PartitionRole::RootB, spec.root_size),
        ];
        if let DataSize::Fixed(size) = spec.data {
            planned.push((PartitionRole::Data, size));
        }

        let mut partitions = Vec::new();
        let mut offset = align_up(PRIMARY_SECTORS * SECTOR_SIZE, ALIGNMENT);
        for (role, size) in planned {
            let end = offset + size;
            if end > available {
                return Err(LayoutError::DeviceTooSmall {
                    role,
                    end,
                    available,
                    capacity,
                });
            }
            partitions.push(Self::partition(spec, seed, role, offset, size));
            offset = align_up(end, ALIGNMENT);
        }

        if spec.data == DataSize::Fill {
            let size = align_down(available.saturating_sub(offset), ALIGNMENT);
            if size > 0 {
                partitions.push(Self::partition(spec, seed, PartitionRole::Data, offset, size));
            } else {
                log::info!("no space left for a data partition, omitting it");
            }
        }

        let layout = Self {
            disk_guid: gpt::derive_guid(seed, "disk"),
            capacity,
            partitions,
        };
        layout.validate()?;
        Ok(layout)
    }

    fn partition(
        spec: &LayoutSpec,
        seed: &[u8],
        role: PartitionRole,
        offset: u64,
        size: u64,
    ) -> Partition {
        let (content, type_guid) = match role {
            PartitionRole::Boot => (ContentType::Fat32, gpt::EFI_SYSTEM_PARTITION),
            PartitionRole::RootA | PartitionRole::RootB => (ContentType::Squashfs, spec.root_type),
            PartitionRole::Data => (ContentType::Unformatted, gpt::LINUX_FILESYSTEM),
        };
        Partition {
            role,
            offset,
            size,
            content,
            part_uuid: gpt::derive_guid(seed, role.name()),
            type_guid,
        }
    }

    /// Smallest image holding the fixed-size partitions of `spec`.
    pub fn minimal_size(spec: &LayoutSpec) -> u64 {
        let mut end = align_up(PRIMARY_SECTORS * SECTOR_SIZE, ALIGNMENT);
        end = align_up(end + spec.boot_size, ALIGNMENT);
        end = align_up(end + spec.root_size, ALIGNMENT);
        end += spec.root_size;
        if let DataSize::Fixed(size) = spec.data {
            end = align_up(end, ALIGNMENT) + size;
        }
        align_up(end + BACKUP_SECTORS * SECTOR_SIZE, ALIGNMENT)
    }

    /// Check ordering, alignment, disjointness and capacity.
    pub fn validate(&self) -> Result<(), LayoutError> {
        let first_usable = PRIMARY_SECTORS * SECTOR_SIZE;
        let available = self.capacity.saturating_sub(BACKUP_SECTORS * SECTOR_SIZE);
        let mut prev_end = first_usable;
        for p in &self.partitions {
            if p.offset % ALIGNMENT != 0 {
                return Err(LayoutError::Invalid(format!(
                    "partition {} at {} is not aligned to {}",
                    p.role, p.offset, ALIGNMENT
                )));
            }
            if p.size == 0 || p.size % SECTOR_SIZE != 0 {
                return Err(LayoutError::Invalid(format!(
                    "partition {} has invalid size {}",
                    p.role, p.size
                )));
            }
            if p.offset < prev_end {
                return Err(LayoutError::Invalid(format!(
                    "partition {} at {} overlaps the preceding area ending at {}",
                    p.role, p.offset, prev_end
                )));
            }
            if p.end() > available {
                return Err(LayoutError::DeviceTooSmall {
                    role: p.role,
                    end: p.end(),
                    available,
                    capacity: self.capacity,
                });
            }
            prev_end = p.end();
        }
        Ok(())
    }

    pub fn get(&self, role: PartitionRole) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.role == role)
    }

    /// Fail unless `content_len` bytes fit into the partition for `role`.
    pub fn check_fits(&self, role: PartitionRole, content_len: u64) -> Result<(), LayoutError> {
        let partition = self
            .get(role)
            .ok_or_else(|| LayoutError::Invalid(format!("layout has no {} partition", role)))?;
        if content_len > partition.size {
            return Err(LayoutError::PartitionTooSmall {
                role,
                content: content_len,
                size: partition.size,
            });
        }
        Ok(())
    }

    pub fn gpt(&self) -> GptTable {
        GptTable {
            disk_guid: self.disk_guid,
            total_sectors: self.capacity / SECTOR_SIZE,
            entries: self
                .partitions
                .iter()
                .map(|p| GptEntry {
                    type_guid: p.type_guid,
                    unique_guid: p.part_uuid,
                    first_lba: p.offset / SECTOR_SIZE,
                    last_lba: p.end() / SECTOR_SIZE - 1,
                    attributes: if p.role == PartitionRole::Boot {
                        ATTR_LEGACY_BOOTABLE
                    } else {
                        0
                    },
                    name: p.role.name().to_string(),
                })
                .collect(),
        }
    }

    /// Print the layout in the `  name  offset  size` style of the build log.
    pub fn print(&self) {
        for p in &self.partitions {
            println!(
                "  {:<7} offset {:>6} MiB  size {:>6} MiB  PARTUUID {}",
                p.role.name(),
                p.offset / MIB,
                p.size / MIB,
                p.part_uuid
            );
        }
    }
}
