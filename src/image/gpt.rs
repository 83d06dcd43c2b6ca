//! GUID Partition Table serialization.
//!
//! Writes the protective MBR, the primary header and entry array at the start
//! of the disk and the backup copies at the end. Output depends only on the
//! table contents, so identical layouts give identical bytes.

use thiserror::Error;
use uuid::{Builder, Uuid};

pub const SECTOR_SIZE: u64 = 512;
pub const ENTRY_COUNT: usize = 128;
pub const ENTRY_SIZE: usize = 128;
/// 128 entries * 128 bytes
pub const ENTRY_ARRAY_SECTORS: u64 = 32;
/// Protective MBR + header + entry array.
pub const PRIMARY_SECTORS: u64 = 2 + ENTRY_ARRAY_SECTORS;
/// Entry array + header.
pub const BACKUP_SECTORS: u64 = 1 + ENTRY_ARRAY_SECTORS;

const SIGNATURE: &[u8; 8] = b"EFI PART";
const REVISION: u32 = 0x0001_0000;
const HEADER_SIZE: u32 = 92;
/// Partition attribute bit 2, "legacy BIOS bootable".
pub const ATTR_LEGACY_BOOTABLE: u64 = 1 << 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GptError {
    #[error("no GPT signature at LBA 1")]
    MissingSignature,
    #[error("GPT {0} checksum mismatch")]
    Checksum(&'static str),
    #[error("GPT table truncated")]
    Truncated,
}

/// Deterministic version-4-shaped GUID from `seed` and `label`.
pub fn derive_guid(seed: &[u8], label: &str) -> Uuid {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update([0u8]);
    hasher.update(label.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Builder::from_random_bytes(bytes).into_uuid()
}

pub const EFI_SYSTEM_PARTITION: Uuid = Uuid::from_u128(0xC12A7328_F81F_11D2_BA4B_00A0C93EC93B);
pub const LINUX_ROOT_X86_64: Uuid = Uuid::from_u128(0x4F68BCE3_E8CD_4DB1_96E7_FBCAF984B709);
pub const LINUX_ROOT_ARM64: Uuid = Uuid::from_u128(0xB921B045_1DF0_41C3_AF44_4C6F280D3FAE);
pub const LINUX_FILESYSTEM: Uuid = Uuid::from_u128(0x0FC63DAF_8483_4772_8E79_3D69D8477DE4);

/// One used slot of the partition entry array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptEntry {
    pub type_guid: Uuid,
    pub unique_guid: Uuid,
    pub first_lba: u64,
    /// Inclusive.
    pub last_lba: u64,
    pub attributes: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptTable {
    pub disk_guid: Uuid,
    pub total_sectors: u64,
    pub entries: Vec<GptEntry>,
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

/// GPT stores the first three GUID fields little-endian.
fn get_guid(buf: &[u8], at: usize) -> Uuid {
    let mut b = [0u8; 16];
    b.copy_from_slice(&buf[at..at + 16]);
    Uuid::from_bytes_le(b)
}

impl GptTable {
    pub fn first_usable_lba(&self) -> u64 {
        PRIMARY_SECTORS
    }

    pub fn last_usable_lba(&self) -> u64 {
        self.total_sectors - BACKUP_SECTORS - 1
    }

    fn backup_header_lba(&self) -> u64 {
        self.total_sectors - 1
    }

    fn backup_entries_lba(&self) -> u64 {
        self.total_sectors - BACKUP_SECTORS
    }

    pub fn protective_mbr(&self) -> [u8; SECTOR_SIZE as usize] {
        let mut mbr = [0u8; SECTOR_SIZE as usize];
        let size = (self.total_sectors - 1).min(u32::MAX as u64) as u32;
        let entry = &mut mbr[446..462];
        entry[1..4].copy_from_slice(&[0x00, 0x02, 0x00]);
        entry[4] = 0xEE;
        entry[5..8].copy_from_slice(&[0xFF, 0xFF, 0xFF]);
        put_u32(entry, 8, 1);
        put_u32(entry, 12, size);
        mbr[510] = 0x55;
        mbr[511] = 0xAA;
        mbr
    }

    pub fn entry_array(&self) -> Vec<u8> {
        let mut buf = vec![0u8; ENTRY_COUNT * ENTRY_SIZE];
        for (i, entry) in self.entries.iter().take(ENTRY_COUNT).enumerate() {
            let e = &mut buf[i * ENTRY_SIZE..(i + 1) * ENTRY_SIZE];
            e[0..16].copy_from_slice(&entry.type_guid.to_bytes_le());
            e[16..32].copy_from_slice(&entry.unique_guid.to_bytes_le());
            put_u64(e, 32, entry.first_lba);
            put_u64(e, 40, entry.last_lba);
            put_u64(e, 48, entry.attributes);
            for (j, unit) in entry.name.encode_utf16().take(36).enumerate() {
                e[56 + j * 2..58 + j * 2].copy_from_slice(&unit.to_le_bytes());
            }
        }
        buf
    }

    fn header(&self, my_lba: u64, alternate_lba: u64, entries_lba: u64, entries_crc: u32) -> Vec<u8> {
        let mut h = vec![0u8; SECTOR_SIZE as usize];
        h[0..8].copy_from_slice(SIGNATURE);
        put_u32(&mut h, 8, REVISION);
        put_u32(&mut h, 12, HEADER_SIZE);
        put_u64(&mut h, 24, my_lba);
        put_u64(&mut h, 32, alternate_lba);
        put_u64(&mut h, 40, self.first_usable_lba());
        put_u64(&mut h, 48, self.last_usable_lba());
        h[56..72].copy_from_slice(&self.disk_guid.to_bytes_le());
        put_u64(&mut h, 72, entries_lba);
        put_u32(&mut h, 80, ENTRY_COUNT as u32);
        put_u32(&mut h, 84, ENTRY_SIZE as u32);
        put_u32(&mut h, 88, entries_crc);
        let crc = crc32fast::hash(&h[..HEADER_SIZE as usize]);
        put_u32(&mut h, 16, crc);
        h
    }

    /// Bytes for LBA 0 up to the first usable LBA.
    pub fn primary(&self) -> Vec<u8> {
        let entries = self.entry_array();
        let crc = crc32fast::hash(&entries);
        let mut out = Vec::with_capacity((PRIMARY_SECTORS * SECTOR_SIZE) as usize);
        out.extend_from_slice(&self.protective_mbr());
        out.extend_from_slice(&self.header(1, self.backup_header_lba(), 2, crc));
        out.extend_from_slice(&entries);
        out
    }

    /// Byte offset and contents of the backup entry array and header.
    pub fn backup(&self) -> (u64, Vec<u8>) {
        let entries = self.entry_array();
        let crc = crc32fast::hash(&entries);
        let mut out = entries;
        out.extend_from_slice(&self.header(
            self.backup_header_lba(),
            1,
            self.backup_entries_lba(),
            crc,
        ));
        (self.backup_entries_lba() * SECTOR_SIZE, out)
    }

    /// Parse the primary table from the first [`PRIMARY_SECTORS`] of a disk.
    pub fn parse_primary(disk: &[u8]) -> Result<Self, GptError> {
        if disk.len() < (PRIMARY_SECTORS * SECTOR_SIZE) as usize {
            return Err(GptError::Truncated);
        }
        let header = &disk[SECTOR_SIZE as usize..2 * SECTOR_SIZE as usize];
        if &header[0..8] != SIGNATURE {
            return Err(GptError::MissingSignature);
        }
        let mut check = header[..HEADER_SIZE as usize].to_vec();
        check[16..20].fill(0);
        if crc32fast::hash(&check) != get_u32(header, 16) {
            return Err(GptError::Checksum("header"));
        }
        let entries_start = (get_u64(header, 72) * SECTOR_SIZE) as usize;
        let entries_end = entries_start + ENTRY_COUNT * ENTRY_SIZE;
        let array = disk
            .get(entries_start..entries_end)
            .ok_or(GptError::Truncated)?;
        if crc32fast::hash(array) != get_u32(header, 88) {
            return Err(GptError::Checksum("entry array"));
        }

        let mut entries = Vec::new();
        for raw in array.chunks(ENTRY_SIZE) {
            let type_guid = get_guid(raw, 0);
            if type_guid.is_nil() {
                continue;
            }
            let units: Vec<u16> = raw[56..128]
                .chunks(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .take_while(|u| *u != 0)
                .collect();
            entries.push(GptEntry {
                type_guid,
                unique_guid: get_guid(raw, 16),
                first_lba: get_u64(raw, 32),
                last_lba: get_u64(raw, 40),
                attributes: get_u64(raw, 48),
                name: String::from_utf16_lossy(&units),
            });
        }

        Ok(GptTable {
            disk_guid: get_guid(header, 56),
            total_sectors: get_u64(header, 32) + 1,
            entries,
        })
    }
}
