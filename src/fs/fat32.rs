//! FAT32 on-disk construction.
//!
//! Writes the BPB boot sector (with its backup at sector 6), the FSInfo
//! sector (backup at 7), both FATs with the reserved head entries, and a
//! zeroed root-directory cluster. Free-cluster accounting in FSInfo is left
//! at "unknown" (0xFFFFFFFF); the first mount computes it.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use rand::Rng;

use crate::device;
use crate::error::{BurnError, Result};
use crate::{FAT32_SECTORS_PER_CLUSTER, SECTOR_SIZE};

const RESERVED_SECTORS: u16 = 32;
const NUM_FATS: u8 = 2;

/// The smallest device worth formatting: reserved area, two one-sector
/// FATs and a single cluster.
const MIN_SECTORS: u64 = RESERVED_SECTORS as u64 + 2 + FAT32_SECTORS_PER_CLUSTER as u64;

/// The FAT32 BIOS parameter block, serialised field by field.
#[derive(Debug, Clone)]
pub struct BootSector {
    pub total_sectors: u32,
    pub fat_size: u32,
    pub volume_id: u32,
    pub label: [u8; 11],
}

impl BootSector {
    pub fn new(total_sectors: u32, label: &str) -> Self {
        Self {
            total_sectors,
            fat_size: fat_size_sectors(total_sectors),
            volume_id: rand::thread_rng().gen(),
            label: pad_label(label),
        }
    }

    pub fn to_bytes(&self) -> [u8; 512] {
        let mut raw = [0u8; 512];
        raw[0..3].copy_from_slice(&[0xEB, 0x58, 0x90]);
        raw[3..11].copy_from_slice(b"MSWIN4.1");
        raw[11..13].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
        raw[13] = FAT32_SECTORS_PER_CLUSTER;
        raw[14..16].copy_from_slice(&RESERVED_SECTORS.to_le_bytes());
        raw[16] = NUM_FATS;
        // root entry count and 16-bit totals stay zero on FAT32
        raw[21] = 0xF8; // media descriptor
        raw[24..26].copy_from_slice(&63u16.to_le_bytes()); // sectors per track
        raw[26..28].copy_from_slice(&255u16.to_le_bytes()); // heads
        raw[32..36].copy_from_slice(&self.total_sectors.to_le_bytes());
        raw[36..40].copy_from_slice(&self.fat_size.to_le_bytes());
        raw[44..48].copy_from_slice(&2u32.to_le_bytes()); // root cluster
        raw[48..50].copy_from_slice(&1u16.to_le_bytes()); // fsinfo sector
        raw[50..52].copy_from_slice(&6u16.to_le_bytes()); // backup boot sector
        raw[64] = 0x80; // drive number
        raw[66] = 0x29; // extended boot signature
        raw[67..71].copy_from_slice(&self.volume_id.to_le_bytes());
        raw[71..82].copy_from_slice(&self.label);
        raw[82..90].copy_from_slice(b"FAT32   ");
        raw[510] = 0x55;
        raw[511] = 0xAA;
        raw
    }

    /// First sector of the data region (root directory lives there).
    pub fn data_start_sector(&self) -> u64 {
        RESERVED_SECTORS as u64 + NUM_FATS as u64 * self.fat_size as u64
    }
}

/// Sectors per FAT for a volume of `total_sectors`, rounded up.
///
/// Each FAT sector maps 128 clusters of 8 sectors; the `+ num_fats` term
/// accounts for the FATs consuming part of the mapped area themselves.
pub fn fat_size_sectors(total_sectors: u32) -> u32 {
    let data = total_sectors - RESERVED_SECTORS as u32;
    let divisor = 256 * FAT32_SECTORS_PER_CLUSTER as u32 + NUM_FATS as u32;
    data.div_ceil(divisor)
}

fn pad_label(label: &str) -> [u8; 11] {
    let mut padded = [b' '; 11];
    for (slot, byte) in padded.iter_mut().zip(label.bytes()) {
        *slot = byte.to_ascii_uppercase();
    }
    padded
}

fn fsinfo_bytes() -> [u8; 512] {
    let mut raw = [0u8; 512];
    raw[0..4].copy_from_slice(&0x4161_5252u32.to_le_bytes());
    raw[484..488].copy_from_slice(&0x6141_7272u32.to_le_bytes());
    raw[488..492].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // free count unknown
    raw[492..496].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // next free unknown
    raw[508..512].copy_from_slice(&0xAA55_0000u32.to_le_bytes());
    raw
}

/// First FAT sector: media entry, end-of-chain for the reserved cluster,
/// end-of-chain for the root directory cluster.
fn fat_head_bytes() -> [u8; 512] {
    let mut raw = [0u8; 512];
    raw[0..4].copy_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
    raw[4..8].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
    raw[8..12].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
    raw
}

/// Create a FAT32 filesystem on `target`.
pub fn create(target: &str, label: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(target)
        .map_err(|e| BurnError::open(target, e))?;

    let total_sectors = device::size_bytes(target)? / SECTOR_SIZE;
    if total_sectors < MIN_SECTORS {
        return Err(BurnError::DeviceTooSmall {
            image_bytes: MIN_SECTORS * SECTOR_SIZE,
            device_bytes: total_sectors * SECTOR_SIZE,
        });
    }
    let total_sectors = u32::try_from(total_sectors).unwrap_or(u32::MAX);

    let boot = BootSector::new(total_sectors, label);
    let boot_raw = boot.to_bytes();
    let fsinfo = fsinfo_bytes();
    let fat_head = fat_head_bytes();

    write_sector(&mut file, target, 0, &boot_raw)?;
    write_sector(&mut file, target, 6, &boot_raw)?;
    write_sector(&mut file, target, 1, &fsinfo)?;
    write_sector(&mut file, target, 7, &fsinfo)?;

    write_sector(&mut file, target, RESERVED_SECTORS as u64, &fat_head)?;
    write_sector(
        &mut file,
        target,
        RESERVED_SECTORS as u64 + boot.fat_size as u64,
        &fat_head,
    )?;

    // Zero the root directory cluster.
    let root = vec![0u8; (FAT32_SECTORS_PER_CLUSTER as u64 * SECTOR_SIZE) as usize];
    file.seek(SeekFrom::Start(boot.data_start_sector() * SECTOR_SIZE))
        .map_err(|e| BurnError::write(target, e))?;
    file.write_all(&root)
        .map_err(|e| BurnError::write(target, e))?;

    file.sync_all().map_err(|e| BurnError::write(target, e))?;
    Ok(())
}

fn write_sector(
    file: &mut std::fs::File,
    target: &str,
    lba: u64,
    data: &[u8; 512],
) -> Result<()> {
    file.seek(SeekFrom::Start(lba * SECTOR_SIZE))
        .map_err(|e| BurnError::write(target, e))?;
    file.write_all(data)
        .map_err(|e| BurnError::write(target, e))
}
