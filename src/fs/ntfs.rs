//! NTFS boot-sector construction.
//!
//! Writes the boot sector only. The MFT and its mirror are pointed at but
//! never materialised, so the volume is recognised by partition scanners
//! and `blkid` but is not mountable until a full NTFS layout is written.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use rand::Rng;

use crate::device;
use crate::error::{BurnError, Result};
use crate::SECTOR_SIZE;

/// NTFS boot sector, serialised field by field.
#[derive(Debug, Clone)]
pub struct BootSector {
    pub total_sectors: u64,
    pub volume_serial: u64,
}

impl BootSector {
    pub fn new(total_sectors: u64) -> Self {
        Self {
            total_sectors,
            volume_serial: rand::thread_rng().gen(),
        }
    }

    pub fn to_bytes(&self) -> [u8; 512] {
        let mut raw = [0u8; 512];
        raw[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
        raw[3..11].copy_from_slice(b"NTFS    ");
        raw[11..13].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
        raw[13] = 8; // sectors per cluster
        raw[21] = 0xF8; // media descriptor
        raw[24..26].copy_from_slice(&63u16.to_le_bytes()); // sectors per track
        raw[26..28].copy_from_slice(&255u16.to_le_bytes()); // heads
        raw[40..48].copy_from_slice(&self.total_sectors.to_le_bytes());
        raw[48..56].copy_from_slice(&(self.total_sectors / 2).to_le_bytes()); // MFT cluster
        raw[56..64].copy_from_slice(&(self.total_sectors - 1).to_le_bytes()); // MFT mirror
        raw[64] = (-10i8) as u8; // clusters per file record segment: 2^10 bytes
        raw[68] = 1; // clusters per index buffer
        raw[72..80].copy_from_slice(&self.volume_serial.to_le_bytes());
        raw[510] = 0x55;
        raw[511] = 0xAA;
        raw
    }
}

/// Write an NTFS boot sector to `target`. The label is accepted for
/// interface symmetry but lives in the (unwritten) $Volume record.
pub fn create(target: &str, _label: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(target)
        .map_err(|e| BurnError::open(target, e))?;

    let total_sectors = device::size_bytes(target)? / SECTOR_SIZE;
    if total_sectors < 16 {
        return Err(BurnError::DeviceTooSmall {
            image_bytes: 16 * SECTOR_SIZE,
            device_bytes: total_sectors * SECTOR_SIZE,
        });
    }

    let boot = BootSector::new(total_sectors);
    file.seek(SeekFrom::Start(0))
        .map_err(|e| BurnError::write(target, e))?;
    file.write_all(&boot.to_bytes())
        .map_err(|e| BurnError::write(target, e))?;
    file.sync_all().map_err(|e| BurnError::write(target, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_sector_layout() {
        let raw = BootSector::new(1_048_576).to_bytes();
        assert_eq!(&raw[0..3], &[0xEB, 0x52, 0x90]);
        assert_eq!(&raw[3..11], b"NTFS    ");
        assert_eq!(u16::from_le_bytes([raw[11], raw[12]]), 512);
        assert_eq!(raw[13], 8);
        assert_eq!(raw[21], 0xF8);
        assert_eq!(
            u64::from_le_bytes(raw[40..48].try_into().unwrap()),
            1_048_576
        );
        assert_eq!(
            u64::from_le_bytes(raw[48..56].try_into().unwrap()),
            524_288
        );
        assert_eq!(
            u64::from_le_bytes(raw[56..64].try_into().unwrap()),
            1_048_575
        );
        assert_eq!(raw[64] as i8, -10);
        assert_eq!(raw[68], 1);
        assert_eq!(raw[510], 0x55);
        assert_eq!(raw[511], 0xAA);
    }

    #[test]
    fn create_writes_recognisable_boot_sector() {
        let file = tempfile::NamedTempFile::new().expect("create scratch file");
        file.as_file().set_len(1024 * 1024).expect("size");
        create(file.path().to_str().unwrap(), "PERSISTENCE").expect("format");

        let data = std::fs::read(file.path()).expect("read back");
        assert_eq!(&data[3..11], b"NTFS    ");
        assert_eq!(data[510], 0x55);
        assert_eq!(data[511], 0xAA);
    }
}
