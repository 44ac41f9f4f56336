//! MBR and GPT partition-table construction.
//!
//! Every on-disk record here is a plain value with an explicit little-endian
//! `to_bytes`/`from_bytes`; nothing is reinterpret-cast out of a buffer. The
//! records are built in memory, serialised into fixed-size arrays, and only
//! then written, so a mis-sized record cannot reach the device.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;

use rand::Rng;
use tracing::{debug, info};

use crate::device;
use crate::error::{BurnError, Result};
use crate::SECTOR_SIZE;

/// Partition table flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableType {
    Mbr,
    Gpt,
}

impl std::fmt::Display for TableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableType::Mbr => write!(f, "MBR"),
            TableType::Gpt => write!(f, "GPT"),
        }
    }
}

/// Well-known MBR partition type codes.
pub mod part_type {
    pub const EMPTY: u8 = 0x00;
    pub const NTFS: u8 = 0x07;
    pub const FAT32_LBA: u8 = 0x0C;
    pub const LINUX: u8 = 0x83;
    pub const EFI_SYSTEM: u8 = 0xEF;
    pub const GPT_PROTECTIVE: u8 = 0xEE;
}

/// One 16-byte MBR partition entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbrEntry {
    pub status: u8,
    pub first_chs: [u8; 3],
    pub type_code: u8,
    pub last_chs: [u8; 3],
    pub first_lba: u32,
    pub sector_count: u32,
}

impl MbrEntry {
    pub const EMPTY: MbrEntry = MbrEntry {
        status: 0,
        first_chs: [0; 3],
        type_code: part_type::EMPTY,
        last_chs: [0; 3],
        first_lba: 0,
        sector_count: 0,
    };

    pub fn bootable(&self) -> bool {
        self.status == 0x80
    }

    pub fn from_bytes(raw: &[u8; 16]) -> Self {
        Self {
            status: raw[0],
            first_chs: [raw[1], raw[2], raw[3]],
            type_code: raw[4],
            last_chs: [raw[5], raw[6], raw[7]],
            first_lba: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            sector_count: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
        }
    }

    pub fn to_bytes(self) -> [u8; 16] {
        let mut raw = [0u8; 16];
        raw[0] = self.status;
        raw[1..4].copy_from_slice(&self.first_chs);
        raw[4] = self.type_code;
        raw[5..8].copy_from_slice(&self.last_chs);
        raw[8..12].copy_from_slice(&self.first_lba.to_le_bytes());
        raw[12..16].copy_from_slice(&self.sector_count.to_le_bytes());
        raw
    }
}

/// A complete 512-byte master boot record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mbr {
    pub boot_code: [u8; 440],
    pub disk_signature: u32,
    pub entries: [MbrEntry; 4],
}

/// Eight-byte stub seeded at the start of a fresh MBR: cli; xor ax,ax;
/// mov ss,ax; mov sp,0x7c00.
const MBR_STUB: [u8; 8] = [0xFA, 0x31, 0xC0, 0x8E, 0xD0, 0xBC, 0x00, 0x7C];

impl Mbr {
    /// A zeroed record with the minimal stub and a random disk signature.
    pub fn new() -> Self {
        let mut boot_code = [0u8; 440];
        boot_code[..MBR_STUB.len()].copy_from_slice(&MBR_STUB);
        Self {
            boot_code,
            disk_signature: rand::thread_rng().gen::<u32>() | 1,
            entries: [MbrEntry::EMPTY; 4],
        }
    }

    pub fn from_bytes(raw: &[u8; 512]) -> Self {
        let mut boot_code = [0u8; 440];
        boot_code.copy_from_slice(&raw[..440]);
        let mut entries = [MbrEntry::EMPTY; 4];
        for (i, entry) in entries.iter_mut().enumerate() {
            let offset = 446 + i * 16;
            let bytes: [u8; 16] = raw[offset..offset + 16].try_into().expect("16-byte slice");
            *entry = MbrEntry::from_bytes(&bytes);
        }
        Self {
            boot_code,
            disk_signature: u32::from_le_bytes([raw[440], raw[441], raw[442], raw[443]]),
            entries,
        }
    }

    pub fn to_bytes(&self) -> [u8; 512] {
        let mut raw = [0u8; 512];
        raw[..440].copy_from_slice(&self.boot_code);
        raw[440..444].copy_from_slice(&self.disk_signature.to_le_bytes());
        for (i, entry) in self.entries.iter().enumerate() {
            let offset = 446 + i * 16;
            raw[offset..offset + 16].copy_from_slice(&entry.to_bytes());
        }
        raw[510] = 0x55;
        raw[511] = 0xAA;
        raw
    }

    /// Index of the first empty slot, if any.
    pub fn free_slot(&self) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.type_code == part_type::EMPTY)
    }
}

impl Default for Mbr {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode an LBA as a 3-byte CHS tuple with the classic 255/63 geometry.
///
/// Cylinders above 1023 are clamped; every modern consumer of the entry
/// uses the LBA fields and treats CHS as decorative.
pub fn chs_from_lba(lba: u32) -> [u8; 3] {
    const SECTORS_PER_TRACK: u32 = 63;
    const HEADS: u32 = 255;

    let cylinder = (lba / (HEADS * SECTORS_PER_TRACK)).min(1023);
    let rem = lba % (HEADS * SECTORS_PER_TRACK);
    let head = rem / SECTORS_PER_TRACK;
    let sector = rem % SECTORS_PER_TRACK + 1;

    [
        (head & 0xFF) as u8,
        (((cylinder >> 2) & 0xC0) | (sector & 0x3F)) as u8,
        (cylinder & 0xFF) as u8,
    ]
}

/// Decode a CHS tuple back to an LBA with the same fixed geometry.
pub fn lba_from_chs(chs: [u8; 3]) -> u32 {
    const SECTORS_PER_TRACK: u32 = 63;
    const HEADS: u32 = 255;

    let head = chs[0] as u32;
    let sector = (chs[1] & 0x3F) as u32;
    let cylinder = (((chs[1] as u32) & 0xC0) << 2) | chs[2] as u32;

    (cylinder * HEADS + head) * SECTORS_PER_TRACK + sector - 1
}

/// CRC32 (IEEE, polynomial 0xEDB88320) with a table computed at compile
/// time. GPT tables can be large enough that the bytewise loop matters.
const CRC32_TABLE: [u32; 256] = build_crc32_table();

const fn build_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        let index = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

/// Random RFC 4122 version-4 GUID, stored raw.
pub fn random_guid() -> [u8; 16] {
    let mut guid = [0u8; 16];
    rand::thread_rng().fill(&mut guid[..]);
    guid[6] = (guid[6] & 0x0F) | 0x40;
    guid[8] = (guid[8] & 0x3F) | 0x80;
    guid
}

/// The 92-byte GPT header, serialised into the first part of LBA 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptHeader {
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: [u8; 16],
    pub partition_entry_lba: u64,
    pub num_partition_entries: u32,
    pub partition_entry_size: u32,
    pub partition_array_crc32: u32,
}

pub const GPT_ENTRY_COUNT: u32 = 128;
pub const GPT_ENTRY_SIZE: u32 = 128;

impl GptHeader {
    pub fn new(device_sectors: u64) -> Self {
        Self {
            revision: 0x0001_0000,
            header_size: 92,
            header_crc32: 0,
            current_lba: 1,
            backup_lba: device_sectors - 1,
            first_usable_lba: 34,
            last_usable_lba: device_sectors - 34,
            disk_guid: random_guid(),
            partition_entry_lba: 2,
            num_partition_entries: GPT_ENTRY_COUNT,
            partition_entry_size: GPT_ENTRY_SIZE,
            partition_array_crc32: 0,
        }
    }

    /// Serialise into a full 512-byte LBA, zero-padded past byte 92.
    /// `header_crc32` is written as stored; call [`GptHeader::seal`] first.
    pub fn to_bytes(&self) -> [u8; 512] {
        let mut raw = [0u8; 512];
        raw[0..8].copy_from_slice(b"EFI PART");
        raw[8..12].copy_from_slice(&self.revision.to_le_bytes());
        raw[12..16].copy_from_slice(&self.header_size.to_le_bytes());
        raw[16..20].copy_from_slice(&self.header_crc32.to_le_bytes());
        // bytes 20..24 reserved, zero
        raw[24..32].copy_from_slice(&self.current_lba.to_le_bytes());
        raw[32..40].copy_from_slice(&self.backup_lba.to_le_bytes());
        raw[40..48].copy_from_slice(&self.first_usable_lba.to_le_bytes());
        raw[48..56].copy_from_slice(&self.last_usable_lba.to_le_bytes());
        raw[56..72].copy_from_slice(&self.disk_guid);
        raw[72..80].copy_from_slice(&self.partition_entry_lba.to_le_bytes());
        raw[80..84].copy_from_slice(&self.num_partition_entries.to_le_bytes());
        raw[84..88].copy_from_slice(&self.partition_entry_size.to_le_bytes());
        raw[88..92].copy_from_slice(&self.partition_array_crc32.to_le_bytes());
        raw
    }

    /// Store the entry-array CRC and compute the header CRC over the first
    /// 92 bytes with the header-CRC field zeroed.
    pub fn seal(&mut self, entry_array: &[u8]) {
        self.partition_array_crc32 = crc32(entry_array);
        self.header_crc32 = 0;
        let raw = self.to_bytes();
        self.header_crc32 = crc32(&raw[..92]);
    }
}

/// An open device with a partition table under construction.
pub struct PartitionTable {
    device: String,
    file: File,
    device_sectors: u64,
    table: TableType,
}

impl PartitionTable {
    /// Open `device` read-write with synchronous writes and size it.
    pub fn open(device: &str, table: TableType) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(device)
            .map_err(|e| BurnError::open(device, e))?;
        let device_sectors = device::size_bytes(device)? / SECTOR_SIZE;
        debug!("{device}: {device_sectors} sectors");
        Ok(Self {
            device: device.to_string(),
            file,
            device_sectors,
            table,
        })
    }

    pub fn device_sectors(&self) -> u64 {
        self.device_sectors
    }

    pub fn table_type(&self) -> TableType {
        self.table
    }

    /// Write a fresh, empty MBR at LBA 0.
    pub fn create_mbr(&mut self) -> Result<()> {
        info!("creating MBR partition table on {}", self.device);
        let mbr = Mbr::new();
        self.write_sector(0, &mbr.to_bytes())?;
        self.file
            .sync_all()
            .map_err(|e| BurnError::write(&self.device, e))?;
        Ok(())
    }

    /// Write a protective MBR, the GPT header at LBA 1 and a zeroed
    /// 128-entry partition array at LBA 2.
    pub fn create_gpt(&mut self) -> Result<()> {
        info!("creating GPT partition table on {}", self.device);

        let mut protective = Mbr::new();
        protective.boot_code = [0u8; 440];
        protective.disk_signature = 0;
        protective.entries[0] = MbrEntry {
            status: 0x00,
            first_chs: chs_from_lba(1),
            type_code: part_type::GPT_PROTECTIVE,
            last_chs: chs_from_lba(u32::MAX),
            first_lba: 1,
            sector_count: u32::try_from(self.device_sectors - 1).unwrap_or(u32::MAX),
        };
        self.write_sector(0, &protective.to_bytes())?;

        let entry_array = vec![0u8; (GPT_ENTRY_COUNT * GPT_ENTRY_SIZE) as usize];
        let mut header = GptHeader::new(self.device_sectors);
        header.seal(&entry_array);

        self.write_sector(1, &header.to_bytes())?;
        self.write_at(2 * SECTOR_SIZE, &entry_array)?;

        self.file
            .sync_all()
            .map_err(|e| BurnError::write(&self.device, e))?;
        Ok(())
    }

    /// Add a partition entry to the first free MBR slot.
    ///
    /// Reads the record back from the device so entries added by an earlier
    /// stage (or by the image itself) are preserved.
    ///
    /// # Errors
    ///
    /// `TableFull` when all four slots carry a non-zero type.
    pub fn add_mbr_partition(
        &mut self,
        start_lba: u32,
        sector_count: u32,
        type_code: u8,
        bootable: bool,
    ) -> Result<usize> {
        let mut mbr = self.read_mbr()?;
        let slot = mbr.free_slot().ok_or(BurnError::TableFull)?;

        mbr.entries[slot] = MbrEntry {
            status: if bootable { 0x80 } else { 0x00 },
            first_chs: chs_from_lba(start_lba),
            type_code,
            last_chs: chs_from_lba(start_lba + sector_count - 1),
            first_lba: start_lba,
            sector_count,
        };

        self.write_sector(0, &mbr.to_bytes())?;
        self.file
            .sync_all()
            .map_err(|e| BurnError::write(&self.device, e))?;

        info!(
            "partition {} added: LBA {start_lba}, {sector_count} sectors, type {type_code:#04x}",
            slot + 1
        );
        Ok(slot)
    }

    /// Read the current MBR off the device.
    pub fn read_mbr(&mut self) -> Result<Mbr> {
        let mut raw = [0u8; 512];
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| BurnError::read(&self.device, e))?;
        self.file
            .read_exact(&mut raw)
            .map_err(|e| BurnError::read(&self.device, e))?;
        Ok(Mbr::from_bytes(&raw))
    }

    /// Flush the table and ask the kernel to pick it up. Waiting for the
    /// child partition nodes to appear is the orchestrator's job.
    pub fn commit(mut self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| BurnError::write(&self.device, e))?;
        drop(self.file);
        device::reread_partition_table(&self.device)
    }

    fn write_sector(&mut self, lba: u64, data: &[u8; 512]) -> Result<()> {
        self.write_at(lba * SECTOR_SIZE, data)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| BurnError::write(&self.device, e))?;
        self.file
            .write_all(data)
            .map_err(|e| BurnError::write(&self.device, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_device(sectors: u64) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().expect("create scratch device");
        file.as_file()
            .set_len(sectors * SECTOR_SIZE)
            .expect("size scratch device");
        file
    }

    #[test]
    fn mbr_round_trips_and_carries_signature() {
        let mbr = Mbr::new();
        let raw = mbr.to_bytes();
        assert_eq!(raw.len(), 512);
        assert_eq!(raw[510], 0x55);
        assert_eq!(raw[511], 0xAA);
        assert_eq!(&raw[..8], &MBR_STUB);
        assert_ne!(mbr.disk_signature, 0);
        assert_eq!(Mbr::from_bytes(&raw), mbr);
    }

    #[test]
    fn entry_serialisation_is_little_endian() {
        let entry = MbrEntry {
            status: 0x80,
            first_chs: [1, 2, 3],
            type_code: part_type::FAT32_LBA,
            last_chs: [4, 5, 6],
            first_lba: 2048,
            sector_count: 0x0102_0304,
        };
        let raw = entry.to_bytes();
        assert_eq!(raw[8..12], [0x00, 0x08, 0x00, 0x00]);
        assert_eq!(raw[12..16], [0x04, 0x03, 0x02, 0x01]);
        assert_eq!(MbrEntry::from_bytes(&raw), entry);
    }

    #[test]
    fn chs_round_trips_below_the_clamp() {
        for lba in [0u32, 62, 63, 2048, 1_000_000, 16_450_559] {
            assert_eq!(lba_from_chs(chs_from_lba(lba)), lba, "lba {lba}");
        }
    }

    #[test]
    fn chs_clamps_large_cylinders() {
        // 1023 * 255 * 63 is the largest addressable cylinder start.
        let clamped = chs_from_lba(u32::MAX);
        let cylinder = (((clamped[1] as u32) & 0xC0) << 2) | clamped[2] as u32;
        assert_eq!(cylinder, 1023);
    }

    #[test]
    fn crc32_matches_known_vectors() {
        // IEEE reference value for "123456789".
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn guid_is_version_4() {
        let guid = random_guid();
        assert_eq!(guid[6] & 0xF0, 0x40);
        assert_eq!(guid[8] & 0xC0, 0x80);
    }

    #[test]
    fn gpt_header_crc_is_self_consistent() {
        let entries = vec![0u8; (GPT_ENTRY_COUNT * GPT_ENTRY_SIZE) as usize];
        let mut header = GptHeader::new(8 * 1024 * 1024 / 512);
        header.seal(&entries);

        let raw = header.to_bytes();
        let stored = u32::from_le_bytes(raw[16..20].try_into().unwrap());
        let mut check = raw[..92].to_vec();
        check[16..20].fill(0);
        assert_eq!(crc32(&check), stored);
        assert_eq!(&raw[..8], b"EFI PART");
    }

    #[test]
    fn add_partition_fills_slots_in_order_until_full() {
        let device = scratch_device(8 * 2048);
        let path = device.path().to_str().unwrap().to_string();

        let mut table = PartitionTable::open(&path, TableType::Mbr).expect("open");
        assert_eq!(table.table_type(), TableType::Mbr);
        table.create_mbr().expect("create");
        for i in 0..4u32 {
            let slot = table
                .add_mbr_partition(2048 + i * 1024, 1024, part_type::LINUX, i == 0)
                .expect("add partition");
            assert_eq!(slot, i as usize);
        }
        let err = table
            .add_mbr_partition(9000, 10, part_type::LINUX, false)
            .unwrap_err();
        assert!(matches!(err, BurnError::TableFull));
    }

    #[test]
    fn added_partition_reads_back_exactly() {
        let device = scratch_device(8 * 2048);
        let path = device.path().to_str().unwrap().to_string();

        let mut table = PartitionTable::open(&path, TableType::Mbr).expect("open");
        table.create_mbr().expect("create");
        table
            .add_mbr_partition(2048, 4096, part_type::FAT32_LBA, true)
            .expect("add");

        let mbr = table.read_mbr().expect("read back");
        let entry = mbr.entries[0];
        assert_eq!(entry.first_lba, 2048);
        assert_eq!(entry.sector_count, 4096);
        assert_eq!(entry.type_code, part_type::FAT32_LBA);
        assert!(entry.bootable());
        assert_eq!(entry.first_chs, chs_from_lba(2048));
        assert_eq!(entry.last_chs, chs_from_lba(2048 + 4096 - 1));
    }

    #[test]
    fn gpt_writes_protective_mbr_and_header() {
        let sectors = 16 * 2048u64;
        let device = scratch_device(sectors);
        let path = device.path().to_str().unwrap().to_string();

        let mut table = PartitionTable::open(&path, TableType::Gpt).expect("open");
        table.create_gpt().expect("create gpt");
        table.commit().expect("commit");

        let raw = std::fs::read(&path).expect("read device");
        // Protective entry: type 0xEE from LBA 1.
        assert_eq!(raw[446 + 4], part_type::GPT_PROTECTIVE);
        assert_eq!(raw[510], 0x55);
        assert_eq!(raw[511], 0xAA);
        // Header at LBA 1.
        assert_eq!(&raw[512..520], b"EFI PART");
        let backup = u64::from_le_bytes(raw[512 + 32..512 + 40].try_into().unwrap());
        assert_eq!(backup, sectors - 1);
        let first_usable = u64::from_le_bytes(raw[512 + 40..512 + 48].try_into().unwrap());
        assert_eq!(first_usable, 34);
    }
}
