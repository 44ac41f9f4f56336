//! ISO image analysis.
//!
//! Classifies an image as hybrid, El Torito, pure ISO 9660 or unknown, pulls
//! any embedded MBR partition entries out of it, and scans the head of the
//! file for UEFI markers and well-known boot files. Detection reads a few
//! fixed offsets plus at most 2 MiB of scan data; it never maps or mutates
//! the image, and only needs read access, no privileges required.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use tracing::info;

use crate::error::{BurnError, Result};
use crate::table::MbrEntry;

/// ISO 9660 primary volume descriptor lives at sector 16 of 2048 bytes.
const ISO9660_PVD_OFFSET: u64 = 32768;

/// El Torito boot record validation entry, sector 17.
const EL_TORITO_OFFSET: u64 = 34816;

/// How far into the image to look for UEFI path strings.
const UEFI_SCAN_LEN: usize = 1024 * 1024;

/// How far into the image to look for boot-file names.
const BOOT_FILE_SCAN_LEN: usize = 2 * 1024 * 1024;

/// Boot files worth reporting, searched case-insensitively.
const BOOT_FILE_PATTERNS: &[&str] = &[
    "ISOLINUX.BIN",
    "SYSLINUX.BIN",
    "BOOTX64.EFI",
    "BOOTIA32.EFI",
    "GRUBX64.EFI",
    "GRUB.CFG",
    "VMLINUZ",
    "INITRD",
];

/// Broad classification of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// Valid as both ISO 9660 and a partitioned disk; carries its own MBR.
    Hybrid,
    /// ISO 9660 with an El Torito boot record.
    ElTorito,
    /// Plain ISO 9660, no boot structures.
    Pure,
    /// None of the signatures matched.
    Unknown,
}

/// Strategy the orchestrator will use to lay the image onto the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Byte-for-byte copy; the image supplies its own boot structures.
    RawCopy,
    /// Byte-for-byte copy keeping the image's partition table, with room
    /// for an appended persistence partition.
    HybridPreserve,
    /// New partition table, image contents extracted into a fresh FAT32
    /// filesystem, bootloader constructed from scratch.
    SmartExtract,
    /// Separate ESP / data / persistence partitions.
    MultiPart,
}

/// Everything the analyser learned about an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageStructure {
    pub kind: ImageKind,
    pub has_iso9660: bool,
    pub has_el_torito: bool,
    pub has_mbr: bool,
    pub has_uefi: bool,
    pub has_legacy_boot: bool,
    pub is_multi_boot: bool,
    pub embedded_partitions: Vec<MbrEntry>,
    pub boot_files: Vec<String>,
    pub size_bytes: u64,
}

impl ImageStructure {
    /// Human-readable boot-type line for logs and the dry-run report.
    pub fn boot_type_description(&self) -> &'static str {
        if self.is_multi_boot {
            "Multi-Boot (UEFI + Legacy)"
        } else if self.has_uefi {
            "UEFI Only"
        } else if self.has_el_torito {
            "Legacy BIOS (El Torito)"
        } else if self.kind == ImageKind::Hybrid {
            "Hybrid ISO"
        } else {
            "Data Only"
        }
    }
}

/// Analyse an image file. Pure in the image bytes: two calls on the same
/// file return equal structures.
///
/// # Errors
///
/// `InvalidImage` for files under 1024 bytes; `ReadFailed`/`Permission`
/// when the file cannot be opened or read.
pub fn analyse(image: &Path) -> Result<ImageStructure> {
    let mut file = File::open(image).map_err(|e| BurnError::open(image.display().to_string(), e))?;
    let size_bytes = file
        .metadata()
        .map_err(|e| BurnError::read(image.display().to_string(), e))?
        .len();

    if size_bytes < 1024 {
        return Err(BurnError::InvalidImage(format!(
            "{} is too small to be a disc image ({size_bytes} bytes)",
            image.display()
        )));
    }

    let mbr = read_at(&mut file, 0, 512)?;
    let pvd = read_at(&mut file, ISO9660_PVD_OFFSET, 2048)?;
    let boot_record = read_at(&mut file, EL_TORITO_OFFSET, 2048)?;
    let scan = read_at(&mut file, 0, BOOT_FILE_SCAN_LEN)?;

    let structure = analyse_buffers(&mbr, &pvd, &boot_record, &scan, size_bytes);

    info!("image analysis of {}:", image.display());
    info!("  type: {}", structure.boot_type_description());
    info!("  hybrid: {}", structure.kind == ImageKind::Hybrid);
    info!("  uefi: {}", structure.has_uefi);
    info!("  legacy boot: {}", structure.has_legacy_boot);
    info!(
        "  embedded partitions: {}",
        structure.embedded_partitions.len()
    );
    if !structure.boot_files.is_empty() {
        info!("  boot files: {}", structure.boot_files.join(", "));
    }

    Ok(structure)
}

/// Classification core, separated from I/O so tests can feed raw buffers.
fn analyse_buffers(
    mbr: &[u8],
    pvd: &[u8],
    boot_record: &[u8],
    scan: &[u8],
    size_bytes: u64,
) -> ImageStructure {
    let has_mbr = mbr.len() >= 512 && mbr[510] == 0x55 && mbr[511] == 0xAA;
    let embedded_partitions = if has_mbr {
        parse_embedded_partitions(mbr)
    } else {
        Vec::new()
    };

    let has_iso9660 = pvd.len() >= 6 && &pvd[1..6] == b"CD001";
    let has_el_torito = has_iso9660
        && (find_ascii(boot_record, b"EL TORITO") || find_ascii(boot_record, b"BOOT CATALOG"));

    let uefi_window = &scan[..scan.len().min(UEFI_SCAN_LEN)];
    let has_uefi = find_ascii_ci(uefi_window, b"EFI/BOOT")
        || find_ascii_ci(uefi_window, b"BOOTX64.EFI")
        || find_ascii_ci(uefi_window, b"BOOTIA32.EFI");

    let kind = if has_mbr && !embedded_partitions.is_empty() && has_iso9660 {
        ImageKind::Hybrid
    } else if has_el_torito {
        ImageKind::ElTorito
    } else if has_iso9660 {
        ImageKind::Pure
    } else {
        ImageKind::Unknown
    };

    let has_legacy_boot = has_el_torito || kind == ImageKind::Hybrid;
    let is_multi_boot = has_uefi && has_legacy_boot;

    let boot_files = BOOT_FILE_PATTERNS
        .iter()
        .filter(|pattern| find_ascii_ci(scan, pattern.as_bytes()))
        .map(|pattern| pattern.to_string())
        .collect();

    ImageStructure {
        kind,
        has_iso9660,
        has_el_torito,
        has_mbr,
        has_uefi,
        has_legacy_boot,
        is_multi_boot,
        embedded_partitions,
        boot_files,
        size_bytes,
    }
}

/// Pick the burn strategy for an analysed image. First matching row wins.
///
/// A persistence request rules out a raw whole-device copy, since the
/// persistence partition needs a partitioned layout to live in; hybrid
/// images host it by appending to their own table instead.
pub fn recommend_strategy(structure: &ImageStructure, with_persistence: bool) -> Strategy {
    if structure.kind == ImageKind::Hybrid && !structure.embedded_partitions.is_empty() {
        Strategy::HybridPreserve
    } else if structure.is_multi_boot || structure.embedded_partitions.len() > 1 {
        Strategy::MultiPart
    } else if structure.has_uefi || structure.has_el_torito || with_persistence {
        Strategy::SmartExtract
    } else {
        Strategy::RawCopy
    }
}

/// How many partitions the final layout needs.
pub fn required_partitions(structure: &ImageStructure, with_persistence: bool) -> u8 {
    let mut partitions: u8 = 1;

    if structure.kind == ImageKind::Hybrid && !structure.embedded_partitions.is_empty() {
        partitions = structure.embedded_partitions.len().min(4) as u8;
    }

    if structure.is_multi_boot {
        partitions = partitions.max(2);
    }

    // A UEFI image built onto a fresh layout needs an ESP next to the data
    // partition; a hybrid image already carries whatever it needs.
    if structure.has_uefi && structure.kind != ImageKind::Hybrid {
        partitions = partitions.max(2);
    }

    if with_persistence {
        partitions += 1;
    }
    partitions
}

/// Non-empty partition entries out of a 512-byte MBR.
fn parse_embedded_partitions(mbr: &[u8]) -> Vec<MbrEntry> {
    (0..4)
        .filter_map(|i| {
            let offset = 446 + i * 16;
            let raw: [u8; 16] = mbr[offset..offset + 16].try_into().ok()?;
            let entry = MbrEntry::from_bytes(&raw);
            (entry.type_code != 0).then_some(entry)
        })
        .collect()
}

fn read_at(file: &mut File, offset: u64, len: usize) -> Result<Vec<u8>> {
    let size = file
        .metadata()
        .map_err(|e| BurnError::read("image", e))?
        .len();
    if offset >= size {
        return Ok(Vec::new());
    }

    let len = len.min((size - offset) as usize);
    let mut buf = vec![0u8; len];
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| BurnError::read("image", e))?;
    file.read_exact(&mut buf)
        .map_err(|e| BurnError::read("image", e))?;
    Ok(buf)
}

fn find_ascii(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn find_ascii_ci(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Minimal image builder: a zeroed buffer plus the markers asked for.
    struct Builder {
        bytes: Vec<u8>,
    }

    impl Builder {
        fn new(len: usize) -> Self {
            Self {
                bytes: vec![0u8; len],
            }
        }

        fn iso9660(mut self) -> Self {
            self.bytes[32768] = 1;
            self.bytes[32769..32774].copy_from_slice(b"CD001");
            self
        }

        fn el_torito(mut self) -> Self {
            self.bytes[34820..34829].copy_from_slice(b"EL TORITO");
            self
        }

        fn mbr_with_partition(mut self) -> Self {
            self.bytes[510] = 0x55;
            self.bytes[511] = 0xAA;
            // One FAT32 entry at LBA 0, spanning the image.
            self.bytes[446] = 0x80;
            self.bytes[446 + 4] = 0x0C;
            self.bytes[446 + 12] = 0x10;
            self
        }

        fn uefi_marker(mut self) -> Self {
            self.bytes[4096..4104].copy_from_slice(b"EFI/BOOT");
            self
        }

        fn boot_file(mut self, name: &[u8], at: usize) -> Self {
            self.bytes[at..at + name.len()].copy_from_slice(name);
            self
        }

        fn write(self) -> tempfile::NamedTempFile {
            let mut file = tempfile::NamedTempFile::new().expect("create temp image");
            file.write_all(&self.bytes).expect("write temp image");
            file
        }
    }

    #[test]
    fn rejects_undersized_files() {
        let mut file = tempfile::NamedTempFile::new().expect("create temp image");
        file.write_all(&[0u8; 512]).expect("write");
        let err = analyse(file.path()).unwrap_err();
        assert!(matches!(err, BurnError::InvalidImage(_)));
    }

    #[test]
    fn classifies_pure_iso() {
        let file = Builder::new(65536).iso9660().write();
        let s = analyse(file.path()).expect("analyse");
        assert_eq!(s.kind, ImageKind::Pure);
        assert!(s.has_iso9660);
        assert!(!s.has_el_torito);
        assert_eq!(recommend_strategy(&s, false), Strategy::RawCopy);
    }

    #[test]
    fn classifies_el_torito() {
        let file = Builder::new(65536).iso9660().el_torito().write();
        let s = analyse(file.path()).expect("analyse");
        assert_eq!(s.kind, ImageKind::ElTorito);
        assert!(s.has_legacy_boot);
        assert_eq!(recommend_strategy(&s, false), Strategy::SmartExtract);
    }

    #[test]
    fn classifies_hybrid_and_preserves_it() {
        let file = Builder::new(65536).iso9660().mbr_with_partition().write();
        let s = analyse(file.path()).expect("analyse");
        assert_eq!(s.kind, ImageKind::Hybrid);
        assert_eq!(s.embedded_partitions.len(), 1);
        assert_eq!(s.embedded_partitions[0].type_code, 0x0C);
        assert_eq!(recommend_strategy(&s, false), Strategy::HybridPreserve);
    }

    #[test]
    fn multi_boot_image_goes_multipart() {
        let file = Builder::new(65536)
            .iso9660()
            .el_torito()
            .uefi_marker()
            .write();
        let s = analyse(file.path()).expect("analyse");
        assert!(s.is_multi_boot);
        assert_eq!(recommend_strategy(&s, false), Strategy::MultiPart);
    }

    #[test]
    fn blank_image_is_unknown_raw_copy() {
        let file = Builder::new(65536).write();
        let s = analyse(file.path()).expect("analyse");
        assert_eq!(s.kind, ImageKind::Unknown);
        assert!(s.boot_files.is_empty());
        assert_eq!(recommend_strategy(&s, false), Strategy::RawCopy);
    }

    #[test]
    fn boot_files_are_found_case_insensitively() {
        let file = Builder::new(65536)
            .iso9660()
            .boot_file(b"isolinux.bin", 40000)
            .boot_file(b"VMLINUZ", 50000)
            .write();
        let s = analyse(file.path()).expect("analyse");
        assert!(s.boot_files.contains(&"ISOLINUX.BIN".to_string()));
        assert!(s.boot_files.contains(&"VMLINUZ".to_string()));
    }

    #[test]
    fn analysis_is_pure_in_the_image_bytes() {
        let file = Builder::new(65536).iso9660().el_torito().write();
        let a = analyse(file.path()).expect("first pass");
        let b = analyse(file.path()).expect("second pass");
        assert_eq!(a, b);
    }

    #[test]
    fn required_partitions_is_monotonic_in_persistence() {
        let file = Builder::new(65536).iso9660().uefi_marker().write();
        let s = analyse(file.path()).expect("analyse");
        let without = required_partitions(&s, false);
        let with = required_partitions(&s, true);
        assert!(with >= without);
        assert_eq!(without, 2); // ESP + data
        assert_eq!(with, 3);
    }
}
