//! Native filesystem construction.
//!
//! Each formatter writes its on-disk structures directly: boot sector,
//! FSInfo and FATs for FAT32; the superblock for ext4; the boot sector for
//! NTFS. No external mkfs tools are involved. The target may be a whole
//! device, a partition node, or a regular file (used by the file-based
//! persistence fallback and the tests).

pub mod ext4;
pub mod fat32;
pub mod ntfs;

use std::fmt;

use tracing::info;

use crate::error::{BurnError, Result};

/// Filesystems the CLI accepts for the persistence partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Ext4,
    Ntfs,
    ExFat,
    Fat32,
    Fat64,
}

impl FsKind {
    /// Parse a user-supplied filesystem name, case-insensitively.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "ext4" => Ok(FsKind::Ext4),
            "ntfs" => Ok(FsKind::Ntfs),
            "exfat" => Ok(FsKind::ExFat),
            "fat32" => Ok(FsKind::Fat32),
            "fat64" => Ok(FsKind::Fat64),
            other => Err(BurnError::UnsupportedFilesystem(other.to_string())),
        }
    }

    pub const SUPPORTED: &'static [&'static str] = &["ext4", "ntfs", "exfat", "fat32", "fat64"];

    /// MBR partition type code for a partition holding this filesystem.
    pub fn partition_type(self) -> u8 {
        match self {
            FsKind::Ext4 => crate::table::part_type::LINUX,
            FsKind::Fat32 | FsKind::Fat64 => crate::table::part_type::FAT32_LBA,
            FsKind::Ntfs | FsKind::ExFat => crate::table::part_type::NTFS,
        }
    }

    /// Label convention for a persistence partition of this kind: the
    /// casper overlay looks for `casper-rw` on ext4 and `PERSISTENCE`
    /// elsewhere.
    pub fn persistence_label(self) -> &'static str {
        match self {
            FsKind::Ext4 => "casper-rw",
            _ => "PERSISTENCE",
        }
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FsKind::Ext4 => "ext4",
            FsKind::Ntfs => "ntfs",
            FsKind::ExFat => "exfat",
            FsKind::Fat32 => "fat32",
            FsKind::Fat64 => "fat64",
        };
        write!(f, "{name}")
    }
}

/// Create a filesystem of the given kind on `target`.
///
/// FAT64 is laid out as FAT32; the distinction only affects the CLI
/// spelling. exFAT has no native formatter here and is refused.
///
/// # Errors
///
/// `UnsupportedFilesystem` for exFAT, `DeviceTooSmall` when the target
/// cannot hold the minimal layout, `WriteFailed`/`VerifyFailed` from the
/// individual formatters.
pub fn create(kind: FsKind, target: &str, label: &str) -> Result<()> {
    info!("creating {kind} filesystem on {target}");
    match kind {
        FsKind::Fat32 | FsKind::Fat64 => fat32::create(target, label),
        FsKind::Ext4 => ext4::create(target, label),
        FsKind::Ntfs => ntfs::create(target, label),
        FsKind::ExFat => Err(BurnError::UnsupportedFilesystem(
            "exfat (no native formatter)".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_all_supported_names() {
        assert_eq!(FsKind::parse("EXT4").unwrap(), FsKind::Ext4);
        assert_eq!(FsKind::parse("fat32").unwrap(), FsKind::Fat32);
        assert_eq!(FsKind::parse("NtFs").unwrap(), FsKind::Ntfs);
        assert!(matches!(
            FsKind::parse("btrfs"),
            Err(BurnError::UnsupportedFilesystem(_))
        ));
    }

    #[test]
    fn partition_types_match_filesystems() {
        assert_eq!(FsKind::Ext4.partition_type(), 0x83);
        assert_eq!(FsKind::Fat32.partition_type(), 0x0C);
        assert_eq!(FsKind::Ntfs.partition_type(), 0x07);
    }

    #[test]
    fn persistence_labels_follow_casper_convention() {
        assert_eq!(FsKind::Ext4.persistence_label(), "casper-rw");
        assert_eq!(FsKind::Fat32.persistence_label(), "PERSISTENCE");
    }
}
