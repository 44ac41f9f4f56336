//! isoforge: build bootable USB drives from ISO images.
//!
//! The crate is a linear pipeline: analyse the image, prepare the device,
//! lay out a partition table, construct filesystems, stream the image
//! bytes, install a bootloader. `burn::run` drives the whole thing from a
//! single immutable [`BurnConfig`]; the binary in `main.rs` only parses
//! arguments, prints reports and maps errors to exit codes.

pub mod analyze;
pub mod bootloader;
pub mod burn;
pub mod device;
pub mod error;
pub mod fs;
pub mod loopback;
pub mod persist;
pub mod progress;
pub mod stream;
pub mod table;

use std::path::PathBuf;

pub use analyze::{ImageKind, ImageStructure, Strategy};
pub use error::{BurnError, Result};
pub use fs::FsKind;
pub use stream::WriteMode;
pub use table::TableType;

/// Bytes per logical sector. Every LBA in the crate is in these units.
pub const SECTOR_SIZE: u64 = 512;

pub const MIB: u64 = 1024 * 1024;

/// Partition starts are rounded up to this many sectors (1 MiB).
pub const ALIGNMENT_SECTORS: u64 = 2048;

/// FAT32 cluster size in sectors (4 KiB clusters).
pub const FAT32_SECTORS_PER_CLUSTER: u8 = 8;

pub const EXT4_BLOCK_SIZE: u32 = 4096;
pub const EXT4_BLOCKS_PER_GROUP: u32 = 32768;
pub const EXT4_INODES_PER_GROUP: u32 = 8192;
pub const EXT4_INODE_SIZE: u16 = 256;

/// Smallest persistence partition a casper overlay will accept.
pub const PERSISTENCE_MIN_MIB: u64 = 512;

/// Reserve for partition tables and alignment gaps.
pub const OVERHEAD_RESERVE_MIB: u64 = 100;

/// Round a sector count up to the next alignment boundary.
pub fn align_up_sectors(sectors: u64) -> u64 {
    sectors.div_ceil(ALIGNMENT_SECTORS) * ALIGNMENT_SECTORS
}

/// A persistence request attached to a burn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistenceRequest {
    pub size_mib: u64,
    pub fs: FsKind,
}

/// Everything one burn run needs, assembled once by the CLI and treated
/// as immutable from then on.
#[derive(Debug, Clone)]
pub struct BurnConfig {
    pub image: PathBuf,
    pub device: String,
    pub strategy: Strategy,
    pub structure: ImageStructure,
    pub fast_mode: bool,
    pub persistence: Option<PersistenceRequest>,
    pub table: TableType,
}

impl BurnConfig {
    /// The streaming mode implied by the fast flag.
    pub fn write_mode(&self) -> WriteMode {
        if self.fast_mode {
            WriteMode::Fast
        } else {
            WriteMode::Raw
        }
    }
}
