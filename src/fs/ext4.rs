//! ext4 superblock construction.
//!
//! Only the superblock is written: block-group descriptors, bitmaps and
//! inode tables are left for the first mount to initialise. That is enough
//! for a casper persistence overlay, which formats lazily on first write;
//! offline ext4 tooling (fsck, resize2fs) will want a full mkfs layout.
//! The magic is verified by reading it back before reporting success.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::device;
use crate::error::{BurnError, Result};
use crate::table::random_guid;
use crate::{EXT4_BLOCKS_PER_GROUP, EXT4_BLOCK_SIZE, EXT4_INODES_PER_GROUP, EXT4_INODE_SIZE};

/// Superblock byte offset from the start of the volume.
pub const SUPERBLOCK_OFFSET: u64 = 1024;

/// Serialised superblock length.
pub const SUPERBLOCK_SIZE: usize = 1024;

pub const MAGIC: u16 = 0xEF53;

// Feature sets: dir_index + resize_inode + ext_attr; filetype + extents +
// 64bit + flex_bg; sparse_super + large_file + huge_file + gdt_csum +
// dir_nlink.
const FEATURE_COMPAT: u32 = 0x38;
const FEATURE_INCOMPAT: u32 = 0x2C2;
const FEATURE_RO_COMPAT: u32 = 0x7B;

/// The subset of superblock fields this formatter fills in.
#[derive(Debug, Clone)]
pub struct Superblock {
    pub blocks_count: u32,
    pub inodes_count: u32,
    pub uuid: [u8; 16],
    pub label: [u8; 16],
    pub now: u32,
}

impl Superblock {
    pub fn new(blocks_count: u32, label: &str) -> Self {
        let block_groups = blocks_count.div_ceil(EXT4_BLOCKS_PER_GROUP);
        let mut padded = [0u8; 16];
        for (slot, byte) in padded.iter_mut().zip(label.bytes()) {
            *slot = byte;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        Self {
            blocks_count,
            inodes_count: EXT4_INODES_PER_GROUP * block_groups,
            uuid: random_guid(),
            label: padded,
            now,
        }
    }

    pub fn to_bytes(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut raw = [0u8; SUPERBLOCK_SIZE];
        let put16 = |raw: &mut [u8; SUPERBLOCK_SIZE], at: usize, v: u16| {
            raw[at..at + 2].copy_from_slice(&v.to_le_bytes())
        };
        let put32 = |raw: &mut [u8; SUPERBLOCK_SIZE], at: usize, v: u32| {
            raw[at..at + 4].copy_from_slice(&v.to_le_bytes())
        };

        put32(&mut raw, 0x00, self.inodes_count);
        put32(&mut raw, 0x04, self.blocks_count);
        put32(&mut raw, 0x08, self.blocks_count / 20); // reserved for root
        put32(&mut raw, 0x0C, self.blocks_count.saturating_sub(1000)); // free blocks
        put32(&mut raw, 0x10, self.inodes_count - 11); // free inodes
        put32(&mut raw, 0x14, 0); // first data block (4 KiB blocks)
        put32(&mut raw, 0x18, 2); // log block size: 4096 = 1024 << 2
        put32(&mut raw, 0x1C, 2); // log cluster size
        put32(&mut raw, 0x20, EXT4_BLOCKS_PER_GROUP);
        put32(&mut raw, 0x24, EXT4_BLOCKS_PER_GROUP); // clusters per group
        put32(&mut raw, 0x28, EXT4_INODES_PER_GROUP);
        put32(&mut raw, 0x2C, self.now); // mtime
        put32(&mut raw, 0x30, self.now); // wtime
        put16(&mut raw, 0x34, 0); // mount count
        put16(&mut raw, 0x36, 0xFFFF); // max mount count: unlimited
        put16(&mut raw, 0x38, MAGIC);
        put16(&mut raw, 0x3A, 1); // state: clean
        put16(&mut raw, 0x3C, 1); // errors: continue
        put16(&mut raw, 0x3E, 0); // minor revision
        put32(&mut raw, 0x40, self.now); // last check
        put32(&mut raw, 0x44, 0); // check interval
        put32(&mut raw, 0x48, 0); // creator OS: Linux
        put32(&mut raw, 0x4C, 1); // revision: dynamic
        put16(&mut raw, 0x50, 0); // default reserved uid
        put16(&mut raw, 0x52, 0); // default reserved gid
        put32(&mut raw, 0x54, 11); // first non-reserved inode
        put16(&mut raw, 0x58, EXT4_INODE_SIZE);
        put16(&mut raw, 0x5A, 0); // this block group
        put32(&mut raw, 0x5C, FEATURE_COMPAT);
        put32(&mut raw, 0x60, FEATURE_INCOMPAT);
        put32(&mut raw, 0x64, FEATURE_RO_COMPAT);
        raw[0x68..0x78].copy_from_slice(&self.uuid);
        raw[0x78..0x88].copy_from_slice(&self.label);
        raw
    }
}

/// Create an ext4 filesystem on `target` and verify the magic.
pub fn create(target: &str, label: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(target)
        .map_err(|e| BurnError::open(target, e))?;

    let size = device::size_bytes(target)?;
    let blocks_count = size / EXT4_BLOCK_SIZE as u64;
    if blocks_count < 64 {
        return Err(BurnError::DeviceTooSmall {
            image_bytes: 64 * EXT4_BLOCK_SIZE as u64,
            device_bytes: size,
        });
    }
    let blocks_count = u32::try_from(blocks_count).unwrap_or(u32::MAX);

    let superblock = Superblock::new(blocks_count, label);
    file.seek(SeekFrom::Start(SUPERBLOCK_OFFSET))
        .map_err(|e| BurnError::write(target, e))?;
    file.write_all(&superblock.to_bytes())
        .map_err(|e| BurnError::write(target, e))?;
    file.sync_all().map_err(|e| BurnError::write(target, e))?;

    // Read the magic back; a failed or misdirected write must not be
    // reported as a formatted filesystem.
    let mut check = [0u8; 2];
    file.seek(SeekFrom::Start(SUPERBLOCK_OFFSET + 0x38))
        .map_err(|e| BurnError::read(target, e))?;
    file.read_exact(&mut check)
        .map_err(|e| BurnError::read(target, e))?;
    if u16::from_le_bytes(check) != MAGIC {
        return Err(BurnError::VerifyFailed(format!(
            "ext4 magic not found on {target} after write"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(bytes: u64) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().expect("create scratch file");
        file.as_file().set_len(bytes).expect("size scratch file");
        file
    }

    #[test]
    fn superblock_magic_lands_at_absolute_1080() {
        let scratch = scratch(64 * 1024 * 1024);
        create(scratch.path().to_str().unwrap(), "casper-rw").expect("format");

        let data = std::fs::read(scratch.path()).expect("read back");
        assert_eq!(u16::from_le_bytes([data[1080], data[1081]]), 0xEF53);
    }

    #[test]
    fn superblock_geometry_and_features() {
        let raw = Superblock::new(65536, "casper-rw").to_bytes();
        assert_eq!(u32::from_le_bytes(raw[0x18..0x1C].try_into().unwrap()), 2);
        assert_eq!(
            u32::from_le_bytes(raw[0x20..0x24].try_into().unwrap()),
            32768
        );
        assert_eq!(
            u32::from_le_bytes(raw[0x28..0x2C].try_into().unwrap()),
            8192
        );
        assert_eq!(u16::from_le_bytes([raw[0x58], raw[0x59]]), 256);
        assert_eq!(u32::from_le_bytes(raw[0x54..0x58].try_into().unwrap()), 11);
        assert_eq!(u32::from_le_bytes(raw[0x5C..0x60].try_into().unwrap()), 0x38);
        assert_eq!(
            u32::from_le_bytes(raw[0x60..0x64].try_into().unwrap()),
            0x2C2
        );
        assert_eq!(u32::from_le_bytes(raw[0x64..0x68].try_into().unwrap()), 0x7B);
        assert_eq!(&raw[0x78..0x81], b"casper-rw");
    }

    #[test]
    fn inode_count_scales_with_block_groups() {
        // 65536 blocks is two groups of 32768.
        let sb = Superblock::new(65536, "");
        assert_eq!(sb.inodes_count, 2 * 8192);
        // One extra block adds a third group.
        let sb = Superblock::new(65537, "");
        assert_eq!(sb.inodes_count, 3 * 8192);
    }

    #[test]
    fn create_rejects_tiny_targets() {
        let scratch = scratch(4096);
        let err = create(scratch.path().to_str().unwrap(), "x").unwrap_err();
        assert!(matches!(err, BurnError::DeviceTooSmall { .. }));
    }
}
