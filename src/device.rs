//! Block-device access: validation, sizing, unmounting, wiping, syncing.
//!
//! Device discovery goes through `lsblk --json`; everything destructive goes
//! through the device node directly. All sizing falls back to plain file
//! length when the target is a regular file, so the formatters and streamer
//! can be exercised against loop-style scratch files.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::process::Command;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{BurnError, Result};
use crate::{MIB, SECTOR_SIZE};

// Linux block-device ioctls; libc does not export these request numbers.
const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;
const BLKRRPART: libc::c_ulong = 0x125f;

/// How many MiB to zero at each end of the device during a wipe.
const WIPE_WINDOW_MIB: u64 = 10;

/// Outcome of validating a target path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    /// A whole-disk block device, safe to repartition.
    WholeDisk,
    /// A partition node; carries the whole-disk path to suggest.
    IsPartition(String),
    /// Not a block device at all.
    NotBlock,
}

/// Classify a device path by name alone, without touching the filesystem.
///
/// A trailing decimal digit normally marks a partition (`/dev/sdb1`), except
/// for nvme (`/dev/nvme0n1`) and mmc (`/dev/mmcblk0`) whole-disk names,
/// whose partitions carry a `p` before the trailing number instead.
pub fn classify_path(device: &str) -> DeviceKind {
    let Some(last) = device.chars().last() else {
        return DeviceKind::NotBlock;
    };
    if !last.is_ascii_digit() {
        return DeviceKind::WholeDisk;
    }

    if device.contains("nvme") || device.contains("mmcblk") {
        // Whole-disk forms end in a digit too; only `...pN` is a partition.
        match split_p_suffix(device) {
            Some(base) => DeviceKind::IsPartition(base),
            None => DeviceKind::WholeDisk,
        }
    } else {
        let base = device.trim_end_matches(|c: char| c.is_ascii_digit());
        DeviceKind::IsPartition(base.to_string())
    }
}

/// Split `<base>pN` into `<base>`, or `None` if the path has no `pN` tail.
fn split_p_suffix(device: &str) -> Option<String> {
    let trimmed = device.trim_end_matches(|c: char| c.is_ascii_digit());
    if trimmed.len() < device.len() && trimmed.ends_with('p') {
        Some(trimmed[..trimmed.len() - 1].to_string())
    } else {
        None
    }
}

/// Validate that `device` names a whole-disk block device.
///
/// # Errors
///
/// `IsPartition` with the suggested whole-disk path, `InvalidDevice` if the
/// node exists but is not a block device, `Permission`/`ReadFailed` when
/// the node cannot be stat'ed.
pub fn validate(device: &str) -> Result<()> {
    if let DeviceKind::IsPartition(base) = classify_path(device) {
        return Err(BurnError::IsPartition(base));
    }

    let meta = std::fs::metadata(device).map_err(|e| BurnError::open(device, e))?;
    if !meta.file_type().is_block_device() {
        return Err(BurnError::InvalidDevice(device.to_string()));
    }
    Ok(())
}

/// Size of a device (or regular file) in bytes.
///
/// Block devices are sized with the `BLKGETSIZE64` ioctl; regular files
/// fall back to their stat length.
pub fn size_bytes(device: &str) -> Result<u64> {
    let file = File::open(device).map_err(|e| BurnError::open(device, e))?;
    size_of_open(&file, device)
}

fn size_of_open(file: &File, device: &str) -> Result<u64> {
    let meta = file.metadata().map_err(|e| BurnError::read(device, e))?;
    if !meta.file_type().is_block_device() {
        return Ok(meta.len());
    }

    let mut size: u64 = 0;
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
    if rc < 0 {
        return Err(BurnError::read(device, std::io::Error::last_os_error()));
    }
    Ok(size)
}

/// Number of 512-byte sectors on the device.
pub fn size_sectors(device: &str) -> Result<u64> {
    Ok(size_bytes(device)? / SECTOR_SIZE)
}

/// Build the path of partition `index` on `base`.
///
/// nvme and mmc devices separate the partition number with a `p`.
pub fn partition_path(base: &str, index: u32) -> String {
    if base.contains("nvme") || base.contains("mmcblk") {
        format!("{base}p{index}")
    } else {
        format!("{base}{index}")
    }
}

/// Mounted entries from `/proc/mounts` whose source starts with `base`.
fn mounted_under(base: &str) -> Vec<(String, String)> {
    let Ok(table) = std::fs::read_to_string("/proc/mounts") else {
        return Vec::new();
    };
    parse_mounts(&table, base)
}

fn parse_mounts(table: &str, base: &str) -> Vec<(String, String)> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            if source.starts_with(base) {
                Some((source.to_string(), target.to_string()))
            } else {
                None
            }
        })
        .collect()
}

/// Whether any partition of `base` (or the device itself) is mounted.
pub fn is_any_partition_mounted(base: &str) -> bool {
    !mounted_under(base).is_empty()
}

/// Unmount everything under `base`, lazily if necessary.
///
/// Runs a normal `umount` on each mounted entry, then a lazy unmount for
/// anything that survived, then settles for one second. Succeeds only when
/// the mount table no longer references the device.
pub fn unmount_all(base: &str) -> Result<()> {
    let mounted = mounted_under(base);
    if mounted.is_empty() {
        return Ok(());
    }

    info!("unmounting {} entries under {base}", mounted.len());
    for (source, _) in &mounted {
        let _ = Command::new("umount").arg(source).status();
    }

    std::thread::sleep(Duration::from_secs(1));

    for (source, _) in mounted_under(base) {
        warn!("{source} still mounted, trying lazy unmount");
        let _ = Command::new("umount").arg("-l").arg(source).status();
    }

    std::thread::sleep(Duration::from_secs(1));

    if is_any_partition_mounted(base) {
        return Err(BurnError::Unexpected(format!(
            "could not unmount all partitions of {base}"
        )));
    }
    Ok(())
}

/// Zero the first and last 10 MiB of the device in 1 MiB chunks, then ask
/// the kernel to re-read the partition table.
///
/// A failure in the tail window is logged but not fatal; some devices
/// reject seeks near their end.
pub fn wipe(device: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(device)
        .map_err(|e| BurnError::open(device, e))?;
    let size = size_of_open(&file, device)?;

    let zeros = vec![0u8; MIB as usize];
    let head = WIPE_WINDOW_MIB.min(size / MIB);

    info!("wiping first {head} MiB of {device}");
    file.seek(SeekFrom::Start(0))
        .map_err(|e| BurnError::write(device, e))?;
    for _ in 0..head {
        file.write_all(&zeros)
            .map_err(|e| BurnError::write(device, e))?;
    }

    if size > 2 * WIPE_WINDOW_MIB * MIB {
        let tail_start = size - WIPE_WINDOW_MIB * MIB;
        match file.seek(SeekFrom::Start(tail_start)) {
            Ok(_) => {
                for _ in 0..WIPE_WINDOW_MIB {
                    if let Err(e) = file.write_all(&zeros) {
                        warn!("tail wipe of {device} failed: {e}");
                        break;
                    }
                }
            }
            Err(e) => warn!("cannot seek to tail of {device}: {e}"),
        }
    }

    file.sync_all().map_err(|e| BurnError::write(device, e))?;
    reread_partition_table(device)?;
    Ok(())
}

/// Flush device buffers: fsync the node, then a global sync.
pub fn sync_device(device: &str) -> Result<()> {
    debug!("syncing {device}");
    let file = OpenOptions::new()
        .write(true)
        .open(device)
        .map_err(|e| BurnError::open(device, e))?;
    file.sync_all().map_err(|e| BurnError::write(device, e))?;
    unsafe { libc::sync() };
    Ok(())
}

/// Ask the kernel to re-read the partition table of `device`.
///
/// Skipped for regular files, which have no table to re-read; this keeps
/// loop-file tests on the same code path as real devices.
pub fn reread_partition_table(device: &str) -> Result<()> {
    let file = File::open(device).map_err(|e| BurnError::open(device, e))?;
    let meta = file.metadata().map_err(|e| BurnError::read(device, e))?;
    if !meta.file_type().is_block_device() {
        debug!("{device} is not a block device, skipping partition re-read");
        return Ok(());
    }

    let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKRRPART) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        // EBUSY just means a partition is still held open somewhere; the
        // partprobe pass in the orchestrator gets another chance.
        warn!("BLKRRPART on {device} failed: {err}");
    }
    Ok(())
}

/// A disk reported by `lsblk`.
#[derive(Debug, Clone)]
pub struct Disk {
    pub name: String,
    pub model: String,
    pub size: String,
    pub removable: bool,
}

impl Disk {
    pub fn device_path(&self) -> String {
        format!("/dev/{}", self.name)
    }
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    rm: Option<bool>,
    #[serde(default)]
    r#type: String,
}

/// List disks on the system via `lsblk --json`.
///
/// With `show_all` false, only removable disks are returned, the set a
/// user would plausibly want to flash.
pub fn list(show_all: bool) -> Result<Vec<Disk>> {
    let output = Command::new("lsblk")
        .args(["--json", "-o", "NAME,MODEL,SIZE,RM,TYPE"])
        .output()
        .map_err(|e| BurnError::Unexpected(format!("run lsblk: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(BurnError::Unexpected(format!("lsblk failed: {stderr}")));
    }

    let parsed: LsblkOutput = serde_json::from_slice(&output.stdout)
        .map_err(|e| BurnError::Unexpected(format!("parse lsblk output: {e}")))?;

    Ok(parsed
        .blockdevices
        .into_iter()
        .filter(|dev| dev.r#type == "disk")
        .filter(|dev| show_all || dev.rm.unwrap_or(false))
        .map(|dev| Disk {
            name: dev.name,
            model: dev.model.unwrap_or_default(),
            size: dev.size.unwrap_or_default(),
            removable: dev.rm.unwrap_or(false),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn classify_plain_disk_paths() {
        assert_eq!(classify_path("/dev/sdb"), DeviceKind::WholeDisk);
        assert_eq!(classify_path("/dev/vdz"), DeviceKind::WholeDisk);
    }

    #[test]
    fn classify_partition_suggests_base() {
        assert_eq!(
            classify_path("/dev/sdb3"),
            DeviceKind::IsPartition("/dev/sdb".to_string())
        );
        assert_eq!(
            classify_path("/dev/sdb12"),
            DeviceKind::IsPartition("/dev/sdb".to_string())
        );
    }

    #[test]
    fn classify_nvme_and_mmc_whole_disks() {
        assert_eq!(classify_path("/dev/nvme0n1"), DeviceKind::WholeDisk);
        assert_eq!(classify_path("/dev/mmcblk0"), DeviceKind::WholeDisk);
    }

    #[test]
    fn classify_nvme_and_mmc_partitions() {
        assert_eq!(
            classify_path("/dev/nvme0n1p2"),
            DeviceKind::IsPartition("/dev/nvme0n1".to_string())
        );
        assert_eq!(
            classify_path("/dev/mmcblk0p1"),
            DeviceKind::IsPartition("/dev/mmcblk0".to_string())
        );
    }

    #[test]
    fn partition_paths_follow_device_naming() {
        assert_eq!(partition_path("/dev/sdb", 1), "/dev/sdb1");
        assert_eq!(partition_path("/dev/nvme0n1", 2), "/dev/nvme0n1p2");
        assert_eq!(partition_path("/dev/mmcblk0", 3), "/dev/mmcblk0p3");
    }

    #[test]
    fn size_bytes_falls_back_to_file_length() {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        file.write_all(&[0u8; 4096]).expect("write temp file");
        let size = size_bytes(file.path().to_str().unwrap()).expect("size");
        assert_eq!(size, 4096);
    }

    #[test]
    fn parse_mounts_matches_device_prefix() {
        let table = "\
/dev/sdb1 /mnt/usb vfat rw 0 0
/dev/sda2 / ext4 rw 0 0
/dev/sdb2 /mnt/data ext4 rw 0 0
tmpfs /tmp tmpfs rw 0 0
";
        let hits = parse_mounts(table, "/dev/sdb");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].1, "/mnt/usb");
    }

    #[test]
    fn wipe_zeroes_head_and_tail_of_file() {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        let payload = vec![0xAAu8; 32 * MIB as usize];
        file.write_all(&payload).expect("fill temp file");
        let path = file.path().to_str().unwrap().to_string();

        wipe(&path).expect("wipe");

        let data = std::fs::read(&path).expect("read back");
        assert!(data[..(10 * MIB) as usize].iter().all(|&b| b == 0));
        assert!(data[data.len() - (10 * MIB) as usize..]
            .iter()
            .all(|&b| b == 0));
        // The middle is untouched.
        assert_eq!(data[(15 * MIB) as usize], 0xAA);
    }
}
