//! Strategy orchestration: the full burn pipeline.
//!
//! One entry point, `run`, drives prepare → wipe → partition → format →
//! populate → bootloader → finalise for whichever strategy the analyser
//! picked. The persistence step is the only place an error is caught: a
//! failed partition-based persistence falls through to the file-based
//! overlay, everything else aborts the run.

use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use crate::analyze::{ImageKind, Strategy};
use crate::bootloader;
use crate::device;
use crate::error::{BurnError, Result};
use crate::fs::FsKind;
use crate::loopback::{copy_tree, LoopDevice, Mount};
use crate::persist;
use crate::progress::Progress;
use crate::stream;
use crate::table::{part_type, PartitionTable, TableType};
use crate::{align_up_sectors, BurnConfig, MIB, SECTOR_SIZE};

/// Extra sectors appended to the image partition for directory growth.
const EXTRACT_SLACK_SECTORS: u64 = 4096;

/// ESP size for multi-partition layouts.
const ESP_MIB: u64 = 512;

/// Attempts when waiting for a child partition node to appear.
const PARTITION_WAIT_ATTEMPTS: u32 = 10;

/// Run a full burn according to `config`.
///
/// Size checks happen before anything touches the device; a failure after
/// that point leaves the device in an undefined state, which is part of
/// the documented contract.
pub fn run(config: &BurnConfig, progress: &mut dyn Progress) -> Result<()> {
    let image_bytes = config.structure.size_bytes;
    let device_bytes = device::size_bytes(&config.device)?;

    if image_bytes > device_bytes {
        return Err(BurnError::DeviceTooSmall {
            image_bytes,
            device_bytes,
        });
    }

    let persistence_mib = match &config.persistence {
        Some(request) => Some(persist::plan(image_bytes, device_bytes, request.size_mib)?),
        None => None,
    };
    let persistence_fs = config.persistence.as_ref().map(|p| p.fs);

    info!(
        "burning {} to {} with {:?} strategy",
        config.image.display(),
        config.device,
        config.strategy
    );

    match config.strategy {
        Strategy::RawCopy => raw_copy(config, progress),
        Strategy::HybridPreserve => {
            hybrid_preserve(config, persistence_mib, persistence_fs, progress)
        }
        Strategy::SmartExtract => {
            smart_extract(config, persistence_mib, persistence_fs, progress)
        }
        Strategy::MultiPart => multipart(config, persistence_mib, persistence_fs, progress),
    }?;

    device::sync_device(&config.device)?;
    info!("burn complete on {}", config.device);
    Ok(())
}

/// PREPARE and WIPE: get every partition unmounted and zero both ends of
/// the device. The mount table is consulted again here even if the CLI
/// already checked, since it can change underneath us.
fn prepare(device: &str) -> Result<()> {
    device::unmount_all(device)?;
    device::wipe(device)
}

fn raw_copy(config: &BurnConfig, progress: &mut dyn Progress) -> Result<()> {
    prepare(&config.device)?;

    stream::write_raw(&config.image, &config.device, config.write_mode(), progress)?;

    match config.structure.kind {
        // A hybrid image lands with its own MBR; overwriting it with our
        // stub would break the image's loader.
        ImageKind::Hybrid => info!("hybrid image carries its own boot record, leaving it"),
        // Nothing bootable was detected, so there is nothing to chain to.
        ImageKind::Unknown => info!("image has no boot structures, skipping bootloader"),
        _ => {
            // A raw-written ISO may expose no mountable first partition at
            // all; the copy itself is already bootable or it never will
            // be, so a failed menu install is not worth aborting over.
            if let Err(err) = bootloader::install(&config.device, &config.image) {
                warn!("bootloader install skipped: {err}");
            }
        }
    }
    Ok(())
}

fn hybrid_preserve(
    config: &BurnConfig,
    persistence_mib: Option<u64>,
    persistence_fs: Option<FsKind>,
    progress: &mut dyn Progress,
) -> Result<()> {
    prepare(&config.device)?;

    stream::write_raw(&config.image, &config.device, config.write_mode(), progress)?;

    if let (Some(size_mib), Some(fs_kind)) = (persistence_mib, persistence_fs) {
        info!("appending persistence partition to hybrid layout");

        let index = config.structure.embedded_partitions.len() as u32 + 1;
        let start_lba = align_up_sectors(config.structure.size_bytes.div_ceil(SECTOR_SIZE));
        let sectors = size_mib * MIB / SECTOR_SIZE;

        let start_lba = u32::try_from(start_lba).map_err(|_| {
            BurnError::Unexpected("image end beyond MBR-addressable range".to_string())
        })?;
        let sectors = u32::try_from(sectors).map_err(|_| {
            BurnError::Unexpected("persistence size beyond MBR-addressable range".to_string())
        })?;

        let result = (|| {
            let mut table = PartitionTable::open(&config.device, TableType::Mbr)?;
            table.add_mbr_partition(start_lba, sectors, fs_kind.partition_type(), false)?;
            table.commit()?;

            let partition = settle_partition(&config.device, index)?;
            persist::format_partition(&partition, fs_kind)
        })();

        recover_persistence(result, &config.device, size_mib)?;
    }
    Ok(())
}

fn smart_extract(
    config: &BurnConfig,
    persistence_mib: Option<u64>,
    persistence_fs: Option<FsKind>,
    _progress: &mut dyn Progress,
) -> Result<()> {
    prepare(&config.device)?;

    let iso_sectors = config.structure.size_bytes.div_ceil(SECTOR_SIZE) + EXTRACT_SLACK_SECTORS;
    let iso_sectors = u32::try_from(iso_sectors).map_err(|_| {
        BurnError::Unexpected("image too large for an MBR partition".to_string())
    })?;
    let start = crate::ALIGNMENT_SECTORS as u32;

    let mut table = open_table(config)?;
    table.add_mbr_partition(start, iso_sectors, part_type::FAT32_LBA, true)?;

    let persist_sectors = persistence_mib.map(|mib| (mib * MIB / SECTOR_SIZE) as u32);
    if let Some(sectors) = persist_sectors {
        let fs_kind = persistence_fs.unwrap_or(FsKind::Ext4);
        table.add_mbr_partition(start + iso_sectors, sectors, fs_kind.partition_type(), false)?;
    }
    table.commit()?;

    let first = settle_partition(&config.device, 1)?;
    crate::fs::create(FsKind::Fat32, &first, &volume_label(&config.image))?;

    populate_from_iso(&config.image, &first)?;

    if let (Some(size_mib), Some(fs_kind)) = (persistence_mib, persistence_fs) {
        let result =
            settle_partition(&config.device, 2).and_then(|p| persist::format_partition(&p, fs_kind));
        recover_persistence(result, &config.device, size_mib)?;
    }

    bootloader::install(&config.device, &config.image)
}

fn multipart(
    config: &BurnConfig,
    persistence_mib: Option<u64>,
    persistence_fs: Option<FsKind>,
    _progress: &mut dyn Progress,
) -> Result<()> {
    prepare(&config.device)?;

    let uefi = config.structure.has_uefi;
    let uefi_only = uefi && !config.structure.has_legacy_boot;

    let mut table = open_table(config)?;
    let mut current = crate::ALIGNMENT_SECTORS as u32;
    let mut index = 0u32;
    let mut esp_index = None;

    if uefi {
        let esp_sectors = (ESP_MIB * MIB / SECTOR_SIZE) as u32;
        table.add_mbr_partition(current, esp_sectors, part_type::EFI_SYSTEM, uefi_only)?;
        current += esp_sectors;
        index += 1;
        esp_index = Some(index);
        info!("created EFI system partition ({ESP_MIB} MiB)");
    }

    let iso_sectors = config.structure.size_bytes.div_ceil(SECTOR_SIZE) + EXTRACT_SLACK_SECTORS;
    let iso_sectors = u32::try_from(iso_sectors).map_err(|_| {
        BurnError::Unexpected("image too large for an MBR partition".to_string())
    })?;
    table.add_mbr_partition(current, iso_sectors, part_type::FAT32_LBA, !uefi_only)?;
    current += iso_sectors;
    index += 1;
    let data_index = index;

    let persist_index = match (persistence_mib, persistence_fs) {
        (Some(mib), Some(fs_kind)) => {
            let sectors = (mib * MIB / SECTOR_SIZE) as u32;
            table.add_mbr_partition(current, sectors, fs_kind.partition_type(), false)?;
            index += 1;
            Some(index)
        }
        _ => None,
    };
    table.commit()?;

    if let Some(esp) = esp_index {
        let partition = settle_partition(&config.device, esp)?;
        crate::fs::create(FsKind::Fat32, &partition, "EFI")?;
    }

    let data = settle_partition(&config.device, data_index)?;
    crate::fs::create(FsKind::Fat32, &data, &volume_label(&config.image))?;

    populate_from_iso(&config.image, &data)?;

    if let (Some(part), Some(size_mib), Some(fs_kind)) =
        (persist_index, persistence_mib, persistence_fs)
    {
        let result = settle_partition(&config.device, part)
            .and_then(|p| persist::format_partition(&p, fs_kind));
        recover_persistence(result, &config.device, size_mib)?;
    }

    bootloader::install(&config.device, &config.image)
}

/// Open the device and lay down an empty table.
///
/// Partition entries are MBR entries in every layout this tool writes (the
/// finished-stick format is MBR-based); a GPT request still gets its
/// protective structures but the entries land in the protective record's
/// legacy slots, so the device stays readable by BIOS firmware.
fn open_table(config: &BurnConfig) -> Result<PartitionTable> {
    let mut table = PartitionTable::open(&config.device, config.table)?;
    match config.table {
        TableType::Mbr => table.create_mbr()?,
        TableType::Gpt => {
            warn!("GPT requested; partition entries are still written to the legacy table");
            table.create_mbr()?;
        }
    }
    Ok(table)
}

/// POPULATE for the extraction strategies: loop-mount the image read-only
/// and copy its tree into the freshly formatted partition.
fn populate_from_iso(image: &Path, partition: &str) -> Result<()> {
    info!("extracting image contents into {partition}");

    let loop_dev = LoopDevice::attach(image)?;
    let iso_mount = Mount::new(loop_dev.path(), "iso", Some("iso9660"), true)?;
    let part_mount = Mount::new(partition, "data", Some("vfat"), false)?;

    copy_tree(iso_mount.path(), part_mount.path())?;
    Ok(())
}

/// The one documented recovery: a persistence step that failed with a
/// write or bootloader error becomes a file-based overlay instead.
fn recover_persistence(result: Result<()>, device: &str, size_mib: u64) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err @ (BurnError::WriteFailed { .. } | BurnError::BootloaderInstallFailed(_))) => {
            warn!("persistence partition failed ({err}), falling back to overlay file");
            persist::fallback_file(device, size_mib)
        }
        Err(other) => Err(other),
    }
}

/// Block until the kernel exposes partition `index` of `device`.
///
/// The table was committed before this is called; here we sleep, re-issue
/// the re-read ioctl, nudge partprobe, and then stat-poll the child node.
/// This is the only place the pipeline waits on external state.
fn settle_partition(device: &str, index: u32) -> Result<String> {
    let partition = device::partition_path(device, index);

    std::thread::sleep(Duration::from_secs(2));
    device::reread_partition_table(device)?;
    let _ = std::process::Command::new("partprobe").arg(device).status();

    for _ in 0..PARTITION_WAIT_ATTEMPTS {
        if Path::new(&partition).exists() {
            return Ok(partition);
        }
        std::thread::sleep(Duration::from_secs(1));
    }
    Err(BurnError::PartitionNotPresent(partition.into()))
}

/// Volume label derived from the image file name: alphanumerics kept,
/// spaces collapsed to underscores, clipped to FAT's 11 characters.
fn volume_label(image: &Path) -> String {
    let base = image
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("BOOTUSB");
    let label: String = base
        .chars()
        .filter_map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                Some(ch.to_ascii_uppercase())
            } else if ch.is_ascii_whitespace() {
                Some('_')
            } else {
                None
            }
        })
        .take(11)
        .collect();
    if label.is_empty() {
        "BOOTUSB".to_string()
    } else {
        label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::{self, Strategy};
    use crate::progress::Recorder;
    use crate::TableType;
    use std::io::Write as _;

    fn iso_image(len: usize) -> tempfile::NamedTempFile {
        let mut bytes = vec![0u8; len];
        bytes[32769..32774].copy_from_slice(b"CD001");
        let mut file = tempfile::NamedTempFile::new().expect("create image");
        file.write_all(&bytes).expect("write image");
        file
    }

    fn config_for(
        image: &tempfile::NamedTempFile,
        device: &tempfile::NamedTempFile,
        persistence: Option<crate::PersistenceRequest>,
    ) -> BurnConfig {
        let structure = analyze::analyse(image.path()).expect("analyse");
        let strategy = analyze::recommend_strategy(&structure, persistence.is_some());
        BurnConfig {
            image: image.path().to_path_buf(),
            device: device.path().to_str().unwrap().to_string(),
            strategy,
            structure,
            fast_mode: false,
            persistence,
            table: TableType::Mbr,
        }
    }

    #[test]
    fn raw_copy_replicates_image_onto_device() {
        let image = iso_image(64 * MIB as usize);
        let device = tempfile::NamedTempFile::new().expect("device");
        device.as_file().set_len(256 * MIB).expect("size device");

        let config = config_for(&image, &device, None);
        assert_eq!(config.strategy, Strategy::RawCopy);

        let mut progress = Recorder::new();
        run(&config, &mut progress).expect("burn");

        let src = std::fs::read(image.path()).expect("read image");
        let dst = std::fs::read(device.path()).expect("read device");
        assert_eq!(&dst[..src.len()], &src[..]);
        assert_eq!(progress.last, src.len() as u64);
    }

    #[test]
    fn oversized_image_fails_before_any_write() {
        let image = iso_image(8 * MIB as usize);
        let device = tempfile::NamedTempFile::new().expect("device");
        device.as_file().set_len(4 * MIB).expect("size device");
        let seed = vec![0x77u8; 4 * MIB as usize];
        std::fs::write(device.path(), &seed).expect("seed device");

        let config = config_for(&image, &device, None);
        let err = run(&config, &mut Recorder::new()).unwrap_err();
        assert!(matches!(err, BurnError::DeviceTooSmall { .. }));

        // Nothing was touched.
        assert_eq!(std::fs::read(device.path()).expect("read"), seed);
    }

    #[test]
    fn persistence_that_cannot_fit_fails_before_any_write() {
        let image = iso_image(64 * MIB as usize);
        let device = tempfile::NamedTempFile::new().expect("device");
        device.as_file().set_len(256 * MIB).expect("size device");
        let seed = vec![0x33u8; 256 * MIB as usize];
        std::fs::write(device.path(), &seed).expect("seed device");

        let config = config_for(
            &image,
            &device,
            Some(crate::PersistenceRequest {
                size_mib: 2048,
                fs: crate::FsKind::Ext4,
            }),
        );
        let err = run(&config, &mut Recorder::new()).unwrap_err();
        assert!(matches!(err, BurnError::InsufficientSpace(_)));
        assert_eq!(std::fs::read(device.path()).expect("read"), seed);
    }

    #[test]
    fn rerunning_a_raw_burn_reproduces_the_same_bytes() {
        // No CD001 marker: the image classifies as Unknown, raw-copies,
        // and skips the bootloader, so the result is fully deterministic.
        let mut image = tempfile::NamedTempFile::new().expect("create image");
        image
            .write_all(&vec![0x42u8; 4 * MIB as usize])
            .expect("fill image");
        let device = tempfile::NamedTempFile::new().expect("device");
        device.as_file().set_len(32 * MIB).expect("size device");

        let config = config_for(&image, &device, None);
        assert_eq!(config.strategy, Strategy::RawCopy);
        assert_eq!(config.structure.kind, crate::ImageKind::Unknown);

        run(&config, &mut Recorder::new()).expect("first burn");
        let first = std::fs::read(device.path()).expect("read");
        run(&config, &mut Recorder::new()).expect("second burn");
        let second = std::fs::read(device.path()).expect("read");
        assert_eq!(first, second);
    }

    #[test]
    fn volume_labels_are_fat_safe() {
        assert_eq!(volume_label(Path::new("/x/ubuntu-24.04.iso")), "UBUNTU-2404");
        assert_eq!(volume_label(Path::new("/x/My Linux!.iso")), "MY_LINUX");
        assert_eq!(volume_label(Path::new("/x/....iso")), "BOOTUSB");
    }

    #[test]
    fn persistence_recovery_only_catches_the_documented_kinds() {
        // TableFull must abort, not fall back.
        let err = recover_persistence(Err(BurnError::TableFull), "/dev/null", 512).unwrap_err();
        assert!(matches!(err, BurnError::TableFull));
    }
}
