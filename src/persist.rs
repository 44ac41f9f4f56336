//! Persistence sizing and the file-based fallback.
//!
//! The planner owns the space arithmetic for a persistence request; the
//! fallback builds a `casper-rw` loop file inside the freshly written ISO
//! partition when a dedicated persistence partition cannot be created.

use tracing::{info, warn};

use crate::device;
use crate::error::{BurnError, Result, SpaceReport};
use crate::fs::{self, FsKind};
use crate::loopback::Mount;
use crate::{MIB, OVERHEAD_RESERVE_MIB, PERSISTENCE_MIN_MIB};

/// Working headroom kept free next to the image partition, in MiB.
const IMAGE_MARGIN_MIB: u64 = 200;

/// Validate a persistence request against the device and return the size
/// to actually use.
///
/// Sizes under the 512 MiB floor are raised to it with a warning. When the
/// request cannot fit, the error carries the full space breakdown,
/// including the largest persistence size that would.
pub fn plan(image_bytes: u64, device_bytes: u64, requested_mib: u64) -> Result<u64> {
    let size_mib = if requested_mib < PERSISTENCE_MIN_MIB {
        warn!(
            "persistence size {requested_mib} MiB is below the {PERSISTENCE_MIN_MIB} MiB minimum, raising it"
        );
        PERSISTENCE_MIN_MIB
    } else {
        requested_mib
    };

    let device_mib = device_bytes / MIB;
    let iso_mib = image_bytes.div_ceil(MIB);
    let required_mib = iso_mib + IMAGE_MARGIN_MIB + size_mib + OVERHEAD_RESERVE_MIB;

    if required_mib > device_mib {
        let reserve = iso_mib + IMAGE_MARGIN_MIB + OVERHEAD_RESERVE_MIB;
        return Err(BurnError::InsufficientSpace(SpaceReport {
            device_mib,
            iso_mib,
            requested_mib: size_mib,
            required_mib,
            shortage_mib: required_mib - device_mib,
            max_persistence_mib: device_mib.saturating_sub(reserve),
        }));
    }

    info!(
        "persistence plan: {size_mib} MiB of {device_mib} MiB device ({} MiB image)",
        iso_mib
    );
    Ok(size_mib)
}

/// Format a freshly created persistence partition with its conventional
/// label.
pub fn format_partition(partition: &str, fs_kind: FsKind) -> Result<()> {
    fs::create(fs_kind, partition, fs_kind.persistence_label())
}

/// File-based fallback: mount the first partition of `device` and build a
/// `casper-rw` file of `size_mib`, formatted as ext4.
///
/// Used when the partition-based path failed after the image was already
/// on the device; the overlay file gives the booted system the same
/// persistence surface without touching the partition table again.
pub fn fallback_file(device: &str, size_mib: u64) -> Result<()> {
    info!("creating file-based persistence ({size_mib} MiB) on {device}");

    let first = device::partition_path(device, 1);
    let mount = Mount::new(&first, "persist", None, false)
        .map_err(|e| BurnError::Unexpected(format!("mount for fallback persistence: {e}")))?;

    let target = mount.path().join("casper-rw");
    create_overlay_file(target.to_str().ok_or_else(|| {
        BurnError::Unexpected("persistence path is not valid UTF-8".to_string())
    })?, size_mib)?;

    device::sync_device(device)?;
    info!("file-based persistence ready at {}", target.display());
    Ok(())
}

/// Allocate and format a persistence overlay file.
pub fn create_overlay_file(path: &str, size_mib: u64) -> Result<()> {
    let file = std::fs::File::create(path).map_err(|e| BurnError::write(path, e))?;
    file.set_len(size_mib * MIB)
        .map_err(|e| BurnError::write(path, e))?;
    file.sync_all().map_err(|e| BurnError::write(path, e))?;
    drop(file);

    fs::create(FsKind::Ext4, path, "casper-rw")
}
