//! Error types for the burn pipeline.
//!
//! Every component returns `BurnError` upward to the orchestrator. The only
//! recovery anywhere in the crate is the file-based persistence fallback,
//! which matches on `WriteFailed` / `BootloaderInstallFailed` in
//! `burn::run`; nothing else is caught on the way up.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Structured report attached to an `InsufficientSpace` error.
///
/// Carries everything the user needs to pick a persistence size that fits,
/// so the CLI can print a complete breakdown instead of a bare message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceReport {
    /// Total device capacity in MiB.
    pub device_mib: u64,
    /// Image size in MiB, rounded up.
    pub iso_mib: u64,
    /// Persistence size the caller asked for, in MiB.
    pub requested_mib: u64,
    /// Total MiB the request would need (image + persistence + overhead).
    pub required_mib: u64,
    /// How many MiB short the device is.
    pub shortage_mib: u64,
    /// Largest persistence size that would fit, in MiB. Zero or negative
    /// headroom is clamped to zero.
    pub max_persistence_mib: u64,
}

impl std::fmt::Display for SpaceReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Insufficient storage for requested persistence")?;
        writeln!(f, "  Device: {} MiB", self.device_mib)?;
        writeln!(f, "  ISO: {} MiB", self.iso_mib)?;
        writeln!(f, "  Requested persistence: {} MiB", self.requested_mib)?;
        writeln!(f, "  Required: {} MiB", self.required_mib)?;
        writeln!(f, "  Shortage: {} MiB", self.shortage_mib)?;
        if self.max_persistence_mib >= 512 {
            write!(
                f,
                "  Maximum persistence available: {} MiB",
                self.max_persistence_mib
            )?;
        } else {
            write!(
                f,
                "  Device too small for persistence (minimum 512 MiB required)"
            )?;
        }
        Ok(())
    }
}

/// Every failure the pipeline can surface.
#[derive(Debug, Error)]
pub enum BurnError {
    #[error("root privileges required")]
    Permission,

    #[error("{0} is not a block device")]
    InvalidDevice(String),

    /// The caller named a partition instead of a whole disk. Carries the
    /// whole-disk path to suggest instead.
    #[error("target names a partition; use the whole disk {0}")]
    IsPartition(String),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("device too small: image is {image_bytes} bytes, device is {device_bytes} bytes")]
    DeviceTooSmall { image_bytes: u64, device_bytes: u64 },

    #[error("{0}")]
    InsufficientSpace(SpaceReport),

    #[error("no free partition slots in the MBR")]
    TableFull,

    #[error("write failed at {location}: {source}")]
    WriteFailed {
        location: String,
        #[source]
        source: io::Error,
    },

    #[error("read failed at {location}: {source}")]
    ReadFailed {
        location: String,
        #[source]
        source: io::Error,
    },

    #[error("verification failed: {0}")]
    VerifyFailed(String),

    #[error("partition {} did not appear after partition table re-read", .0.display())]
    PartitionNotPresent(PathBuf),

    #[error("unsupported filesystem: {0}")]
    UnsupportedFilesystem(String),

    #[error("bootloader installation failed: {0}")]
    BootloaderInstallFailed(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl BurnError {
    /// Wrap an I/O error as a write failure at a named location.
    pub fn write(location: impl Into<String>, source: io::Error) -> Self {
        BurnError::WriteFailed {
            location: location.into(),
            source,
        }
    }

    /// Wrap an I/O error as a read failure at a named location.
    pub fn read(location: impl Into<String>, source: io::Error) -> Self {
        BurnError::ReadFailed {
            location: location.into(),
            source,
        }
    }

    /// Classify an open/stat error: EACCES and EPERM become `Permission`,
    /// everything else is a read failure at the given location.
    pub fn open(location: impl Into<String>, source: io::Error) -> Self {
        match source.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EPERM) => BurnError::Permission,
            _ => BurnError::ReadFailed {
                location: location.into(),
                source,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, BurnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn space_report_mentions_minimum_when_too_small() {
        let report = SpaceReport {
            device_mib: 1000,
            iso_mib: 800,
            requested_mib: 512,
            required_mib: 1612,
            shortage_mib: 612,
            max_persistence_mib: 0,
        };
        let text = report.to_string();
        assert!(text.contains("minimum 512 MiB required"));
        assert!(text.contains("Shortage: 612 MiB"));
    }

    #[test]
    fn space_report_suggests_maximum_when_possible() {
        let report = SpaceReport {
            device_mib: 4096,
            iso_mib: 3072,
            requested_mib: 2048,
            required_mib: 5420,
            shortage_mib: 1324,
            max_persistence_mib: 724,
        };
        let text = report.to_string();
        assert!(text.contains("Maximum persistence available: 724 MiB"));
    }

    #[test]
    fn open_maps_permission_errnos() {
        let err = BurnError::open("/dev/sdz", io::Error::from_raw_os_error(libc::EACCES));
        assert!(matches!(err, BurnError::Permission));

        let err = BurnError::open("/dev/sdz", io::Error::from_raw_os_error(libc::ENOENT));
        assert!(matches!(err, BurnError::ReadFailed { .. }));
    }
}
