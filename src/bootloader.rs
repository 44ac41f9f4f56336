//! Bootloader installation: boot menu plus the 440-byte MBR stub.
//!
//! The loader family is picked by scanning the head of the image. The boot
//! menu lands on the first partition as `/syslinux/syslinux.cfg` or
//! `/boot/grub/grub.cfg` with a normal and a persistent entry; the stub is
//! written over the first 440 bytes of the device, after the last format.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use tracing::info;

use crate::device;
use crate::error::{BurnError, Result};
use crate::loopback::Mount;

/// How much of the image head to scan for loader signatures.
const DETECT_SCAN_LEN: usize = 32 * 1024;

/// Loader families the installer can lay down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootType {
    Syslinux,
    Grub,
}

/// Pick the loader family from the image head: ISOLINUX/SYSLINUX first,
/// then GRUB, defaulting to SYSLINUX.
pub fn detect(image: &Path) -> Result<BootType> {
    let mut file = File::open(image).map_err(|e| BurnError::open(image.display().to_string(), e))?;
    let mut buf = vec![0u8; DETECT_SCAN_LEN];
    let read = file
        .read(&mut buf)
        .map_err(|e| BurnError::read(image.display().to_string(), e))?;
    buf.truncate(read);

    Ok(detect_in(&buf))
}

fn detect_in(head: &[u8]) -> BootType {
    let contains = |needle: &[u8]| head.windows(needle.len()).any(|w| w == needle);
    if contains(b"ISOLINUX") || contains(b"SYSLINUX") {
        BootType::Syslinux
    } else if contains(b"GRUB") {
        BootType::Grub
    } else {
        BootType::Syslinux
    }
}

/// The syslinux boot menu: a normal entry and a persistent entry pointing
/// at the casper kernel and initrd. LF line endings throughout.
pub fn syslinux_config() -> String {
    let lines = [
        "DEFAULT menu.c32",
        "PROMPT 0",
        "TIMEOUT 300",
        "",
        "MENU TITLE Boot Menu",
        "",
        "LABEL linux",
        "  MENU LABEL Boot Linux",
        "  KERNEL /casper/vmlinuz",
        "  APPEND initrd=/casper/initrd boot=casper quiet splash ---",
        "",
        "LABEL persistent",
        "  MENU LABEL Boot with Persistence",
        "  KERNEL /casper/vmlinuz",
        "  APPEND initrd=/casper/initrd boot=casper persistent quiet splash ---",
    ];
    lines.join("\n") + "\n"
}

/// The grub boot menu with the same two entries.
pub fn grub_config() -> String {
    let lines = [
        "set timeout=10",
        "set default=0",
        "",
        "menuentry \"Boot Linux\" {",
        "  linux /casper/vmlinuz boot=casper quiet splash ---",
        "  initrd /casper/initrd",
        "}",
        "",
        "menuentry \"Boot with Persistence\" {",
        "  linux /casper/vmlinuz boot=casper persistent quiet splash ---",
        "  initrd /casper/initrd",
        "}",
    ];
    lines.join("\n") + "\n"
}

/// Write the loader's configuration tree under `root` (a mounted first
/// partition, or any directory in tests).
pub fn write_config(root: &Path, boot_type: BootType) -> Result<()> {
    let (dir, file_name, contents) = match boot_type {
        BootType::Syslinux => (root.join("syslinux"), "syslinux.cfg", syslinux_config()),
        BootType::Grub => (root.join("boot/grub"), "grub.cfg", grub_config()),
    };

    std::fs::create_dir_all(&dir)
        .map_err(|e| BurnError::BootloaderInstallFailed(format!("create {}: {e}", dir.display())))?;
    std::fs::write(dir.join(file_name), contents).map_err(|e| {
        BurnError::BootloaderInstallFailed(format!("write {file_name}: {e}"))
    })?;
    Ok(())
}

/// First 440 bytes of the device: the loader stub, zero-padded.
///
/// TODO: this is a truncated copy of the SYSLINUX MBR prologue, enough for
/// partition scanners but not a complete loader; bundle the full mbr.bin
/// from the syslinux package before shipping.
pub fn stub_bytes() -> [u8; 440] {
    const HEAD: [u8; 57] = [
        0xFA, 0x31, 0xC0, 0x8E, 0xD8, 0x8E, 0xC0, 0x8E, 0xD0, 0xBC, 0x00, 0x7C, 0xFB, 0xFC, 0xBF,
        0x00, 0x06, 0xB9, 0x00, 0x01, 0xF3, 0xA5, 0xEA, 0x1F, 0x06, 0x00, 0x00, 0xB4, 0x41, 0xBB,
        0xAA, 0x55, 0xCD, 0x13, 0x72, 0x3E, 0x81, 0xFB, 0x55, 0xAA, 0x75, 0x38, 0x83, 0xE1, 0x01,
        0x74, 0x33, 0x66, 0xA1, 0x10, 0x7C, 0x66, 0x3B, 0x46, 0xF8, 0x0F, 0x82,
    ];
    let mut stub = [0u8; 440];
    stub[..HEAD.len()].copy_from_slice(&HEAD);
    stub
}

/// Overwrite bytes 0..440 of the device with the loader stub, leaving the
/// disk signature and partition entries behind it untouched.
pub fn write_stub(device: &str) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .open(device)
        .map_err(|e| BurnError::BootloaderInstallFailed(format!("open {device}: {e}")))?;
    file.write_all(&stub_bytes())
        .map_err(|e| BurnError::BootloaderInstallFailed(format!("write stub to {device}: {e}")))?;
    file.sync_all()
        .map_err(|e| BurnError::BootloaderInstallFailed(format!("sync {device}: {e}")))?;
    Ok(())
}

/// Install the boot menu and stub onto a freshly burned device.
///
/// Mounts the first partition, writes the configuration tree, unmounts,
/// then lays the stub over the device head.
pub fn install(device: &str, image: &Path) -> Result<()> {
    let boot_type = detect(image)?;
    info!("installing {boot_type:?} bootloader on {device}");

    let first = device::partition_path(device, 1);
    {
        let mount = Mount::new(&first, "boot", Some("vfat"), false)
            .map_err(|e| BurnError::BootloaderInstallFailed(e.to_string()))?;
        write_config(mount.path(), boot_type)?;
    }

    write_stub(device)?;
    info!("bootloader installed");
    Ok(())
}
