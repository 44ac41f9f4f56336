//! External host capabilities: loop devices, mounts, tree copies.
//!
//! Each capability is a thin wrapper over one host utility with a scoped
//! guard, so an ISO loop attachment or a temporary mount can never outlive
//! the burn run: drop detaches and unmounts on every exit path, panics
//! included.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, warn};

use crate::error::{BurnError, Result};

/// A loop device attached to an image file; detached on drop.
pub struct LoopDevice {
    path: String,
}

impl LoopDevice {
    /// Attach `image` to the first free loop device.
    pub fn attach(image: &Path) -> Result<Self> {
        let output = Command::new("losetup")
            .args(["--find", "--show"])
            .arg(image)
            .output()
            .map_err(|e| BurnError::Unexpected(format!("run losetup: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(BurnError::Unexpected(format!(
                "losetup failed for {}: {stderr}",
                image.display()
            )));
        }

        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if path.is_empty() {
            return Err(BurnError::Unexpected("losetup returned no device".to_string()));
        }
        debug!("attached {} to {path}", image.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for LoopDevice {
    fn drop(&mut self) {
        let status = Command::new("losetup").arg("-d").arg(&self.path).status();
        if !matches!(status, Ok(s) if s.success()) {
            warn!("failed to detach loop device {}", self.path);
        }
    }
}

/// A mounted filesystem; unmounted and its mount point removed on drop.
pub struct Mount {
    mount_point: PathBuf,
}

impl Mount {
    /// Mount `source` at a fresh directory under the system temp dir.
    ///
    /// `fstype` pins the filesystem (`iso9660`, `vfat`); `read_only` adds
    /// `-o ro`.
    pub fn new(source: &str, tag: &str, fstype: Option<&str>, read_only: bool) -> Result<Self> {
        let mount_point =
            std::env::temp_dir().join(format!("isoforge-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&mount_point)
            .map_err(|e| BurnError::write(mount_point.display().to_string(), e))?;

        let mut cmd = Command::new("mount");
        if let Some(fstype) = fstype {
            cmd.args(["-t", fstype]);
        }
        if read_only {
            cmd.args(["-o", "ro"]);
        }
        let status = cmd
            .arg(source)
            .arg(&mount_point)
            .status()
            .map_err(|e| BurnError::Unexpected(format!("run mount: {e}")))?;

        if !status.success() {
            let _ = std::fs::remove_dir(&mount_point);
            return Err(BurnError::Unexpected(format!(
                "mount of {source} at {} failed",
                mount_point.display()
            )));
        }

        debug!("mounted {source} at {}", mount_point.display());
        Ok(Self { mount_point })
    }

    pub fn path(&self) -> &Path {
        &self.mount_point
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        let status = Command::new("umount").arg(&self.mount_point).status();
        if !matches!(status, Ok(s) if s.success()) {
            warn!("failed to unmount {}", self.mount_point.display());
            let _ = Command::new("umount")
                .arg("-l")
                .arg(&self.mount_point)
                .status();
        }
        let _ = std::fs::remove_dir(&self.mount_point);
    }
}

/// Copy the full contents of `src` into `dst`, preserving attributes.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    // `src/.` copies the directory contents without relying on the shell
    // to expand a glob.
    let mut from = src.to_path_buf();
    from.push(".");

    let status = Command::new("cp")
        .arg("-a")
        .arg(&from)
        .arg(dst)
        .status()
        .map_err(|e| BurnError::Unexpected(format!("run cp: {e}")))?;

    if !status.success() {
        return Err(BurnError::write(
            dst.display().to_string(),
            std::io::Error::other("cp -a reported failure"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_tree_copies_nested_files() {
        let src = tempfile::tempdir().expect("src dir");
        let dst = tempfile::tempdir().expect("dst dir");

        std::fs::create_dir(src.path().join("casper")).expect("mkdir");
        std::fs::write(src.path().join("casper/vmlinuz"), b"kernel").expect("write");
        std::fs::write(src.path().join("top.txt"), b"top").expect("write");

        copy_tree(src.path(), dst.path()).expect("copy");

        assert_eq!(
            std::fs::read(dst.path().join("casper/vmlinuz")).expect("read"),
            b"kernel"
        );
        assert_eq!(std::fs::read(dst.path().join("top.txt")).expect("read"), b"top");
    }
}
