// SPDX-License-Identifier: GPL-3.0-only

//! Read-only access to the kernel's sysfs tree.
//!
//! A missing attribute is not an error here: it is how the kernel tells us
//! a device is not of a given kind. Readers therefore return `Option` and
//! only surface I/O failures other than "not found".

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use blockdev_types::DevNumber;

use crate::error::{Result, SysError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sysfs {
    root: PathBuf,
}

impl Default for Sysfs {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl Sysfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `/sys/class/block/<name>`
    pub fn block_dir(&self, name: &str) -> PathBuf {
        self.root.join("class/block").join(name)
    }

    /// `/sys/dev/block/<major>:<minor>`
    pub fn dev_dir(&self, dev: DevNumber) -> PathBuf {
        self.root.join("dev/block").join(dev.to_string())
    }

    /// `/sys/bus/scsi/devices`
    pub fn scsi_devices_dir(&self) -> PathBuf {
        self.root.join("bus/scsi/devices")
    }

    /// `/sys/class/scsi_host`
    pub fn scsi_host_dir(&self) -> PathBuf {
        self.root.join("class/scsi_host")
    }

    /// Read an attribute, trimmed. `Ok(None)` if it does not exist.
    pub fn read_attr(&self, path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path) {
            Ok(value) => Ok(Some(value.trim().to_string())),
            Err(e) if is_absent(&e) => Ok(None),
            Err(e) => Err(SysError::io_at(path, e)),
        }
    }

    pub fn read_u64(&self, path: &Path) -> Result<Option<u64>> {
        let Some(value) = self.read_attr(path)? else {
            return Ok(None);
        };
        value
            .parse()
            .map(Some)
            .map_err(|_| SysError::UnexpectedOutput {
                tool: "sysfs".to_string(),
                detail: format!("{} holds {value:?}, expected an integer", path.display()),
            })
    }

    /// `1`/`0` flags such as `removable` and `ro`.
    pub fn read_flag(&self, path: &Path) -> Result<Option<bool>> {
        Ok(self.read_u64(path)?.map(|value| value != 0))
    }

    /// Sorted entry names of a directory; empty if it does not exist.
    pub fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(e) if is_absent(&e) => return Ok(Vec::new()),
            Err(e) => return Err(SysError::io_at(path, e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if is_absent(&e) => continue,
                Err(e) => return Err(SysError::io_at(path, e)),
            };
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Resolve symlinks, falling back to the path itself when it cannot be
    /// canonicalized (fixture trees often use plain directories).
    pub fn resolve(&self, path: &Path) -> PathBuf {
        fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Devices can disappear between listing and reading; ENODEV and ENXIO
/// from sysfs mean the same as a missing file.
fn is_absent(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::NotFound
        || matches!(e.raw_os_error(), Some(code) if code == nix::libc::ENODEV || code == nix::libc::ENXIO)
}
