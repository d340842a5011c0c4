// SPDX-License-Identifier: GPL-3.0-only

//! Resolve kernel names, `major:minor` strings, device nodes and sysfs
//! paths to a [`DeviceIdentity`].

use std::path::{Path, PathBuf};

use blockdev_types::{DevNumber, DeviceIdentity, validate_device_name};
use nix::sys::stat::{SFlag, major, minor, stat};
use tracing::debug;

use crate::error::{Result, SysError};
use crate::sysfs::Sysfs;

#[derive(Debug, Clone)]
pub struct IdentityResolver {
    sysfs: Sysfs,
    dev_root: PathBuf,
}

impl IdentityResolver {
    pub fn new(sysfs: Sysfs, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs,
            dev_root: dev_root.into(),
        }
    }

    pub fn sysfs(&self) -> &Sysfs {
        &self.sysfs
    }

    pub fn dev_root(&self) -> &Path {
        &self.dev_root
    }

    /// Accepts `sda`, `8:0`, `/dev/sda` or `/sys/class/block/sda`.
    pub fn resolve(&self, spec: &str) -> Result<DeviceIdentity> {
        let spec = spec.trim();
        let path = Path::new(spec);

        if path.is_absolute() {
            if path.starts_with(self.sysfs.root()) {
                return self.from_sysfs_path(path);
            }
            return self.from_node(path);
        }
        if let Ok(dev) = spec.parse::<DevNumber>() {
            return self.from_dev(dev);
        }
        self.from_name(spec)
    }

    pub fn from_name(&self, name: &str) -> Result<DeviceIdentity> {
        validate_device_name(name)?;
        let dir = self.sysfs.block_dir(name);
        let dev = self
            .read_dev(&dir)?
            .ok_or_else(|| SysError::DeviceNotFound(name.to_string()))?;
        Ok(DeviceIdentity::new(dev, self.sysfs.resolve(&dir), name))
    }

    pub fn from_dev(&self, dev: DevNumber) -> Result<DeviceIdentity> {
        let dir = self.sysfs.dev_dir(dev);
        if !dir.exists() {
            return Err(SysError::DeviceNotFound(dev.to_string()));
        }

        let name = self
            .sysfs
            .read_attr(&dir.join("uevent"))?
            .and_then(|uevent| {
                uevent
                    .lines()
                    .find_map(|line| line.strip_prefix("DEVNAME=").map(|n| n.replace('/', "!")))
            });
        let resolved = self.sysfs.resolve(&dir);
        let name = match name {
            Some(name) => name,
            None => resolved
                .file_name()
                .and_then(|n| n.to_str())
                .map(ToString::to_string)
                .ok_or_else(|| SysError::DeviceNotFound(dev.to_string()))?,
        };
        Ok(DeviceIdentity::new(dev, resolved, name))
    }

    /// Identity of a device node, via its `st_rdev`.
    pub fn from_node(&self, node: &Path) -> Result<DeviceIdentity> {
        let st = stat(node).map_err(|_| SysError::DeviceNotFound(node.display().to_string()))?;
        let kind = SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT;
        if kind != SFlag::S_IFBLK {
            return Err(SysError::DeviceNotFound(format!(
                "{} is not a block device node",
                node.display()
            )));
        }
        let dev = DevNumber::new(major(st.st_rdev) as u32, minor(st.st_rdev) as u32);
        debug!(node = %node.display(), %dev, "Resolved device node");
        self.from_dev(dev)
    }

    pub fn from_sysfs_path(&self, path: &Path) -> Result<DeviceIdentity> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SysError::DeviceNotFound(path.display().to_string()))?;
        let dev = self
            .read_dev(path)?
            .ok_or_else(|| SysError::DeviceNotFound(path.display().to_string()))?;
        Ok(DeviceIdentity::new(dev, self.sysfs.resolve(path), name))
    }

    fn read_dev(&self, dir: &Path) -> Result<Option<DevNumber>> {
        match self.sysfs.read_attr(&dir.join("dev"))? {
            Some(text) => Ok(Some(text.parse()?)),
            None => Ok(None),
        }
    }
}
