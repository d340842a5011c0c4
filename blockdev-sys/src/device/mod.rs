// SPDX-License-Identifier: GPL-3.0-only

//! Block devices and their classification.
//!
//! Every device kind is a variant of [`BlockDevice`]; the operations common
//! to all of them (size, holders, flush, ...) live on [`DeviceBase`] and are
//! reachable through the [`BlockDeviceOps`] trait.

mod classifier;
mod identity;

pub use classifier::{ClassificationRule, DeviceClassifier, RULES, subsumes};
pub use identity::IdentityResolver;

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use blockdev_types::{BlockDeviceInfo, BlockStats, DeviceIdentity, DeviceKind, Hbtl, SizeValue};
use tracing::debug;

use crate::error::{Result, SysError};
use crate::scsi::ScsiDeviceInfo;
use crate::sysfs::Sysfs;

mod ioctl {
    // BLKFLSBUF, _IO(0x12, 97)
    nix::ioctl_none!(blkflsbuf, 0x12, 97);
}

/// State shared by every device kind: who it is and where to look.
#[derive(Debug, Clone)]
pub struct DeviceBase {
    identity: DeviceIdentity,
    sysfs: Sysfs,
    dev_root: PathBuf,
}

impl DeviceBase {
    pub fn new(identity: DeviceIdentity, sysfs: Sysfs, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            identity,
            sysfs,
            dev_root: dev_root.into(),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn sysfs(&self) -> &Sysfs {
        &self.sysfs
    }

    /// The device's sysfs directory.
    pub fn dir(&self) -> &Path {
        &self.identity.sysfs_path
    }

    pub fn node_path(&self) -> PathBuf {
        self.identity.node_path(&self.dev_root)
    }

    pub fn exists(&self) -> bool {
        self.dir().join("dev").exists()
    }

    fn attr(&self, name: &str) -> Result<Option<String>> {
        self.sysfs.read_attr(&self.dir().join(name))
    }

    pub fn sectors(&self) -> Result<u64> {
        self.sysfs
            .read_u64(&self.dir().join("size"))?
            .ok_or_else(|| SysError::DeviceNotFound(self.name().to_string()))
    }

    pub fn size(&self) -> Result<SizeValue> {
        Ok(SizeValue::from_sectors(self.sectors()?))
    }

    pub fn removable(&self) -> Result<bool> {
        Ok(self
            .sysfs
            .read_flag(&self.dir().join("removable"))?
            .unwrap_or(false))
    }

    pub fn read_only(&self) -> Result<bool> {
        Ok(self.sysfs.read_flag(&self.dir().join("ro"))?.unwrap_or(false))
    }

    /// Devices built on top of this one. Re-read on every call.
    pub fn holders(&self) -> Result<Vec<String>> {
        self.sysfs.list_dir(&self.dir().join("holders"))
    }

    /// Devices this one is built from. Re-read on every call.
    pub fn slaves(&self) -> Result<Vec<String>> {
        self.sysfs.list_dir(&self.dir().join("slaves"))
    }

    pub fn partitions(&self) -> Result<Vec<String>> {
        let mut partitions = Vec::new();
        for entry in self.sysfs.list_dir(self.dir())? {
            if self.dir().join(&entry).join("partition").exists() {
                partitions.push(entry);
            }
        }
        Ok(partitions)
    }

    pub fn statistics(&self) -> Result<BlockStats> {
        let path = self.dir().join("stat");
        let text = self
            .sysfs
            .read_attr(&path)?
            .ok_or_else(|| SysError::DeviceNotFound(self.name().to_string()))?;
        BlockStats::parse(&text).ok_or_else(|| SysError::UnexpectedOutput {
            tool: "sysfs".to_string(),
            detail: format!("cannot parse {}: {text:?}", path.display()),
        })
    }

    pub fn open(&self, read_only: bool) -> Result<DeviceHandle> {
        let path = self.node_path();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .map_err(|e| SysError::io_at(&path, e))?;
        debug!(device = self.name(), read_only, "Opened device");
        Ok(DeviceHandle {
            file,
            path,
            read_only,
        })
    }

    /// Flush dirty data and the kernel's buffer cache for this device.
    pub fn flush(&self) -> Result<()> {
        self.open(true)?.flush()
    }
}

/// An open device node. Dropping it closes the descriptor.
#[derive(Debug)]
pub struct DeviceHandle {
    file: File,
    path: PathBuf,
    read_only: bool,
}

impl DeviceHandle {
    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// `fsync` followed by `BLKFLSBUF` when the node is a block device.
    pub fn flush(&self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| SysError::io_at(&self.path, e))?;

        let is_block = self
            .file
            .metadata()
            .map_err(|e| SysError::io_at(&self.path, e))?
            .file_type()
            .is_block_device();
        if is_block {
            // SAFETY: the descriptor is owned by `self.file` and stays open
            // for the duration of the call; BLKFLSBUF takes no argument.
            unsafe { ioctl::blkflsbuf(self.file.as_raw_fd()) }
                .map_err(|errno| SysError::io_at(&self.path, errno.into()))?;
        }
        debug!(path = %self.path.display(), "Flushed device buffers");
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        if !self.read_only {
            self.file
                .sync_all()
                .map_err(|e| SysError::io_at(&self.path, e))?;
        }
        Ok(())
    }
}

/// Capabilities shared by all device kinds.
pub trait BlockDeviceOps {
    fn base(&self) -> &DeviceBase;

    fn kind(&self) -> DeviceKind;

    fn identity(&self) -> &DeviceIdentity {
        self.base().identity()
    }

    fn name(&self) -> &str {
        self.base().name()
    }

    fn exists(&self) -> bool {
        self.base().exists()
    }

    fn size(&self) -> Result<SizeValue> {
        self.base().size()
    }

    fn sectors(&self) -> Result<u64> {
        self.base().sectors()
    }

    fn holders(&self) -> Result<Vec<String>> {
        self.base().holders()
    }

    fn slaves(&self) -> Result<Vec<String>> {
        self.base().slaves()
    }

    fn flush(&self) -> Result<()> {
        self.base().flush()
    }
}

/// Device-mapper map managed by multipathd.
#[derive(Debug, Clone)]
pub struct MultipathMap {
    pub base: DeviceBase,
    pub dm_name: String,
    pub dm_uuid: String,
    /// WWID of the LUN behind the map.
    pub wwid: String,
    /// Set for `kpartx` partition maps on top of a multipath map.
    pub partition: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct DmDevice {
    pub base: DeviceBase,
    pub dm_name: Option<String>,
    pub dm_uuid: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoopDevice {
    pub base: DeviceBase,
    /// `None` while the loop device is not attached.
    pub backing_file: Option<PathBuf>,
    pub offset: Option<u64>,
    pub autoclear: bool,
}

#[derive(Debug, Clone)]
pub struct MdDevice {
    pub base: DeviceBase,
    pub level: Option<String>,
    pub array_state: Option<String>,
    pub metadata_version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScsiDisk {
    pub base: DeviceBase,
    pub hbtl: Hbtl,
    pub info: ScsiDeviceInfo,
}

#[derive(Debug, Clone)]
pub struct GenericDevice {
    pub base: DeviceBase,
}

/// A classified block device.
#[derive(Debug, Clone)]
pub enum BlockDevice {
    Multipath(MultipathMap),
    DeviceMapper(DmDevice),
    Loop(LoopDevice),
    Md(MdDevice),
    Scsi(ScsiDisk),
    Generic(GenericDevice),
}

impl BlockDeviceOps for BlockDevice {
    fn base(&self) -> &DeviceBase {
        match self {
            BlockDevice::Multipath(dev) => &dev.base,
            BlockDevice::DeviceMapper(dev) => &dev.base,
            BlockDevice::Loop(dev) => &dev.base,
            BlockDevice::Md(dev) => &dev.base,
            BlockDevice::Scsi(dev) => &dev.base,
            BlockDevice::Generic(dev) => &dev.base,
        }
    }

    fn kind(&self) -> DeviceKind {
        match self {
            BlockDevice::Multipath(_) => DeviceKind::Multipath,
            BlockDevice::DeviceMapper(_) => DeviceKind::DeviceMapper,
            BlockDevice::Loop(_) => DeviceKind::Loop,
            BlockDevice::Md(_) => DeviceKind::Md,
            BlockDevice::Scsi(_) => DeviceKind::Scsi,
            BlockDevice::Generic(_) => DeviceKind::Generic,
        }
    }
}

impl BlockDevice {
    /// Serializable snapshot; re-reads sysfs.
    pub fn info(&self) -> Result<BlockDeviceInfo> {
        let base = self.base();
        let mut info = BlockDeviceInfo {
            identity: base.identity().clone(),
            kind: self.kind(),
            size: base.size()?,
            removable: base.removable()?,
            read_only: base.read_only()?,
            holders: base.holders()?,
            slaves: base.slaves()?,
            dm_name: None,
            dm_uuid: None,
            backing_file: None,
            hbtl: None,
        };

        match self {
            BlockDevice::Multipath(dev) => {
                info.dm_name = Some(dev.dm_name.clone());
                info.dm_uuid = Some(dev.dm_uuid.clone());
            }
            BlockDevice::DeviceMapper(dev) => {
                info.dm_name = dev.dm_name.clone();
                info.dm_uuid = dev.dm_uuid.clone();
            }
            BlockDevice::Loop(dev) => {
                info.backing_file = dev
                    .backing_file
                    .as_ref()
                    .map(|p| p.display().to_string());
            }
            BlockDevice::Scsi(dev) => info.hbtl = Some(dev.hbtl),
            BlockDevice::Md(_) | BlockDevice::Generic(_) => {}
        }
        Ok(info)
    }
}
