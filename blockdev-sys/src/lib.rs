// SPDX-License-Identifier: GPL-3.0-only

//! System-level block device topology management
//!
//! This crate reads the kernel's view of block devices from sysfs and
//! drives the administrative tools that change it:
//! - Device identity resolution and classification (multipath, dm, loop,
//!   MD, SCSI, generic)
//! - Cross-process admin locks serializing `mdadm`, `multipathd` and `lvm`
//! - MD RAID assembly, lifecycle and resync monitoring
//! - Multipath map and path topology
//! - LVM volumes, loop devices and device-mapper tables
//!
//! External tools are always invoked by absolute path through a
//! [`ToolRunner`], so every operation can be exercised against a
//! [`ScriptedRunner`] and a fixture sysfs tree.

pub mod clock;
pub mod config;
pub mod device;
pub mod dm;
pub mod error;
pub mod lock;
pub mod loop_dev;
pub mod lvm;
pub mod md;
pub mod multipath;
pub mod runner;
pub mod scsi;
pub mod sysfs;

pub use clock::{CancelToken, Clock, FakeClock, SystemClock};
pub use config::{BlockdevConfig, LVM_LOCK, LockSettings, MDADM_LOCK, MULTIPATH_LOCK, ToolPaths};
pub use device::{BlockDevice, BlockDeviceOps, DeviceBase, DeviceClassifier, IdentityResolver};
pub use dm::DmSetup;
pub use error::{ErrorKind, Result, SysError};
pub use lock::{AdminLock, LockManager};
pub use loop_dev::LoopAdmin;
pub use lvm::LvmAdmin;
pub use md::{MdAdmin, MdArray, MdArraySummary};
pub use multipath::{MultipathDevice, MultipathPath, MultipathSystem};
pub use runner::{ScriptedRunner, SystemRunner, ToolOutput, ToolRunner};
pub use sysfs::Sysfs;
