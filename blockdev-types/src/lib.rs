// SPDX-License-Identifier: GPL-3.0-only

//! Value types for Linux block device topology management
//!
//! Everything in this crate is plain data: sizes, device numbers, SCSI
//! addresses, MD and multipath state. Nothing here touches the running
//! system; `blockdev-sys` builds on these types to read sysfs and drive the
//! administrative tools.
//!
//! Malformed input is rejected with a [`ParseError`] before any of it can
//! reach an external tool.

pub mod device;
pub mod error;
pub mod hbtl;
pub mod identity;
pub mod lvm;
pub mod md;
pub mod multipath;
pub mod units;

pub use device::{BlockDeviceInfo, BlockStats, DeviceKind};
pub use error::{ParseError, Result};
pub use hbtl::Hbtl;
pub use identity::{DevNumber, DeviceIdentity, validate_device_name};
pub use lvm::{LogicalVolumeInfo, PhysicalVolumeInfo, VolumeGroupInfo};
pub use md::{ActiveState, MdState, MdUuid, MdadmMode, MetadataFormat, RaidLevel, SyncProgress};
pub use multipath::{MultipathState, PathState};
pub use units::{SECTOR_SIZE, SizeValue, Unit, UnitFamily};
