// SPDX-License-Identifier: GPL-3.0-only

//! LVM volume group, logical volume and physical volume rows.

use serde::{Deserialize, Serialize};

use crate::units::SizeValue;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGroupInfo {
    pub name: String,
    pub size: SizeValue,
    pub free: SizeValue,
    pub pv_count: u32,
    pub lv_count: u32,
}

impl VolumeGroupInfo {
    pub fn used(&self) -> SizeValue {
        self.size.saturating_sub(self.free)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalVolumeInfo {
    pub name: String,
    pub vg_name: String,
    /// Device path (e.g. `/dev/vg0/lv0`).
    pub device_path: String,
    pub size: SizeValue,
    pub active: bool,
}

impl LogicalVolumeInfo {
    /// Short `vg/lv` form understood by every LVM command.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.vg_name, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalVolumeInfo {
    pub device: String,
    /// `None` while the PV is not part of a volume group.
    pub vg_name: Option<String>,
    pub size: SizeValue,
    pub free: SizeValue,
}

impl PhysicalVolumeInfo {
    pub fn is_assigned(&self) -> bool {
        self.vg_name.is_some()
    }
}
