// SPDX-License-Identifier: GPL-3.0-only

use std::collections::BTreeMap;
use std::iter;

use blockdev_types::{DeviceIdentity, Hbtl, MultipathState, PathState};
use serde::{Deserialize, Serialize};

/// One SCSI path below a multipath map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipathPath {
    pub hbtl: Hbtl,
    pub state: PathState,
    pub device: DeviceIdentity,
    /// Raw multipathd columns the state was derived from.
    pub dm_state: String,
    pub checker_state: String,
    pub device_state: String,
}

/// A member path multipathd still lists but that can no longer be
/// addressed: its SCSI address or device number is gone (`#`) and so is
/// its sysfs node. Counted as failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LostPath {
    /// Kernel name multipathd last knew, e.g. `sdd`.
    pub device: String,
    pub hbtl: Option<Hbtl>,
    pub dm_state: String,
    pub checker_state: String,
}

/// A multipath map with its paths, keyed by HBTL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipathDevice {
    /// Map name, e.g. `mpatha` or the WWID with `user_friendly_names no`.
    pub name: String,
    /// Kernel name of the dm device, e.g. `dm-0`.
    pub dm_device: String,
    pub uuid: String,
    pub paths: BTreeMap<Hbtl, MultipathPath>,
    #[serde(default)]
    pub lost_paths: Vec<LostPath>,
}

impl MultipathDevice {
    pub fn new(name: impl Into<String>, dm_device: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dm_device: dm_device.into(),
            uuid: uuid.into(),
            paths: BTreeMap::new(),
            lost_paths: Vec::new(),
        }
    }

    pub fn state(&self) -> MultipathState {
        MultipathState::aggregate(
            self.paths
                .values()
                .map(|path| path.state)
                .chain(iter::repeat_n(PathState::Failed, self.lost_paths.len())),
        )
    }

    pub fn path(&self, hbtl: Hbtl) -> Option<&MultipathPath> {
        self.paths.get(&hbtl)
    }

    /// Insert or replace the path with the same HBTL.
    pub fn insert_path(&mut self, path: MultipathPath) {
        self.paths.insert(path.hbtl, path);
    }

    pub fn add_lost_path(&mut self, path: LostPath) {
        if !self.lost_paths.iter().any(|lost| lost.device == path.device) {
            self.lost_paths.push(path);
        }
    }

    pub fn active_paths(&self) -> usize {
        self.paths
            .values()
            .filter(|path| path.state == PathState::Active)
            .count()
    }
}
