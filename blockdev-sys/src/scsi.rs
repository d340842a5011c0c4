// SPDX-License-Identifier: GPL-3.0-only

//! SCSI hosts and logical units as exposed in sysfs.

use std::path::Path;

use blockdev_types::Hbtl;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::sysfs::Sysfs;

/// Inquiry data and state of a SCSI device (`.../device/`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScsiDeviceInfo {
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub revision: Option<String>,
    /// `running`, `offline`, `blocked`, ...
    pub state: Option<String>,
}

impl ScsiDeviceInfo {
    pub fn read(sysfs: &Sysfs, device_dir: &Path) -> Result<Self> {
        Ok(Self {
            vendor: sysfs.read_attr(&device_dir.join("vendor"))?,
            model: sysfs.read_attr(&device_dir.join("model"))?,
            revision: sysfs.read_attr(&device_dir.join("rev"))?,
            state: sysfs.read_attr(&device_dir.join("state"))?,
        })
    }

    pub fn is_running(&self) -> bool {
        self.state.as_deref() == Some("running")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScsiHost {
    pub number: u32,
    /// Driver name (`proc_name`), e.g. `qla2xxx`.
    pub driver: Option<String>,
    pub state: Option<String>,
    /// Logical units behind this host, sorted.
    pub luns: Vec<Hbtl>,
}

impl ScsiHost {
    pub fn name(&self) -> String {
        format!("host{}", self.number)
    }
}

/// All SCSI hosts, ordered by host number.
pub fn scsi_hosts(sysfs: &Sysfs) -> Result<Vec<ScsiHost>> {
    let all_luns = scsi_luns(sysfs)?;
    let host_dir = sysfs.scsi_host_dir();

    let mut hosts = Vec::new();
    for entry in sysfs.list_dir(&host_dir)? {
        let Some(number) = entry
            .strip_prefix("host")
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        let dir = host_dir.join(&entry);
        hosts.push(ScsiHost {
            number,
            driver: sysfs.read_attr(&dir.join("proc_name"))?,
            state: sysfs.read_attr(&dir.join("state"))?,
            luns: all_luns
                .iter()
                .filter(|hbtl| hbtl.host == number)
                .copied()
                .collect(),
        });
    }
    hosts.sort_by_key(|host| host.number);
    Ok(hosts)
}

/// Every `H:B:T:L` entry below `/sys/bus/scsi/devices`, sorted.
pub fn scsi_luns(sysfs: &Sysfs) -> Result<Vec<Hbtl>> {
    let mut luns: Vec<Hbtl> = sysfs
        .list_dir(&sysfs.scsi_devices_dir())?
        .iter()
        .filter_map(|entry| entry.parse().ok())
        .collect();
    luns.sort();
    Ok(luns)
}

/// Kernel name of the block device behind a LUN, if it has one.
pub fn lun_block_device(sysfs: &Sysfs, hbtl: Hbtl) -> Result<Option<String>> {
    let dir = sysfs.scsi_devices_dir().join(hbtl.to_string()).join("block");
    Ok(sysfs.list_dir(&dir)?.into_iter().next())
}

/// SCSI address of a block device, read from `<block dir>/device/scsi_device`.
pub fn block_device_hbtl(sysfs: &Sysfs, block_dir: &Path) -> Result<Option<Hbtl>> {
    Ok(sysfs
        .list_dir(&block_dir.join("device/scsi_device"))?
        .iter()
        .find_map(|entry| entry.parse().ok()))
}
