// SPDX-License-Identifier: GPL-3.0-only

//! LVM volume groups, logical and physical volumes through the `lvm` binary.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use blockdev_types::{LogicalVolumeInfo, PhysicalVolumeInfo, SizeValue, VolumeGroupInfo};
use tracing::{debug, info};

use crate::config::{BlockdevConfig, LVM_LOCK};
use crate::error::{Result, SysError};
use crate::lock::LockManager;
use crate::runner::ToolRunner;

const REPORT_ARGS: [&str; 6] = ["--noheadings", "--units", "b", "--nosuffix", "--separator", "\t"];

const VG_COLUMNS: &str = "vg_name,vg_size,vg_free,pv_count,lv_count";
const LV_COLUMNS: &str = "vg_name,lv_name,lv_path,lv_size,lv_active";
const PV_COLUMNS: &str = "pv_name,vg_name,pv_size,pv_free";

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(ToString::to_string).collect()
}

fn parse_tabbed_line(line: &str) -> Vec<&str> {
    line.split('\t').map(str::trim).collect()
}

fn parse_bytes(value: &str) -> Option<SizeValue> {
    value.parse::<u128>().ok().map(SizeValue::from_bytes)
}

fn report_rows(output: &str, min_columns: usize) -> impl Iterator<Item = Vec<&str>> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_tabbed_line)
        .filter(move |cols| cols.len() >= min_columns)
}

fn parse_vgs(output: &str) -> Vec<VolumeGroupInfo> {
    report_rows(output, 5)
        .filter_map(|cols| {
            Some(VolumeGroupInfo {
                name: cols[0].to_string(),
                size: parse_bytes(cols[1])?,
                free: parse_bytes(cols[2])?,
                pv_count: cols[3].parse().ok()?,
                lv_count: cols[4].parse().ok()?,
            })
        })
        .collect()
}

fn parse_lvs(output: &str) -> Vec<LogicalVolumeInfo> {
    report_rows(output, 4)
        .filter_map(|cols| {
            let active = cols.get(4).copied().unwrap_or_default();
            Some(LogicalVolumeInfo {
                vg_name: cols[0].to_string(),
                name: cols[1].to_string(),
                device_path: cols[2].to_string(),
                size: parse_bytes(cols[3])?,
                active: active.eq_ignore_ascii_case("active") || active == "y",
            })
        })
        .collect()
}

fn parse_pvs(output: &str) -> Vec<PhysicalVolumeInfo> {
    report_rows(output, 4)
        .filter_map(|cols| {
            Some(PhysicalVolumeInfo {
                device: cols[0].to_string(),
                vg_name: (!cols[1].is_empty()).then(|| cols[1].to_string()),
                size: parse_bytes(cols[2])?,
                free: parse_bytes(cols[3])?,
            })
        })
        .collect()
}

/// LVM object names: letters, digits and `+_.-`, not starting with `-`.
fn validate_lvm_name(kind: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 127
        && name != "."
        && name != ".."
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(SysError::InvalidArgument(format!("invalid {kind} name {name:?}")))
    }
}

/// `<bytes>b`, the unambiguous byte form for `-L`.
fn size_arg(size: SizeValue) -> Result<String> {
    if size == SizeValue::ZERO {
        return Err(SysError::InvalidArgument("volume size must not be zero".to_string()));
    }
    size.to_sectors()?;
    Ok(format!("{}b", size.bytes()))
}

/// Drives the `lvm` multi-call binary. Changes hold the `lvm` lock.
pub struct LvmAdmin {
    runner: Arc<dyn ToolRunner>,
    locks: LockManager,
    lvm: PathBuf,
    tool_timeout: Duration,
    lock_timeout: Duration,
}

impl fmt::Debug for LvmAdmin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LvmAdmin")
            .field("lvm", &self.lvm)
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

impl LvmAdmin {
    pub fn new(config: &BlockdevConfig, runner: Arc<dyn ToolRunner>, locks: LockManager) -> Self {
        Self {
            runner,
            locks,
            lvm: config.tools.lvm(),
            tool_timeout: config.tools.timeout(),
            lock_timeout: config.locks.timeout(),
        }
    }

    pub fn lvm_path(&self) -> &Path {
        &self.lvm
    }

    fn report(&self, command: &str, columns: &str, extra: &[&str]) -> Result<String> {
        let mut argv = vec![command.to_string()];
        argv.extend(args(&REPORT_ARGS));
        argv.extend(args(&["-o", columns]));
        argv.extend(args(extra));

        let output = self
            .runner
            .run(&self.lvm, &argv, self.tool_timeout)?
            .check(&self.lvm, command)?;
        Ok(output.stdout)
    }

    fn change(&self, argv: Vec<String>, operation: &str) -> Result<()> {
        self.locks.with_lock(LVM_LOCK, self.lock_timeout, || {
            self.runner
                .run(&self.lvm, &argv, self.tool_timeout)?
                .check(&self.lvm, operation)
                .map(|_| ())
        })
    }

    pub fn volume_groups(&self) -> Result<Vec<VolumeGroupInfo>> {
        Ok(parse_vgs(&self.report("vgs", VG_COLUMNS, &[])?))
    }

    pub fn logical_volumes(&self) -> Result<Vec<LogicalVolumeInfo>> {
        Ok(parse_lvs(&self.report("lvs", LV_COLUMNS, &[])?))
    }

    pub fn physical_volumes(&self) -> Result<Vec<PhysicalVolumeInfo>> {
        Ok(parse_pvs(&self.report("pvs", PV_COLUMNS, &[])?))
    }

    fn logical_volume(&self, vg: &str, name: &str) -> Result<LogicalVolumeInfo> {
        let full_name = format!("{vg}/{name}");
        let output = self.report("lvs", LV_COLUMNS, &[full_name.as_str()])?;
        parse_lvs(&output)
            .into_iter()
            .find(|lv| lv.vg_name == vg && lv.name == name)
            .ok_or(SysError::DeviceNotFound(full_name))
    }

    pub fn create_volume(&self, vg: &str, name: &str, size: SizeValue) -> Result<LogicalVolumeInfo> {
        validate_lvm_name("volume group", vg)?;
        validate_lvm_name("logical volume", name)?;
        let size = size_arg(size)?;

        self.change(
            args(&["lvcreate", "--yes", "-n", name, "-L", size.as_str(), vg]),
            "lvcreate",
        )?;
        info!(vg, lv = name, size = %size, "Created logical volume");
        self.logical_volume(vg, name)
    }

    pub fn extend_volume(&self, vg: &str, name: &str, new_size: SizeValue) -> Result<LogicalVolumeInfo> {
        validate_lvm_name("volume group", vg)?;
        validate_lvm_name("logical volume", name)?;
        let size = size_arg(new_size)?;

        let full_name = format!("{vg}/{name}");
        self.change(
            args(&["lvextend", "-L", size.as_str(), full_name.as_str()]),
            "lvextend",
        )?;
        info!(lv = %full_name, size = %size, "Extended logical volume");
        self.logical_volume(vg, name)
    }

    pub fn remove_volume(&self, vg: &str, name: &str) -> Result<()> {
        validate_lvm_name("volume group", vg)?;
        validate_lvm_name("logical volume", name)?;

        let full_name = format!("{vg}/{name}");
        self.change(
            args(&["lvremove", "--yes", full_name.as_str()]),
            "lvremove",
        )?;
        debug!(lv = %full_name, "Removed logical volume");
        Ok(())
    }
}
