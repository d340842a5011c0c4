// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use blockdev_types::{DevNumber, DeviceIdentity, Hbtl, PathState, validate_device_name};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::device::{LostPath, MultipathDevice, MultipathPath};
use crate::config::{BlockdevConfig, MULTIPATH_LOCK};
use crate::device::IdentityResolver;
use crate::error::{Result, SysError};
use crate::lock::LockManager;
use crate::runner::{ToolOutput, ToolRunner};
use crate::scsi::{block_device_hbtl, lun_block_device};
use crate::sysfs::Sysfs;

/// Column layout requested from `multipathd show paths`. The checker state
/// comes last because it may contain spaces (`i/o pending`).
pub const PATHS_FORMAT: &str = "%m %i %d %D %t %o %T";

/// One line of `multipathd show maps`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapEntry {
    pub name: String,
    pub dm_device: String,
    pub uuid: String,
}

/// A member of a map: addressable by HBTL, or lost mid-scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PathMember {
    Present(MultipathPath),
    Lost(LostPath),
}

/// One path of `multipathd show paths`, with the map it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathEntry {
    pub map: String,
    pub path: PathMember,
}

/// A row of `show paths`. multipathd prints `#` for fields of a path whose
/// device went away, so the address and device number may be missing.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PathRow {
    map: String,
    hbtl: Option<Hbtl>,
    device: String,
    dev: Option<DevNumber>,
    dm_state: String,
    device_state: String,
    checker_state: String,
}

/// Talks to `multipathd`. Queries run unlocked; topology changes hold the
/// `multipath` lock and are followed by a full re-enumeration.
pub struct MultipathSystem {
    runner: Arc<dyn ToolRunner>,
    locks: LockManager,
    resolver: IdentityResolver,
    multipathd: PathBuf,
    tool_timeout: Duration,
    lock_timeout: Duration,
}

impl fmt::Debug for MultipathSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultipathSystem")
            .field("multipathd", &self.multipathd)
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

impl MultipathSystem {
    pub fn new(config: &BlockdevConfig, runner: Arc<dyn ToolRunner>, locks: LockManager) -> Self {
        Self {
            runner,
            locks,
            resolver: IdentityResolver::new(Sysfs::new(&config.sysfs_root), &config.dev_root),
            multipathd: config.tools.multipathd.clone(),
            tool_timeout: config.tools.timeout(),
            lock_timeout: config.locks.timeout(),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    fn sysfs(&self) -> &Sysfs {
        self.resolver.sysfs()
    }

    fn run(&self, args: &[String]) -> Result<ToolOutput> {
        self.runner.run(&self.multipathd, args, self.tool_timeout)
    }

    /// multipathd answers `fail` on stdout for rejected commands, with
    /// exit status 0 on older releases.
    fn checked(&self, output: ToolOutput, operation: &str) -> Result<ToolOutput> {
        if output.is_success() && output.stdout.trim() == "fail" {
            return Err(SysError::ToolFailed {
                tool: self.multipathd.clone(),
                operation: operation.to_string(),
                exit_code: output.exit_code,
                stderr: "fail".to_string(),
            });
        }
        output.check(&self.multipathd, operation)
    }

    pub fn maps(&self) -> Result<Vec<MapEntry>> {
        let output = self.run(&args(&["show", "maps"]))?;
        let output = self.checked(output, "show maps")?;
        Ok(parse_maps(&output.stdout))
    }

    /// Every path multipathd knows that belongs to a map.
    pub fn paths(&self) -> Result<Vec<PathEntry>> {
        let output = self.run(&args(&["show", "paths", "format", PATHS_FORMAT]))?;
        let output = self.checked(output, "show paths")?;

        parse_paths(&output.stdout)?
            .into_iter()
            .map(|row| {
                Ok(PathEntry {
                    map: row.map.clone(),
                    path: self.resolve_path(row)?,
                })
            })
            .collect()
    }

    /// Combine a multipathd row with what sysfs says about the device. A
    /// device that has vanished from sysfs is a failed path; one that can
    /// no longer be addressed at all is a lost path.
    fn resolve_path(&self, row: PathRow) -> Result<PathMember> {
        let identity = match self.resolver.from_name(&row.device) {
            Ok(identity) => Some(identity),
            Err(SysError::DeviceNotFound(_) | SysError::Parse(_)) => None,
            Err(e) => return Err(e),
        };

        let Some(identity) = identity else {
            let (Some(hbtl), Some(dev)) = (row.hbtl, row.dev) else {
                warn!(path = %row.device, map = %row.map, "Path lost its address, counting it as failed");
                return Ok(PathMember::Lost(LostPath {
                    device: row.device,
                    hbtl: row.hbtl,
                    dm_state: row.dm_state,
                    checker_state: row.checker_state,
                }));
            };
            debug!(path = %row.device, %hbtl, "Path vanished from sysfs");
            return Ok(PathMember::Present(MultipathPath {
                hbtl,
                state: PathState::Failed,
                device: DeviceIdentity::new(dev, self.sysfs().block_dir(&row.device), &row.device),
                dm_state: row.dm_state,
                checker_state: row.checker_state,
                device_state: row.device_state,
            }));
        };

        let hbtl = match row.hbtl {
            Some(hbtl) => Some(hbtl),
            None => block_device_hbtl(self.sysfs(), &identity.sysfs_path)?,
        };
        let Some(hbtl) = hbtl else {
            warn!(path = %row.device, map = %row.map, "Path has no SCSI address, counting it as failed");
            return Ok(PathMember::Lost(LostPath {
                device: row.device,
                hbtl: None,
                dm_state: row.dm_state,
                checker_state: row.checker_state,
            }));
        };

        let device_state = self
            .sysfs()
            .read_attr(&identity.sysfs_path.join("device/state"))?
            .unwrap_or_else(|| row.device_state.clone());
        // multipathd has already dropped the device number of a dying path.
        let state = match row.dev {
            Some(_) => PathState::from_multipathd(&row.dm_state, &row.checker_state, &device_state),
            None => PathState::Failed,
        };

        Ok(PathMember::Present(MultipathPath {
            hbtl,
            state,
            device: identity,
            dm_state: row.dm_state,
            checker_state: row.checker_state,
            device_state,
        }))
    }

    /// All maps with their paths, enumerated from scratch.
    pub fn topology(&self) -> Result<Vec<MultipathDevice>> {
        let mut devices: Vec<MultipathDevice> = self
            .maps()?
            .into_iter()
            .map(|map| MultipathDevice::new(map.name, map.dm_device, map.uuid))
            .collect();

        for entry in self.paths()? {
            match (devices.iter_mut().find(|device| device.name == entry.map), entry.path) {
                (Some(device), PathMember::Present(path)) => device.insert_path(path),
                (Some(device), PathMember::Lost(path)) => device.add_lost_path(path),
                (None, _) => debug!(map = %entry.map, "Path of unknown map"),
            }
        }
        Ok(devices)
    }

    /// The map called `name`; its dm kernel name or uuid also match.
    pub fn device(&self, name: &str) -> Result<MultipathDevice> {
        self.topology()?
            .into_iter()
            .find(|device| device.name == name || device.dm_device == name || device.uuid == name)
            .ok_or_else(|| SysError::DeviceNotFound(name.to_string()))
    }

    pub fn add_path(&self, path: &str) -> Result<Vec<MultipathDevice>> {
        let device = self.path_device(path)?;
        self.change(&["add", "path", &device], "add path")
    }

    pub fn remove_path(&self, path: &str) -> Result<Vec<MultipathDevice>> {
        let device = self.path_device(path)?;
        self.change(&["del", "path", &device], "remove path")
    }

    pub fn fail_path(&self, path: &str) -> Result<Vec<MultipathDevice>> {
        let device = self.path_device(path)?;
        self.change(&["fail", "path", &device], "fail path")
    }

    pub fn reinstate_path(&self, path: &str) -> Result<Vec<MultipathDevice>> {
        let device = self.path_device(path)?;
        self.change(&["reinstate", "path", &device], "reinstate path")
    }

    pub fn reconfigure(&self) -> Result<Vec<MultipathDevice>> {
        self.change(&["reconfigure"], "reconfigure")
    }

    /// Kernel name of a path given as a name (`sdc`) or as an HBTL.
    fn path_device(&self, spec: &str) -> Result<String> {
        let spec = spec.trim();
        if spec.contains(':') {
            let hbtl: Hbtl = spec.parse()?;
            return lun_block_device(self.sysfs(), hbtl)?
                .ok_or_else(|| SysError::DeviceNotFound(hbtl.to_string()));
        }
        let name = spec.strip_prefix("/dev/").unwrap_or(spec);
        validate_device_name(name)?;
        Ok(name.to_string())
    }

    fn change(&self, command: &[&str], operation: &str) -> Result<Vec<MultipathDevice>> {
        self.locks.with_lock(MULTIPATH_LOCK, self.lock_timeout, || {
            let output = self.run(&args(command))?;
            self.checked(output, operation)
        })?;
        info!(command = %command.join(" "), "multipathd topology changed");

        let topology = self.topology()?;
        for device in &topology {
            if device.active_paths() == 0 {
                warn!(map = %device.name, "Multipath map has no active path");
            }
        }
        Ok(topology)
    }
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(ToString::to_string).collect()
}

/// `name sysfs uuid` rows after the header line.
fn parse_maps(output: &str) -> Vec<MapEntry> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some(MapEntry {
                name: fields.next()?.to_string(),
                dm_device: fields.next()?.to_string(),
                uuid: fields.next()?.to_string(),
            })
        })
        .collect()
}

/// A `show paths` field that multipathd could not fill in, `#` for a
/// vanished device. Garbage is treated the same way rather than failing the
/// whole listing.
fn optional_field<T: std::str::FromStr>(value: &str, column: &str, line: &str) -> Option<T> {
    if value.contains('#') {
        return None;
    }
    let parsed = value.parse().ok();
    if parsed.is_none() {
        warn!(column, value, line, "Unparsable multipathd path field");
    }
    parsed
}

/// Rows of `show paths format PATHS_FORMAT` after the header. Orphan paths
/// (`[orphan]`, no map) are skipped.
fn parse_paths(output: &str) -> Result<Vec<PathRow>> {
    let mut rows = Vec::new();
    for line in output.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        let [map, hbtl, device, dev, dm_state, device_state, checker @ ..] = fields.as_slice()
        else {
            return Err(SysError::UnexpectedOutput {
                tool: "multipathd".to_string(),
                detail: format!("short path line {line:?}"),
            });
        };
        if map.starts_with('[') {
            debug!(path = %device, "Skipping orphan path");
            continue;
        }

        rows.push(PathRow {
            map: map.to_string(),
            hbtl: optional_field(hbtl, "hcil", line),
            device: device.to_string(),
            dev: optional_field(dev, "dev_t", line),
            dm_state: dm_state.to_string(),
            device_state: device_state.to_string(),
            checker_state: checker.join(" "),
        });
    }
    Ok(rows)
}
