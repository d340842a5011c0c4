// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use blockdev_types::{
    ActiveState, DeviceIdentity, MdState, MdUuid, MdadmMode, MetadataFormat, RaidLevel,
};
use tracing::{debug, info, warn};

use super::array::MdArray;
use super::{MdArraySummary, kernel_name, merge, parse_mdadm_scan, parse_proc_mdstat};
use crate::config::{BlockdevConfig, MDADM_LOCK, MdSettings};
use crate::device::IdentityResolver;
use crate::error::{Result, SysError};
use crate::lock::LockManager;
use crate::runner::{ToolOutput, ToolRunner};
use crate::sysfs::Sysfs;

/// Drives `mdadm`. Every mutating call holds the `mdadm` lock for the
/// duration of the tool invocation; queries never take it.
pub struct MdAdmin {
    runner: Arc<dyn ToolRunner>,
    locks: LockManager,
    resolver: IdentityResolver,
    mdadm: PathBuf,
    proc_root: PathBuf,
    tool_timeout: Duration,
    lock_timeout: Duration,
    settings: MdSettings,
}

impl fmt::Debug for MdAdmin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MdAdmin")
            .field("mdadm", &self.mdadm)
            .field("lock_timeout", &self.lock_timeout)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl MdAdmin {
    pub fn new(config: &BlockdevConfig, runner: Arc<dyn ToolRunner>, locks: LockManager) -> Self {
        Self {
            runner,
            resolver: IdentityResolver::new(Sysfs::new(&config.sysfs_root), &config.dev_root),
            mdadm: config.tools.mdadm.clone(),
            proc_root: config.proc_root.clone(),
            tool_timeout: config.tools.timeout(),
            lock_timeout: config.locks.timeout(),
            settings: config.md.clone(),
            locks,
        }
    }

    /// How long assembly and the other mutations wait for the `mdadm` lock.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn sysfs(&self) -> &Sysfs {
        self.resolver.sysfs()
    }

    /// Run mdadm in `mode`, optionally under the `mdadm` lock. The raw
    /// output is returned whatever the exit status.
    pub fn exec(&self, mode: MdadmMode, args: &[String], locked: bool) -> Result<ToolOutput> {
        let argv = prefixed(mode, args.to_vec());

        if locked {
            self.locks.with_lock(MDADM_LOCK, self.lock_timeout, || {
                self.runner.run(&self.mdadm, &argv, self.tool_timeout)
            })
        } else {
            self.runner.run(&self.mdadm, &argv, self.tool_timeout)
        }
    }

    fn exec_checked(
        &self,
        mode: MdadmMode,
        args: &[String],
        operation: &str,
    ) -> Result<ToolOutput> {
        self.exec(mode, args, true)?.check(&self.mdadm, operation)
    }

    /// All arrays known to `mdadm --detail --scan`, merged with
    /// `/proc/mdstat`.
    pub fn scan(&self) -> Result<Vec<MdArraySummary>> {
        let scan = self
            .exec(MdadmMode::Manage, &args(&["--detail", "--scan"]), false)?
            .check(&self.mdadm, "scan arrays")?;

        let mdstat_path = self.proc_root.join("mdstat");
        let mdstat = match fs::read_to_string(&mdstat_path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(SysError::io_at(&mdstat_path, e)),
        };

        Ok(merge(
            parse_mdadm_scan(&scan.stdout),
            &parse_proc_mdstat(&mdstat),
            self.resolver.dev_root(),
        ))
    }

    pub fn find_by_uuid(&self, uuid: MdUuid) -> Result<Option<MdArraySummary>> {
        Ok(self
            .scan()?
            .into_iter()
            .find(|summary| summary.uuid == Some(uuid)))
    }

    /// Lowest `N` such that `mdN` exists neither in sysfs nor in `/dev`.
    pub fn next_free_md_id(&self) -> Result<u32> {
        (0..=self.settings.max_md_id)
            .find(|id| {
                let name = format!("md{id}");
                !self.sysfs().block_dir(&name).exists()
                    && !self.resolver.dev_root().join(&name).exists()
            })
            .ok_or_else(|| {
                SysError::DeviceNotFound(format!(
                    "no free md device up to md{}",
                    self.settings.max_md_id
                ))
            })
    }

    /// Create `array` on disk. Picking the id and creating the array happen
    /// under one lock hold so two creators cannot pick the same `mdN`.
    pub fn create_array(&self, array: &mut MdArray) -> Result<()> {
        if let Some(device) = array.device() {
            debug!(array = device, "Array already created");
            return Ok(());
        }

        let name = if array.name().is_empty() {
            self.settings.array_name.clone()
        } else {
            array.name().to_string()
        };

        let device = self.locks.with_lock(MDADM_LOCK, self.lock_timeout, || {
            let device = format!("md{}", self.next_free_md_id()?);
            let mut argv = vec![
                self.node(&device),
                format!("--level={}", array.level()),
                format!("--raid-devices={}", array.members().len()),
                format!("--name={name}"),
                format!("--homehost={}", self.settings.homehost),
                "--run".to_string(),
            ];
            if array.metadata() != MetadataFormat::Default {
                argv.insert(1, format!("--metadata={}", array.metadata()));
            }
            argv.extend(array.members().iter().map(|member| self.member_node(member)));

            self.exec(MdadmMode::Create, &argv, false)?
                .check(&self.mdadm, "create array")?;
            Ok(device)
        })?;

        info!(array = %device, level = %array.level(), "Created MD array");
        let uuid = self.detail_uuid(&device)?;
        array.set_uuid(uuid);
        array.set_device(device);
        self.observe_state(array, None)
    }

    /// Assemble the array with `uuid` (any accepted spelling). An array
    /// that is already running is returned as is.
    pub fn assemble(&self, uuid: &str) -> Result<MdArray> {
        let uuid: MdUuid = uuid.parse()?;

        if let Some(summary) = self.find_by_uuid(uuid)?
            && summary.active
        {
            debug!(%uuid, device = %summary.device, "Array already assembled");
            return self.array_from_summary(summary);
        }

        let lock = match self.locks.acquire(MDADM_LOCK, self.lock_timeout) {
            Ok(lock) => lock,
            Err(SysError::LockTimeout { .. }) => {
                return Err(SysError::AssembleTimeout {
                    uuid,
                    timeout: self.lock_timeout,
                });
            }
            Err(e) => return Err(e),
        };
        let output = self.exec(
            MdadmMode::Assemble,
            &args(&["--scan", &format!("--uuid={uuid}")]),
            false,
        );
        let released = lock.release();
        let output = output?;
        released?;

        if !output.is_success() {
            return Err(SysError::AssembleFailed {
                uuid,
                diagnostic: diagnostic(&output),
            });
        }

        let summary = self
            .find_by_uuid(uuid)?
            .ok_or_else(|| SysError::AssembleFailed {
                uuid,
                diagnostic: "array not listed by mdadm after assembly".to_string(),
            })?;
        info!(%uuid, device = %summary.device, "Assembled MD array");
        self.array_from_summary(summary)
    }

    /// Stop the array. Stopping an array that is not running succeeds.
    pub fn stop(&self, array: &mut MdArray) -> Result<()> {
        let Some(device) = array.device().map(ToString::to_string) else {
            if array.state() != MdState::Absent {
                array.set_state(MdState::Stopped);
            }
            return Ok(());
        };
        if !self.sysfs().block_dir(&device).join("md").is_dir() {
            debug!(array = %device, "Array already stopped");
            array.set_state(MdState::Stopped);
            return Ok(());
        }

        let output = self.exec(MdadmMode::Manage, &[String::from("--stop"), self.node(&device)], true)?;
        if !output.is_success() {
            if is_missing_array(&output.stderr) {
                debug!(array = %device, "mdadm reports the array gone");
            } else {
                output.check(&self.mdadm, "stop array")?;
            }
        }

        info!(array = %device, "Stopped MD array");
        array.set_state(MdState::Stopped);
        Ok(())
    }

    pub fn add_member(&self, array: &mut MdArray, member: DeviceIdentity) -> Result<()> {
        let device = self.running_device(array)?;
        self.exec_checked(
            MdadmMode::Manage,
            &[self.node(&device), "--add".to_string(), self.member_node(&member)],
            "add member",
        )?;
        info!(array = %device, member = %member, "Added member");
        if !array.members().contains(&member) {
            array.members_mut().push(member);
        }
        self.observe_state(array, None)
    }

    /// Mark `member` failed, then remove it from the array.
    pub fn remove_member(&self, array: &mut MdArray, member: &DeviceIdentity) -> Result<()> {
        let device = self.running_device(array)?;
        let node = self.member_node(member);
        self.exec_checked(
            MdadmMode::Manage,
            &[
                self.node(&device),
                "--fail".to_string(),
                node.clone(),
                "--remove".to_string(),
                node,
            ],
            "remove member",
        )?;
        info!(array = %device, member = %member, "Removed member");
        array.members_mut().retain(|existing| existing != member);
        self.observe_state(array, None)
    }

    /// Reshape the array to `raid_devices` active members.
    pub fn grow(&self, array: &mut MdArray, raid_devices: usize) -> Result<()> {
        let level = array.level();
        if raid_devices < level.min_members() {
            return Err(SysError::InsufficientMembers {
                level,
                required: level.min_members(),
                given: raid_devices,
            });
        }
        let device = self.running_device(array)?;
        self.exec_checked(
            MdadmMode::Grow,
            &[self.node(&device), format!("--raid-devices={raid_devices}")],
            "grow array",
        )?;
        info!(array = %device, raid_devices, "Growing MD array");
        self.observe_state(array, None)
    }

    fn running_device(&self, array: &MdArray) -> Result<String> {
        array
            .device()
            .filter(|device| self.sysfs().block_dir(device).join("md").is_dir())
            .map(ToString::to_string)
            .ok_or_else(|| SysError::ArrayNotFound(array.label()))
    }

    fn node(&self, device: &str) -> String {
        self.resolver.dev_root().join(device).display().to_string()
    }

    fn member_node(&self, member: &DeviceIdentity) -> String {
        member.node_path(self.resolver.dev_root()).display().to_string()
    }

    /// `MD_UUID` from `mdadm --detail --export`.
    fn detail_uuid(&self, device: &str) -> Result<Option<MdUuid>> {
        let output = self.exec(
            MdadmMode::Manage,
            &[String::from("--detail"), String::from("--export"), self.node(device)],
            false,
        )?;
        if !output.is_success() {
            warn!(array = device, stderr = %output.stderr.trim(), "mdadm --detail failed");
            return Ok(None);
        }
        Ok(parse_export(&output.stdout)
            .get("MD_UUID")
            .and_then(|uuid| uuid.parse().ok()))
    }

    /// Refresh from sysfs when the array is visible there; otherwise fall
    /// back to what mdstat said.
    fn observe_state(&self, array: &mut MdArray, summary: Option<&MdArraySummary>) -> Result<()> {
        let visible = array
            .device()
            .is_some_and(|device| self.sysfs().block_dir(device).join("md").is_dir());
        if visible {
            array.refresh_state(self.sysfs())?;
            return Ok(());
        }
        let state = match summary {
            Some(summary) if summary.active && summary.degraded => {
                MdState::Active(ActiveState::Degraded)
            }
            Some(summary) if summary.active => MdState::Active(ActiveState::Clean),
            _ => MdState::Assembling,
        };
        array.set_state(state);
        Ok(())
    }

    fn array_from_summary(&self, summary: MdArraySummary) -> Result<MdArray> {
        let device = kernel_name(&summary.device, self.resolver.dev_root());
        let md_dir = self.sysfs().block_dir(&device).join("md");

        let level = match &summary.level {
            Some(level) => Some(level.clone()),
            None => self.sysfs().read_attr(&md_dir.join("level"))?,
        }
        .ok_or_else(|| SysError::UnexpectedOutput {
            tool: "mdadm".to_string(),
            detail: format!("no raid level known for {}", summary.device),
        })?
        .parse::<RaidLevel>()?;

        let metadata = match &summary.metadata {
            Some(metadata) => Some(metadata.clone()),
            None => self.sysfs().read_attr(&md_dir.join("metadata_version"))?,
        }
        .and_then(|metadata| metadata.parse().ok())
        .unwrap_or(MetadataFormat::Default);

        let mut member_names = summary.members.clone();
        if member_names.is_empty() {
            member_names = self
                .sysfs()
                .list_dir(&md_dir)?
                .into_iter()
                .filter_map(|entry| entry.strip_prefix("dev-").map(ToString::to_string))
                .collect();
        }
        let members = member_names
            .iter()
            .filter_map(|name| match self.resolver.from_name(name) {
                Ok(identity) => Some(identity),
                Err(e) => {
                    warn!(array = %device, member = %name, "Skipping unresolvable member: {e}");
                    None
                }
            })
            .collect();

        let mut array = MdArray::running(
            summary.uuid,
            summary.name.clone().unwrap_or_else(|| device.clone()),
            level,
            metadata,
            members,
            device,
        );
        self.observe_state(&mut array, Some(&summary))?;
        Ok(array)
    }
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(ToString::to_string).collect()
}

fn prefixed(mode: MdadmMode, rest: Vec<String>) -> Vec<String> {
    mode.flag()
        .map(ToString::to_string)
        .into_iter()
        .chain(rest)
        .collect()
}

fn diagnostic(output: &ToolOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        output.stdout.trim().to_string()
    } else {
        stderr.to_string()
    }
}

fn is_missing_array(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    ["not found", "does not exist", "no such file or directory"]
        .iter()
        .any(|pattern| stderr.contains(pattern))
}

/// `KEY=value` lines of `mdadm --detail --export`.
fn parse_export(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.trim().split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}
