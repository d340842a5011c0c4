// SPDX-License-Identifier: GPL-3.0-only

use std::time::Duration;

use blockdev_types::{
    ActiveState, DeviceIdentity, MdState, MdUuid, MdadmMode, MetadataFormat, RaidLevel,
    SyncProgress,
};
use tracing::{debug, info};

use crate::clock::{CancelToken, Clock};
use crate::error::{Result, SysError};
use crate::sysfs::Sysfs;

/// `array_state` values of a running array.
const RUNNING_STATES: [&str; 7] = [
    "clean",
    "active",
    "active-idle",
    "write-pending",
    "readonly",
    "read-auto",
    "suspended",
];

/// One MD RAID array.
///
/// Built either by [`MdArray::create`] (validated, not yet on disk) or by
/// [`MdAdmin`](super::MdAdmin) from a running array. Not synchronized;
/// callers serialize mutation of one array themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdArray {
    uuid: Option<MdUuid>,
    name: String,
    level: RaidLevel,
    metadata: MetadataFormat,
    mode: MdadmMode,
    members: Vec<DeviceIdentity>,
    device: Option<String>,
    state: MdState,
}

impl MdArray {
    /// Validate a new array definition. Nothing is executed; the array
    /// stays [`MdState::Absent`] until it is created or assembled.
    pub fn create(
        level: &str,
        metadata: &str,
        members: Vec<DeviceIdentity>,
        name: &str,
    ) -> Result<Self> {
        let level: RaidLevel = level.parse()?;
        let metadata: MetadataFormat = metadata.parse()?;
        if members.len() < level.min_members() {
            return Err(SysError::InsufficientMembers {
                level,
                required: level.min_members(),
                given: members.len(),
            });
        }

        Ok(Self {
            uuid: None,
            name: name.to_string(),
            level,
            metadata,
            mode: MdadmMode::Create,
            members,
            device: None,
            state: MdState::Absent,
        })
    }

    pub(crate) fn running(
        uuid: Option<MdUuid>,
        name: String,
        level: RaidLevel,
        metadata: MetadataFormat,
        members: Vec<DeviceIdentity>,
        device: String,
    ) -> Self {
        Self {
            uuid,
            name,
            level,
            metadata,
            mode: MdadmMode::Manage,
            members,
            device: Some(device),
            state: MdState::Assembling,
        }
    }

    pub fn uuid(&self) -> Option<MdUuid> {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level(&self) -> RaidLevel {
        self.level
    }

    pub fn metadata(&self) -> MetadataFormat {
        self.metadata
    }

    /// The mdadm mode the next action on this array runs in.
    pub fn mode(&self) -> MdadmMode {
        self.mode
    }

    pub fn members(&self) -> &[DeviceIdentity] {
        &self.members
    }

    /// Kernel name (`md127`) once the array exists.
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn state(&self) -> MdState {
        self.state
    }

    pub(crate) fn set_uuid(&mut self, uuid: Option<MdUuid>) {
        self.uuid = uuid;
    }

    pub(crate) fn set_device(&mut self, device: String) {
        self.device = Some(device);
        self.mode = MdadmMode::Manage;
    }

    pub(crate) fn set_state(&mut self, state: MdState) {
        self.state = state;
    }

    pub(crate) fn members_mut(&mut self) -> &mut Vec<DeviceIdentity> {
        &mut self.members
    }

    fn require_device(&self) -> Result<&str> {
        self.device
            .as_deref()
            .ok_or_else(|| SysError::ArrayNotFound(self.label()))
    }

    /// Name used in errors and logs: kernel name, then UUID, then array name.
    pub fn label(&self) -> String {
        match (&self.device, self.uuid) {
            (Some(device), _) => device.clone(),
            (None, Some(uuid)) => uuid.to_string(),
            (None, None) => self.name.clone(),
        }
    }

    /// Live resync progress, or `None` when the array is not resyncing.
    ///
    /// Any `sync_action` other than `idle`/`frozen` counts as a resync. A
    /// pending or delayed resync reports zero progress.
    pub fn sync_status(&self, sysfs: &Sysfs) -> Result<Option<SyncProgress>> {
        let device = self.require_device()?;
        let md_dir = sysfs.block_dir(device).join("md");
        let Some(action) = sysfs.read_attr(&md_dir.join("sync_action"))? else {
            if md_dir.is_dir() {
                return Ok(None);
            }
            return Err(SysError::ArrayNotFound(device.to_string()));
        };
        if matches!(action.as_str(), "idle" | "frozen") {
            return Ok(None);
        }

        let completed = sysfs
            .read_attr(&md_dir.join("sync_completed"))?
            .unwrap_or_default();
        match SyncProgress::parse_sync_completed(&completed) {
            Ok(Some(progress)) => Ok(Some(progress)),
            Ok(None) => Ok(SyncProgress::new(0, self.sectors(sysfs)?)),
            Err(_) if completed == "delayed" || completed == "pending" => {
                Ok(SyncProgress::new(0, self.sectors(sysfs)?))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn sectors(&self, sysfs: &Sysfs) -> Result<u64> {
        let device = self.require_device()?;
        Ok(sysfs
            .read_u64(&sysfs.block_dir(device).join("size"))?
            .unwrap_or(0))
    }

    /// Re-read the state from sysfs and store it.
    pub fn refresh_state(&mut self, sysfs: &Sysfs) -> Result<MdState> {
        let state = self.read_state(sysfs)?;
        self.state = state;
        Ok(state)
    }

    fn read_state(&self, sysfs: &Sysfs) -> Result<MdState> {
        let Some(device) = self.device.as_deref() else {
            return Ok(match self.state {
                MdState::Absent => MdState::Absent,
                _ => MdState::Stopped,
            });
        };
        let md_dir = sysfs.block_dir(device).join("md");
        let Some(array_state) = sysfs.read_attr(&md_dir.join("array_state"))? else {
            return Ok(MdState::Stopped);
        };

        let state = match array_state.as_str() {
            "clear" => MdState::Stopped,
            "inactive" => MdState::Assembling,
            running if RUNNING_STATES.contains(&running) => {
                if self.sync_status(sysfs)?.is_some() {
                    MdState::Active(ActiveState::Syncing)
                } else if sysfs.read_u64(&md_dir.join("degraded"))?.unwrap_or(0) > 0 {
                    MdState::Active(ActiveState::Degraded)
                } else {
                    MdState::Active(ActiveState::Clean)
                }
            }
            other => {
                return Err(SysError::UnexpectedOutput {
                    tool: "sysfs".to_string(),
                    detail: format!("{device}: unknown array_state {other:?}"),
                });
            }
        };
        debug!(array = device, ?state, "Read array state");
        Ok(state)
    }

    /// Poll [`sync_status`](Self::sync_status) until the resync finishes.
    pub fn wait_for_sync(
        &self,
        sysfs: &Sysfs,
        clock: &dyn Clock,
        cancel: &CancelToken,
        poll_interval: Duration,
        deadline: Duration,
    ) -> Result<()> {
        poll_until_synced(
            &self.label(),
            || self.sync_status(sysfs),
            clock,
            cancel,
            poll_interval,
            deadline,
        )
    }
}

/// Call `status` every `poll_interval` until it reports no resync.
///
/// Fails with [`SysError::SyncTimeout`] once `deadline` has passed and with
/// [`SysError::Cancelled`] as soon as `cancel` fires, including mid-sleep.
pub fn poll_until_synced<F>(
    array: &str,
    mut status: F,
    clock: &dyn Clock,
    cancel: &CancelToken,
    poll_interval: Duration,
    deadline: Duration,
) -> Result<()>
where
    F: FnMut() -> Result<Option<SyncProgress>>,
{
    let poll_interval = poll_interval.max(Duration::from_millis(1));
    let started = clock.now();

    loop {
        if cancel.is_cancelled() {
            return Err(SysError::Cancelled);
        }
        let Some(progress) = status()? else {
            info!(array, "Resync finished");
            return Ok(());
        };

        let elapsed = clock.now().saturating_duration_since(started);
        if elapsed >= deadline {
            return Err(SysError::SyncTimeout {
                array: array.to_string(),
                deadline,
            });
        }
        debug!(
            array,
            completed = progress.completed(),
            total = progress.total(),
            "Resync in progress"
        );
        if !clock.sleep(poll_interval.min(deadline - elapsed), cancel) {
            return Err(SysError::Cancelled);
        }
    }
}
