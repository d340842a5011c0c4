// SPDX-License-Identifier: GPL-3.0-only

//! Explicit configuration handed to every component.
//!
//! Nothing in this crate falls back to process-wide defaults on its own:
//! lock directories, tool paths and the sysfs root all come from a
//! [`BlockdevConfig`], which can be loaded from TOML or built with
//! `Default`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use blockdev_types::MetadataFormat;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SysError};

pub const MDADM_LOCK: &str = "mdadm";
pub const MULTIPATH_LOCK: &str = "multipath";
pub const LVM_LOCK: &str = "lvm";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockdevConfig {
    pub sysfs_root: PathBuf,
    pub dev_root: PathBuf,
    pub proc_root: PathBuf,
    pub tools: ToolPaths,
    pub locks: LockSettings,
    pub md: MdSettings,
}

impl Default for BlockdevConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
            proc_root: PathBuf::from("/proc"),
            tools: ToolPaths::default(),
            locks: LockSettings::default(),
            md: MdSettings::default(),
        }
    }
}

impl BlockdevConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| SysError::io_at(path, e))?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: BlockdevConfig =
            toml::from_str(raw).map_err(|e| SysError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (what, path) in [
            ("tools.mdadm", &self.tools.mdadm),
            ("tools.multipathd", &self.tools.multipathd),
            ("tools.losetup", &self.tools.losetup),
            ("tools.dmsetup", &self.tools.dmsetup),
            ("tools.lvm_root", &self.tools.lvm_root),
            ("tools.lvm_fallback_root", &self.tools.lvm_fallback_root),
            ("locks.directory", &self.locks.directory),
        ] {
            if !path.is_absolute() {
                return Err(SysError::Config(format!(
                    "{what} must be an absolute path, got {}",
                    path.display()
                )));
            }
        }

        if let Some((name, _)) = self
            .locks
            .paths
            .iter()
            .find(|(_, path)| !path.is_absolute())
        {
            return Err(SysError::Config(format!(
                "locks.paths.{name} must be an absolute path"
            )));
        }

        if self.locks.retry_max_ms < self.locks.retry_start_ms {
            return Err(SysError::Config(
                "locks.retry_max_ms must not be below locks.retry_start_ms".to_string(),
            ));
        }

        self.md
            .metadata
            .parse::<MetadataFormat>()
            .map_err(|e| SysError::Config(e.to_string()))?;

        Ok(())
    }
}

/// Absolute locations of the administrative tools. `PATH` is never searched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub mdadm: PathBuf,
    pub multipathd: PathBuf,
    pub losetup: PathBuf,
    pub dmsetup: PathBuf,
    /// Directory holding the `lvm` binary.
    pub lvm_root: PathBuf,
    /// Tried when `lvm_root` has no `lvm` binary.
    pub lvm_fallback_root: PathBuf,
    pub timeout_ms: u64,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            mdadm: PathBuf::from("/sbin/mdadm"),
            multipathd: PathBuf::from("/sbin/multipathd"),
            losetup: PathBuf::from("/sbin/losetup"),
            dmsetup: PathBuf::from("/sbin/dmsetup"),
            lvm_root: PathBuf::from("/usr/sbin"),
            lvm_fallback_root: PathBuf::from("/sbin"),
            timeout_ms: 15_000,
        }
    }
}

impl ToolPaths {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// The `lvm` binary below the primary root, or below the fallback root
    /// if the primary one does not exist.
    pub fn lvm(&self) -> PathBuf {
        let primary = self.lvm_root.join("lvm");
        if primary.exists() {
            primary
        } else {
            self.lvm_fallback_root.join("lvm")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub directory: PathBuf,
    /// Per-name overrides of `<directory>/<name>.lock`.
    pub paths: BTreeMap<String, PathBuf>,
    pub timeout_ms: u64,
    pub retry_start_ms: u64,
    pub retry_step_ms: u64,
    pub retry_max_ms: u64,
    /// Lock files older than this are abandoned even if the recorded PID
    /// is alive (it may have been reused).
    pub max_age_secs: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/run/lock/blockdev"),
            paths: BTreeMap::new(),
            timeout_ms: 15_000,
            retry_start_ms: 100,
            retry_step_ms: 100,
            retry_max_ms: 1_000,
            max_age_secs: 600,
        }
    }
}

impl LockSettings {
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.paths
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.directory.join(format!("{name}.lock")))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_start(&self) -> Duration {
        Duration::from_millis(self.retry_start_ms)
    }

    pub fn retry_step(&self) -> Duration {
        Duration::from_millis(self.retry_step_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MdSettings {
    pub metadata: String,
    pub homehost: String,
    pub array_name: String,
    /// Highest `/dev/mdN` probed when looking for a free id.
    pub max_md_id: u32,
}

impl Default for MdSettings {
    fn default() -> Self {
        Self {
            metadata: "1.2".to_string(),
            homehost: "virtualhost".to_string(),
            array_name: "0".to_string(),
            max_md_id: 10_000,
        }
    }
}
