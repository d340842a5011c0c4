// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ParseError, Result};

/// Kernel device number, rendered as `major:minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DevNumber {
    pub major: u32,
    pub minor: u32,
}

impl DevNumber {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for DevNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

impl FromStr for DevNumber {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ParseError::InvalidDevNumber(s.to_string());
        let (major, minor) = s.trim().split_once(':').ok_or_else(invalid)?;
        let parse = |part: &str| {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            part.parse::<u32>().map_err(|_| invalid())
        };
        Ok(Self {
            major: parse(major)?,
            minor: parse(minor)?,
        })
    }
}

/// Check a kernel block device name (`sda`, `dm-3`, `nvme0n1p2`).
///
/// Names are single path components; `cciss!c0d0` style names keep their
/// `!` as sysfs does.
pub fn validate_device_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\0')
        && !name.chars().any(char::is_whitespace);
    if valid {
        Ok(())
    } else {
        Err(ParseError::InvalidDeviceName(name.to_string()))
    }
}

/// The addressable key of a block device.
///
/// Two identities are equal when their device numbers match; the name and
/// sysfs path are descriptive only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub dev: DevNumber,
    pub sysfs_path: PathBuf,
    pub name: String,
}

impl DeviceIdentity {
    pub fn new(dev: DevNumber, sysfs_path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dev,
            sysfs_path: sysfs_path.into(),
            name: name.into(),
        }
    }

    /// Conventional device node path below `dev_root`.
    pub fn node_path(&self, dev_root: &std::path::Path) -> PathBuf {
        dev_root.join(self.name.replace('!', "/"))
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.dev == other.dev
    }
}

impl Eq for DeviceIdentity {}

impl Hash for DeviceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.dev.hash(state);
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.dev)
    }
}
