// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ParseError, Result};

/// SCSI address `host:bus:target:lun`.
///
/// Ordering is numeric, field by field, so sorted path sets list
/// `0:0:2:0` before `0:0:10:0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Hbtl {
    pub host: u32,
    pub bus: u32,
    pub target: u32,
    pub lun: u64,
}

impl Hbtl {
    pub const fn new(host: u32, bus: u32, target: u32, lun: u64) -> Self {
        Self {
            host,
            bus,
            target,
            lun,
        }
    }

    /// Sysfs host directory name, e.g. `host3`.
    pub fn host_name(&self) -> String {
        format!("host{}", self.host)
    }
}

impl fmt::Display for Hbtl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.host, self.bus, self.target, self.lun)
    }
}

impl FromStr for Hbtl {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ParseError::InvalidHbtl(s.to_string());
        let fields: Vec<&str> = s.trim().split(':').collect();
        let [host, bus, target, lun] = fields.as_slice() else {
            return Err(invalid());
        };
        if fields
            .iter()
            .any(|f| f.is_empty() || !f.bytes().all(|b| b.is_ascii_digit()))
        {
            return Err(invalid());
        }

        Ok(Self {
            host: host.parse().map_err(|_| invalid())?,
            bus: bus.parse().map_err(|_| invalid())?,
            target: target.parse().map_err(|_| invalid())?,
            lun: lun.parse().map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<&str> for Hbtl {
    type Error = ParseError;

    fn try_from(value: &str) -> Result<Self> {
        value.parse()
    }
}

impl TryFrom<String> for Hbtl {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Hbtl> for String {
    fn from(hbtl: Hbtl) -> Self {
        hbtl.to_string()
    }
}
