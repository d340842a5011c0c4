// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hbtl::Hbtl;
use crate::identity::DeviceIdentity;
use crate::units::SizeValue;

/// The abstraction a block device was classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    Multipath,
    DeviceMapper,
    Loop,
    Md,
    Scsi,
    Generic,
}

impl DeviceKind {
    pub fn label(self) -> &'static str {
        match self {
            DeviceKind::Multipath => "multipath",
            DeviceKind::DeviceMapper => "device-mapper",
            DeviceKind::Loop => "loop",
            DeviceKind::Md => "md",
            DeviceKind::Scsi => "scsi",
            DeviceKind::Generic => "generic",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Counters from `/sys/class/block/<name>/stat`.
///
/// Kernels before 4.18 report 11 fields, later ones add discard counters
/// and 5.5 adds flush counters; missing fields read as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStats {
    pub read_ios: u64,
    pub read_merges: u64,
    pub read_sectors: u64,
    pub read_ticks_ms: u64,
    pub write_ios: u64,
    pub write_merges: u64,
    pub write_sectors: u64,
    pub write_ticks_ms: u64,
    pub in_flight: u64,
    pub io_ticks_ms: u64,
    pub time_in_queue_ms: u64,
    pub discard_ios: u64,
    pub discard_merges: u64,
    pub discard_sectors: u64,
    pub discard_ticks_ms: u64,
    pub flush_ios: u64,
    pub flush_ticks_ms: u64,
}

impl BlockStats {
    /// Parse the whitespace separated counters; `None` if fewer than 11
    /// numeric fields are present.
    pub fn parse(text: &str) -> Option<Self> {
        let fields: Vec<u64> = text
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<_, _>>()
            .ok()?;
        if fields.len() < 11 {
            return None;
        }
        let at = |i: usize| fields.get(i).copied().unwrap_or(0);

        Some(Self {
            read_ios: at(0),
            read_merges: at(1),
            read_sectors: at(2),
            read_ticks_ms: at(3),
            write_ios: at(4),
            write_merges: at(5),
            write_sectors: at(6),
            write_ticks_ms: at(7),
            in_flight: at(8),
            io_ticks_ms: at(9),
            time_in_queue_ms: at(10),
            discard_ios: at(11),
            discard_merges: at(12),
            discard_sectors: at(13),
            discard_ticks_ms: at(14),
            flush_ios: at(15),
            flush_ticks_ms: at(16),
        })
    }

    pub fn bytes_read(&self) -> SizeValue {
        SizeValue::from_sectors(self.read_sectors)
    }

    pub fn bytes_written(&self) -> SizeValue {
        SizeValue::from_sectors(self.write_sectors)
    }
}

/// Serializable snapshot of a classified block device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDeviceInfo {
    pub identity: DeviceIdentity,
    pub kind: DeviceKind,
    pub size: SizeValue,
    pub removable: bool,
    pub read_only: bool,
    pub holders: Vec<String>,
    pub slaves: Vec<String>,

    /// Device-mapper name, for dm and multipath devices.
    pub dm_name: Option<String>,
    pub dm_uuid: Option<String>,
    /// Backing file of a loop device.
    pub backing_file: Option<String>,
    /// SCSI address, for SCSI disks.
    pub hbtl: Option<Hbtl>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_legacy_and_current_stat_layouts() {
        let legacy = "  4562   120  351022  1830   9103  4410 220114  9912  0  7120  11742";
        let stats = BlockStats::parse(legacy).unwrap();
        assert_eq!(stats.read_ios, 4562);
        assert_eq!(stats.write_sectors, 220114);
        assert_eq!(stats.discard_ios, 0);
        assert_eq!(stats.bytes_read().bytes(), 351022 * 512);

        let current = "1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17";
        let stats = BlockStats::parse(current).unwrap();
        assert_eq!(stats.flush_ticks_ms, 17);
        assert_eq!(stats.discard_sectors, 14);
    }

    #[test]
    fn rejects_short_or_garbled_stat() {
        assert!(BlockStats::parse("1 2 3").is_none());
        assert!(BlockStats::parse("1 2 3 4 5 6 7 8 9 10 x").is_none());
    }
}
