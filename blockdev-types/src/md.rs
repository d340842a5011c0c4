// SPDX-License-Identifier: GPL-3.0-only

//! Value types describing MD RAID arrays.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ParseError, Result};

/// 128-bit array UUID in the `xxxxxxxx:xxxxxxxx:xxxxxxxx:xxxxxxxx` form
/// used by mdadm.
///
/// Parsing accepts any mix of case and `:`/`-` separators as long as exactly
/// 32 hex digits remain; [`Display`](fmt::Display) always emits the
/// canonical lowercase form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MdUuid([u8; 16]);

impl MdUuid {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Canonicalize any accepted UUID spelling.
    pub fn canonicalize(input: &str) -> Result<String> {
        input.parse::<MdUuid>().map(|uuid| uuid.to_string())
    }

    /// True if `input` is already in the mdadm form (case-insensitive).
    pub fn is_md_form(input: &str) -> bool {
        let groups: Vec<&str> = input.split(':').collect();
        groups.len() == 4
            && groups
                .iter()
                .all(|g| g.len() == 8 && g.bytes().all(|b| b.is_ascii_hexdigit()))
    }

    /// The same 128 bits as an RFC 4122 UUID.
    pub fn to_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.0)
    }
}

impl From<Uuid> for MdUuid {
    fn from(value: Uuid) -> Self {
        Self(*value.as_bytes())
    }
}

impl From<MdUuid> for Uuid {
    fn from(value: MdUuid) -> Self {
        value.to_uuid()
    }
}

impl FromStr for MdUuid {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ParseError::InvalidMdUuid(s.to_string());
        let mut bytes = [0u8; 16];
        let mut nibbles = 0usize;

        for c in s.trim().chars() {
            if c == ':' || c == '-' {
                continue;
            }
            let value = c.to_digit(16).ok_or_else(invalid)? as u8;
            if nibbles == 32 {
                return Err(invalid());
            }
            let byte = &mut bytes[nibbles / 2];
            *byte = (*byte << 4) | value;
            nibbles += 1;
        }

        if nibbles != 32 {
            return Err(invalid());
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for MdUuid {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MdUuid> for String {
    fn from(value: MdUuid) -> Self {
        value.to_string()
    }
}

impl fmt::Display for MdUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, chunk) in self.0.chunks(4).enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            for byte in chunk {
                write!(f, "{byte:02x}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaidLevel {
    Linear,
    Raid0,
    Raid1,
    Raid4,
    Raid5,
    Raid6,
    Raid10,
}

impl RaidLevel {
    /// Name passed to `mdadm --level`.
    pub fn as_str(self) -> &'static str {
        match self {
            RaidLevel::Linear => "linear",
            RaidLevel::Raid0 => "raid0",
            RaidLevel::Raid1 => "raid1",
            RaidLevel::Raid4 => "raid4",
            RaidLevel::Raid5 => "raid5",
            RaidLevel::Raid6 => "raid6",
            RaidLevel::Raid10 => "raid10",
        }
    }

    /// Smallest member count mdadm accepts for the level without `--force`.
    pub fn min_members(self) -> usize {
        match self {
            RaidLevel::Linear => 1,
            RaidLevel::Raid0 | RaidLevel::Raid1 | RaidLevel::Raid10 => 2,
            RaidLevel::Raid4 | RaidLevel::Raid5 => 3,
            RaidLevel::Raid6 => 4,
        }
    }

    pub fn is_redundant(self) -> bool {
        !matches!(self, RaidLevel::Linear | RaidLevel::Raid0)
    }
}

impl FromStr for RaidLevel {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "linear" => Ok(RaidLevel::Linear),
            "raid0" | "0" | "stripe" => Ok(RaidLevel::Raid0),
            "raid1" | "1" | "mirror" => Ok(RaidLevel::Raid1),
            "raid4" | "4" => Ok(RaidLevel::Raid4),
            "raid5" | "5" => Ok(RaidLevel::Raid5),
            "raid6" | "6" => Ok(RaidLevel::Raid6),
            "raid10" | "10" => Ok(RaidLevel::Raid10),
            _ => Err(ParseError::InvalidRaidLevel(s.to_string())),
        }
    }
}

impl fmt::Display for RaidLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On-disk superblock version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetadataFormat {
    V0_90,
    V1_0,
    V1_1,
    V1_2,
    /// Let mdadm pick its compiled-in default.
    Default,
}

impl MetadataFormat {
    /// Value passed to `mdadm --metadata`.
    pub fn as_str(self) -> &'static str {
        match self {
            MetadataFormat::V0_90 => "0.90",
            MetadataFormat::V1_0 => "1.0",
            MetadataFormat::V1_1 => "1.1",
            MetadataFormat::V1_2 => "1.2",
            MetadataFormat::Default => "default",
        }
    }
}

impl FromStr for MetadataFormat {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "0" | "0.90" => Ok(MetadataFormat::V0_90),
            "1" | "1.0" => Ok(MetadataFormat::V1_0),
            "1.1" => Ok(MetadataFormat::V1_1),
            "1.2" => Ok(MetadataFormat::V1_2),
            "default" => Ok(MetadataFormat::Default),
            _ => Err(ParseError::InvalidMetadataFormat(s.to_string())),
        }
    }
}

impl fmt::Display for MetadataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// mdadm operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MdadmMode {
    Assemble,
    Build,
    Create,
    Monitor,
    Grow,
    Incremental,
    AutoDetect,
    /// Changes to an already running array; mdadm takes no mode flag.
    Manage,
}

impl MdadmMode {
    pub fn flag(self) -> Option<&'static str> {
        match self {
            MdadmMode::Assemble => Some("--assemble"),
            MdadmMode::Build => Some("--build"),
            MdadmMode::Create => Some("--create"),
            MdadmMode::Monitor => Some("--monitor"),
            MdadmMode::Grow => Some("--grow"),
            MdadmMode::Incremental => Some("--incremental"),
            MdadmMode::AutoDetect => Some("--auto-detect"),
            MdadmMode::Manage => None,
        }
    }
}

/// Resync progress as reported by `md/sync_completed` (in sectors).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    completed: u64,
    total: u64,
}

impl SyncProgress {
    /// `None` unless `completed <= total`.
    pub fn new(completed: u64, total: u64) -> Option<Self> {
        (completed <= total).then_some(Self { completed, total })
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Completed share in `[0, 1]`; an empty total counts as done.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }

    /// Parse the `<done> / <total>` text of `md/sync_completed`.
    /// Returns `Ok(None)` for `none`. The kernel can briefly report more
    /// done than total at the end of a pass; that reads as complete.
    pub fn parse_sync_completed(text: &str) -> Result<Option<Self>> {
        let trimmed = text.trim();
        if trimmed == "none" || trimmed.is_empty() {
            return Ok(None);
        }
        let invalid = || ParseError::InvalidSyncProgress(trimmed.to_string());
        let (done, total) = trimmed.split_once('/').ok_or_else(invalid)?;
        let done: u64 = done.trim().parse().map_err(|_| invalid())?;
        let total: u64 = total.trim().parse().map_err(|_| invalid())?;
        Self::new(done.min(total), total).map(Some).ok_or_else(invalid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveState {
    Syncing,
    Clean,
    Degraded,
}

/// Lifecycle of an array as seen from this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MdState {
    Absent,
    Assembling,
    Active(ActiveState),
    Stopped,
}

impl MdState {
    pub fn is_active(&self) -> bool {
        matches!(self, MdState::Active(_))
    }
}
