// SPDX-License-Identifier: GPL-3.0-only

//! Linux software RAID: discovery, live state and `mdadm` administration.

mod admin;
mod array;

pub use admin::MdAdmin;
pub use array::{MdArray, poll_until_synced};

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use blockdev_types::MdUuid;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One running array as reported by `mdadm --detail --scan` and
/// `/proc/mdstat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdArraySummary {
    /// Device path from the ARRAY line, e.g. `/dev/md0` or `/dev/md/data`.
    pub device: String,
    pub name: Option<String>,
    pub uuid: Option<MdUuid>,
    pub metadata: Option<String>,
    pub level: Option<String>,
    /// Kernel names of the member devices.
    pub members: Vec<String>,
    pub active: bool,
    pub degraded: bool,
}

#[derive(Debug, Clone)]
struct ScanLine {
    device: String,
    name: Option<String>,
    uuid: Option<MdUuid>,
    metadata: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct MdstatEntry {
    active: bool,
    level: Option<String>,
    members: Vec<String>,
    degraded: bool,
}

fn parse_mdadm_scan(output: &str) -> Vec<ScanLine> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let mut parts = line.strip_prefix("ARRAY ")?.split_whitespace();
            let device = parts.next()?.to_string();

            let mut scan = ScanLine {
                device,
                name: None,
                uuid: None,
                metadata: None,
            };
            for token in parts {
                if let Some(value) = token.strip_prefix("name=") {
                    scan.name = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("UUID=") {
                    match value.parse() {
                        Ok(uuid) => scan.uuid = Some(uuid),
                        Err(e) => debug!(device = %scan.device, "Ignoring ARRAY uuid: {e}"),
                    }
                } else if let Some(value) = token.strip_prefix("metadata=") {
                    scan.metadata = Some(value.to_string());
                }
            }
            Some(scan)
        })
        .collect()
}

fn parse_proc_mdstat(output: &str) -> HashMap<String, MdstatEntry> {
    let mut map = HashMap::new();
    let mut current: Option<String> = None;

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("Personalities") || line.starts_with("unused") {
            current = None;
            continue;
        }

        if let Some((array, rest)) = line.split_once(" : ")
            && array.starts_with("md")
        {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            let level = parts
                .iter()
                .find(|part| part.starts_with("raid") || **part == "linear")
                .map(|part| (*part).to_string());
            let members = parts
                .iter()
                .filter(|part| part.contains('[') && part.contains(']'))
                .filter_map(|part| part.split('[').next())
                .map(ToString::to_string)
                .collect();

            map.insert(
                array.to_string(),
                MdstatEntry {
                    active: parts.first() == Some(&"active"),
                    level,
                    members,
                    degraded: false,
                },
            );
            current = Some(array.to_string());
            continue;
        }

        // `[2/1] [U_]`: an underscore marks a missing member.
        if let Some(array) = current.as_ref()
            && let Some(status) = line.rsplit(' ').next()
            && status.starts_with('[')
            && status.ends_with(']')
            && line.contains('/')
            && let Some(entry) = map.get_mut(array)
        {
            entry.degraded = status.contains('_');
        }
    }

    map
}

/// Kernel name behind an ARRAY device path. `/dev/mdN` maps directly,
/// named arrays (`/dev/md/data`) are resolved through their symlink below
/// `dev_root`.
fn kernel_name(device: &str, dev_root: &Path) -> String {
    let relative = device.strip_prefix("/dev/").unwrap_or(device);
    let node = dev_root.join(relative.trim_start_matches('/'));
    let resolved = fs::read_link(&node).unwrap_or(node);
    resolved
        .file_name()
        .and_then(|name| name.to_str())
        .map(ToString::to_string)
        .unwrap_or_else(|| device.to_string())
}

fn merge(
    scan: Vec<ScanLine>,
    mdstat: &HashMap<String, MdstatEntry>,
    dev_root: &Path,
) -> Vec<MdArraySummary> {
    scan.into_iter()
        .map(|line| {
            let entry = mdstat
                .get(&kernel_name(&line.device, dev_root))
                .cloned()
                .unwrap_or_default();
            MdArraySummary {
                device: line.device,
                name: line.name,
                uuid: line.uuid,
                metadata: line.metadata,
                level: entry.level,
                members: entry.members,
                active: entry.active,
                degraded: entry.degraded,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MDSTAT: &str = "Personalities : [raid1] [raid6] [raid5] [raid4]\n\
        md0 : active raid1 sdb1[1] sda1[0]\n      976630336 blocks super 1.2 [2/2] [UU]\n\n\
        md1 : active raid5 sde[3] sdd[1] sdc[0](F)\n      1953260544 blocks super 1.2 level 5, 512k chunk, algorithm 2 [3/2] [_UU]\n      \
        [==>..................]  recovery = 12.6% (123/976) finish=10.1min speed=100K/sec\n\n\
        md2 : inactive sdf[0](S)\n      976630336 blocks super 1.2\n\n\
        unused devices: <none>\n";

    #[test]
    fn parses_mdadm_scan_rows() {
        let parsed = parse_mdadm_scan(
            "ARRAY /dev/md0 metadata=1.2 name=host:0 UUID=0e8ce27f:1c3b5b7e:6d8e2a41:c2a0a5f1\n\
             ARRAY /dev/md/data UUID=bogus\nINACTIVE-ARRAY /dev/md2\n",
        );

        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].device, "/dev/md0");
        assert_eq!(parsed[0].name.as_deref(), Some("host:0"));
        assert_eq!(parsed[0].metadata.as_deref(), Some("1.2"));
        assert_eq!(
            parsed[0].uuid.map(|u| u.to_string()).as_deref(),
            Some("0e8ce27f:1c3b5b7e:6d8e2a41:c2a0a5f1")
        );
        assert_eq!(parsed[1].uuid, None);
    }

    #[test]
    fn parses_proc_mdstat_state() {
        let parsed = parse_proc_mdstat(MDSTAT);

        let md0 = &parsed["md0"];
        assert!(md0.active);
        assert_eq!(md0.level.as_deref(), Some("raid1"));
        assert_eq!(md0.members, ["sdb1", "sda1"]);
        assert!(!md0.degraded);

        let md1 = &parsed["md1"];
        assert_eq!(md1.level.as_deref(), Some("raid5"));
        assert_eq!(md1.members, ["sde", "sdd", "sdc"]);
        assert!(md1.degraded);

        let md2 = &parsed["md2"];
        assert!(!md2.active);
        assert_eq!(md2.level, None);
        assert_eq!(md2.members, ["sdf"]);
    }

    #[test]
    fn merges_scan_with_mdstat() {
        let summaries = merge(
            parse_mdadm_scan("ARRAY /dev/md1 metadata=1.2 name=host:1\nARRAY /dev/md9\n"),
            &parse_proc_mdstat(MDSTAT),
            Path::new("/nonexistent/dev"),
        );

        assert_eq!(summaries.len(), 2);
        assert!(summaries[0].active);
        assert!(summaries[0].degraded);
        assert_eq!(summaries[0].level.as_deref(), Some("raid5"));
        assert!(!summaries[1].active);
        assert!(summaries[1].members.is_empty());
    }

    #[test]
    fn named_arrays_resolve_below_dev_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("md")).unwrap();
        std::os::unix::fs::symlink("../md1", dir.path().join("md/data")).unwrap();

        assert_eq!(kernel_name("/dev/md/data", dir.path()), "md1");
        assert_eq!(kernel_name("/dev/md0", dir.path()), "md0");
        assert_eq!(kernel_name("/dev/md/gone", dir.path()), "gone");

        let summaries = merge(
            parse_mdadm_scan("ARRAY /dev/md/data metadata=1.2 name=host:data\n"),
            &parse_proc_mdstat(MDSTAT),
            dir.path(),
        );
        assert_eq!(summaries[0].device, "/dev/md/data");
        assert_eq!(summaries[0].level.as_deref(), Some("raid5"));
        assert!(summaries[0].degraded);
    }
}
