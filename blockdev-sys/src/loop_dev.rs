// SPDX-License-Identifier: GPL-3.0-only

//! Loop devices through `losetup`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::info;

use crate::config::BlockdevConfig;
use crate::error::{Result, SysError};
use crate::runner::ToolRunner;
use crate::sysfs::Sysfs;

/// One entry of `losetup --list --json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopInfo {
    /// Device node, e.g. `/dev/loop0`.
    pub name: String,
    #[serde(rename = "back-file", default)]
    pub back_file: Option<PathBuf>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub offset: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub sizelimit: u64,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub autoclear: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub ro: bool,
}

#[derive(Debug, Deserialize)]
struct LoopList {
    #[serde(default)]
    loopdevices: Vec<LoopInfo>,
}

// Older util-linux releases print numbers and flags as strings.
fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom(format!("expected unsigned integer, got {n}"))),
        Value::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
        Value::Null => Ok(0),
        other => Err(serde::de::Error::custom(format!("expected integer, got {other}"))),
    }
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Bool(b) => Ok(b),
        Value::Number(n) => Ok(n.as_u64().is_some_and(|n| n != 0)),
        Value::String(s) => Ok(matches!(s.trim(), "1" | "true")),
        Value::Null => Ok(false),
        other => Err(serde::de::Error::custom(format!("expected flag, got {other}"))),
    }
}

fn parse_list(output: &str) -> Result<Vec<LoopInfo>> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str::<LoopList>(output)
        .map(|list| list.loopdevices)
        .map_err(|e| SysError::UnexpectedOutput {
            tool: "losetup".to_string(),
            detail: e.to_string(),
        })
}

/// Attach, detach and list loop devices. Loop setup is atomic in the
/// kernel (`LOOP_CTL_GET_FREE`), so no admin lock is taken.
pub struct LoopAdmin {
    runner: Arc<dyn ToolRunner>,
    sysfs: Sysfs,
    losetup: PathBuf,
    dev_root: PathBuf,
    tool_timeout: Duration,
}

impl fmt::Debug for LoopAdmin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopAdmin")
            .field("losetup", &self.losetup)
            .finish_non_exhaustive()
    }
}

impl LoopAdmin {
    pub fn new(config: &BlockdevConfig, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            runner,
            sysfs: Sysfs::new(&config.sysfs_root),
            losetup: config.tools.losetup.clone(),
            dev_root: config.dev_root.clone(),
            tool_timeout: config.tools.timeout(),
        }
    }

    fn run(&self, args: &[String], operation: &str) -> Result<String> {
        let output = self
            .runner
            .run(&self.losetup, args, self.tool_timeout)?
            .check(&self.losetup, operation)?;
        Ok(output.stdout)
    }

    /// Attach `file` to the first free loop device and return its node.
    pub fn attach(&self, file: &Path, read_only: bool) -> Result<PathBuf> {
        if !file.is_absolute() {
            return Err(SysError::InvalidArgument(format!(
                "backing file {} is not an absolute path",
                file.display()
            )));
        }
        let mut args = vec!["--find".to_string(), "--show".to_string()];
        if read_only {
            args.push("--read-only".to_string());
        }
        args.push(file.display().to_string());

        let stdout = self.run(&args, "attach loop device")?;
        let node = stdout.trim();
        if node.is_empty() {
            return Err(SysError::UnexpectedOutput {
                tool: "losetup".to_string(),
                detail: "no device printed by --show".to_string(),
            });
        }
        info!(device = node, file = %file.display(), "Attached loop device");
        Ok(PathBuf::from(node))
    }

    /// Detach `device`, given as `loop3` or `/dev/loop3`.
    pub fn detach(&self, device: &str) -> Result<()> {
        let node = self.node(device)?;
        self.run(&["--detach".to_string(), node.display().to_string()], "detach loop device")?;
        info!(device = %node.display(), "Detached loop device");
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<LoopInfo>> {
        parse_list(&self.run(&["--list".to_string(), "--json".to_string()], "list loop devices")?)
    }

    /// Backing file as the kernel reports it, `None` for an unbound device.
    pub fn backing_file(&self, name: &str) -> Result<Option<PathBuf>> {
        Ok(self
            .sysfs
            .read_attr(&self.sysfs.block_dir(name).join("loop/backing_file"))?
            .filter(|file| !file.is_empty())
            .map(PathBuf::from))
    }

    fn node(&self, device: &str) -> Result<PathBuf> {
        let name = Path::new(device)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(device);
        if !name.starts_with("loop") || name[4..].parse::<u32>().is_err() {
            return Err(SysError::InvalidArgument(format!("{device} is not a loop device")));
        }
        Ok(self.dev_root.join(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{ScriptedRunner, ToolOutput};
    use std::fs;

    #[test]
    fn parses_current_and_legacy_json() {
        let current = parse_list(
            r#"{"loopdevices": [
                {"name":"/dev/loop0","sizelimit":0,"offset":0,"autoclear":true,"ro":false,"back-file":"/var/lib/images/disk.img","dio":false,"log-sec":512},
                {"name":"/dev/loop1","sizelimit":0,"offset":1048576,"autoclear":false,"ro":true,"back-file":null,"dio":false,"log-sec":512}
            ]}"#,
        )
        .unwrap();
        assert_eq!(current.len(), 2);
        assert!(current[0].autoclear);
        assert_eq!(
            current[0].back_file.as_deref(),
            Some(Path::new("/var/lib/images/disk.img"))
        );
        assert_eq!(current[1].offset, 1_048_576);
        assert!(current[1].ro);
        assert_eq!(current[1].back_file, None);

        let legacy = parse_list(
            r#"{"loopdevices": [{"name":"/dev/loop2","sizelimit":"0","offset":"512","autoclear":"1","ro":"0","back-file":"/tmp/x (deleted)"}]}"#,
        )
        .unwrap();
        assert_eq!(legacy[0].offset, 512);
        assert!(legacy[0].autoclear);
        assert!(!legacy[0].ro);

        assert!(parse_list("").unwrap().is_empty());
        assert!(matches!(
            parse_list("not json"),
            Err(SysError::UnexpectedOutput { .. })
        ));
    }

    #[test]
    fn attach_and_detach_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BlockdevConfig::default();
        config.sysfs_root = dir.path().to_path_buf();
        let runner = Arc::new(ScriptedRunner::new());
        runner.reply(&["--find"], ToolOutput::success("/dev/loop4\n"));
        let losetup = LoopAdmin::new(&config, runner.clone());

        let node = losetup
            .attach(Path::new("/var/lib/images/disk.img"), true)
            .unwrap();
        assert_eq!(node, Path::new("/dev/loop4"));
        losetup.detach("loop4").unwrap();
        assert!(matches!(
            losetup.detach("sda"),
            Err(SysError::InvalidArgument(_))
        ));
        assert!(losetup.attach(Path::new("disk.img"), false).is_err());

        assert_eq!(
            runner.command_lines(),
            [
                "--find --show --read-only /var/lib/images/disk.img",
                "--detach /dev/loop4"
            ]
        );

        let loop_dir = dir.path().join("class/block/loop4/loop");
        fs::create_dir_all(&loop_dir).unwrap();
        fs::write(loop_dir.join("backing_file"), "/var/lib/images/disk.img\n").unwrap();
        assert_eq!(
            losetup.backing_file("loop4").unwrap().as_deref(),
            Some(Path::new("/var/lib/images/disk.img"))
        );
        assert_eq!(losetup.backing_file("loop5").unwrap(), None);
    }
}
