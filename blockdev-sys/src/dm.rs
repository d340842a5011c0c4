// SPDX-License-Identifier: GPL-3.0-only

//! Read-only device-mapper queries through `dmsetup`.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use blockdev_types::{DevNumber, SizeValue};
use serde::{Deserialize, Serialize};

use crate::config::BlockdevConfig;
use crate::error::{Result, SysError};
use crate::runner::ToolRunner;

const INFO_COLUMNS: &str = "name,major,minor,open,segments,uuid";

/// One line of `dmsetup table`: a segment of the mapped device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmTableLine {
    /// First sector of the segment.
    pub start: u64,
    /// Length in sectors.
    pub length: u64,
    /// Target type, e.g. `linear`, `multipath`, `crypt`.
    pub target: String,
    pub params: String,
}

impl DmTableLine {
    pub fn size(&self) -> SizeValue {
        SizeValue::from_sectors(self.length)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmInfo {
    pub name: String,
    pub dev: DevNumber,
    pub open_count: u32,
    pub segments: u32,
    pub uuid: Option<String>,
}

fn unexpected(detail: String) -> SysError {
    SysError::UnexpectedOutput {
        tool: "dmsetup".to_string(),
        detail,
    }
}

fn parse_table(output: &str) -> Result<Vec<DmTableLine>> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let mut fields = line.splitn(4, ' ');
            let (Some(start), Some(length), Some(target)) =
                (fields.next(), fields.next(), fields.next())
            else {
                return Err(unexpected(format!("short table line {line:?}")));
            };
            Ok(DmTableLine {
                start: start
                    .parse()
                    .map_err(|_| unexpected(format!("bad start in {line:?}")))?,
                length: length
                    .parse()
                    .map_err(|_| unexpected(format!("bad length in {line:?}")))?,
                target: target.to_string(),
                params: fields.next().unwrap_or_default().to_string(),
            })
        })
        .collect()
}

fn parse_info(output: &str) -> Result<Vec<DmInfo>> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.splitn(6, ':').collect();
            let [name, major, minor, open, segments, rest @ ..] = fields.as_slice() else {
                return Err(unexpected(format!("short info line {line:?}")));
            };
            let number = |value: &str| {
                value
                    .parse::<u32>()
                    .map_err(|_| unexpected(format!("bad number {value:?} in {line:?}")))
            };
            Ok(DmInfo {
                name: name.to_string(),
                dev: DevNumber::new(number(*major)?, number(*minor)?),
                open_count: number(*open)?,
                segments: number(*segments)?,
                uuid: rest
                    .first()
                    .filter(|uuid| !uuid.is_empty())
                    .map(|uuid| uuid.to_string()),
            })
        })
        .collect()
}

/// Names from `dmsetup ls`; `No devices found` yields an empty list.
fn parse_ls(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && *line != "No devices found")
        .filter_map(|line| line.split_whitespace().next())
        .map(ToString::to_string)
        .collect()
}

pub struct DmSetup {
    runner: Arc<dyn ToolRunner>,
    dmsetup: PathBuf,
    tool_timeout: Duration,
}

impl fmt::Debug for DmSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmSetup")
            .field("dmsetup", &self.dmsetup)
            .finish_non_exhaustive()
    }
}

impl DmSetup {
    pub fn new(config: &BlockdevConfig, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            runner,
            dmsetup: config.tools.dmsetup.clone(),
            tool_timeout: config.tools.timeout(),
        }
    }

    fn query(&self, args: &[&str], operation: &str) -> Result<String> {
        let args: Vec<String> = args.iter().map(ToString::to_string).collect();
        let output = self.runner.run(&self.dmsetup, &args, self.tool_timeout)?;
        if !output.is_success() && output.stderr.contains("No such device") {
            return Err(SysError::DeviceNotFound(args.last().cloned().unwrap_or_default()));
        }
        Ok(output.check(&self.dmsetup, operation)?.stdout)
    }

    pub fn names(&self) -> Result<Vec<String>> {
        Ok(parse_ls(&self.query(&["ls"], "list dm devices")?))
    }

    pub fn table(&self, name: &str) -> Result<Vec<DmTableLine>> {
        parse_table(&self.query(&["table", name], "read dm table")?)
    }

    pub fn info(&self, name: &str) -> Result<DmInfo> {
        parse_info(&self.query(
            &[
                "info",
                "-c",
                "--noheadings",
                "--separator",
                ":",
                "-o",
                INFO_COLUMNS,
                name,
            ],
            "read dm info",
        )?)?
        .into_iter()
        .next()
        .ok_or_else(|| SysError::DeviceNotFound(name.to_string()))
    }
}
