// SPDX-License-Identifier: GPL-3.0-only

//! Boundary to the privileged command line tools (`mdadm`, `multipathd`,
//! `lvm`, `losetup`, `dmsetup`).

use std::collections::VecDeque;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Result, SysError};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a failing exit status into [`SysError::ToolFailed`], keeping
    /// stderr verbatim.
    pub fn check(self, tool: &Path, operation: &str) -> Result<ToolOutput> {
        if self.is_success() {
            return Ok(self);
        }
        Err(SysError::ToolFailed {
            tool: tool.to_path_buf(),
            operation: operation.to_string(),
            exit_code: self.exit_code,
            stderr: self.stderr.trim_end().to_string(),
        })
    }
}

/// Runs an external program synchronously and captures its output.
pub trait ToolRunner: Send + Sync {
    fn run(&self, program: &Path, args: &[String], timeout: Duration) -> Result<ToolOutput>;
}

pub fn render_command(program: &Path, args: &[String]) -> String {
    let mut rendered = program.display().to_string();
    for arg in args {
        rendered.push(' ');
        if arg.is_empty() || arg.contains(char::is_whitespace) {
            rendered.push_str(&format!("{arg:?}"));
        } else {
            rendered.push_str(arg);
        }
    }
    rendered
}

/// Spawns the real programs through `duct`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ToolRunner for SystemRunner {
    fn run(&self, program: &Path, args: &[String], timeout: Duration) -> Result<ToolOutput> {
        if !program.is_absolute() || !program.exists() {
            return Err(SysError::ToolNotFound {
                tool: program.to_path_buf(),
            });
        }

        debug!(command = %render_command(program, args), ?timeout, "Executing tool");

        let handle = duct::cmd(program, args)
            .stdin_null()
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .start()
            .map_err(|e| SysError::io_at(program, e))?;

        let started = Instant::now();
        loop {
            if let Some(output) = handle.try_wait().map_err(|e| SysError::io_at(program, e))? {
                let exit_code = output
                    .status
                    .code()
                    .or_else(|| output.status.signal().map(|signal| 128 + signal))
                    .unwrap_or(-1);
                debug!(tool = %program.display(), exit_code, "Tool finished");
                return Ok(ToolOutput {
                    exit_code,
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                });
            }

            if started.elapsed() >= timeout {
                warn!(tool = %program.display(), ?timeout, "Tool timed out, killing it");
                if let Err(e) = handle.kill() {
                    warn!(tool = %program.display(), "Failed to kill timed out tool: {e}");
                }
                return Err(SysError::ToolTimeout {
                    tool: program.to_path_buf(),
                    timeout,
                });
            }

            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// One recorded call of a [`ScriptedRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
enum Reply {
    Output(ToolOutput),
    Timeout,
}

/// Runner answering from canned replies, for dry runs and tests.
///
/// A reply is selected by the longest registered argument prefix matching
/// the call; calls without a match succeed with empty output. A sequence of
/// replies is handed out in order, its last entry repeating. Every call is
/// recorded.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    replies: Mutex<Vec<(Vec<String>, VecDeque<Reply>)>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, args_prefix: &[&str], output: ToolOutput) -> &Self {
        self.push(args_prefix, VecDeque::from([Reply::Output(output)]))
    }

    pub fn reply_sequence(&self, args_prefix: &[&str], outputs: Vec<ToolOutput>) -> &Self {
        self.push(args_prefix, outputs.into_iter().map(Reply::Output).collect())
    }

    pub fn reply_timeout(&self, args_prefix: &[&str]) -> &Self {
        self.push(args_prefix, VecDeque::from([Reply::Timeout]))
    }

    fn push(&self, args_prefix: &[&str], queue: VecDeque<Reply>) -> &Self {
        let prefix: Vec<String> = args_prefix.iter().map(ToString::to_string).collect();
        let mut replies = self.replies.lock().unwrap_or_else(PoisonError::into_inner);
        replies.retain(|(existing, _)| existing != &prefix);
        replies.push((prefix, queue));
        self
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Argument vectors of all calls, joined by spaces.
    pub fn command_lines(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|call| call.args.join(" "))
            .collect()
    }
}

impl ToolRunner for ScriptedRunner {
    fn run(&self, program: &Path, args: &[String], timeout: Duration) -> Result<ToolOutput> {
        debug!(command = %render_command(program, args), "Scripted tool call");
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Invocation {
                program: program.to_path_buf(),
                args: args.to_vec(),
            });

        let mut replies = self.replies.lock().unwrap_or_else(PoisonError::into_inner);
        let reply = replies
            .iter_mut()
            .filter(|(prefix, _)| args.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .and_then(|(_, queue)| {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                }
            });

        match reply {
            Some(Reply::Output(output)) => Ok(output),
            Some(Reply::Timeout) => Err(SysError::ToolTimeout {
                tool: program.to_path_buf(),
                timeout,
            }),
            None => Ok(ToolOutput::default()),
        }
    }
}
