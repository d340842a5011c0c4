// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;
use std::time::Duration;

use blockdev_types::{MdUuid, ParseError, RaidLevel};
use thiserror::Error;

/// Error types for system-level operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on {path}: {source}")]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("MD array not found: {0}")]
    ArrayNotFound(String),

    #[error("Device {name} is claimed by several classification rules: {}", kinds.join(", "))]
    ClassificationAmbiguous {
        name: String,
        kinds: Vec<&'static str>,
    },

    #[error("Timed out after {waited:?} waiting for lock {name} (held by pid {holder:?})")]
    LockTimeout {
        name: String,
        waited: Duration,
        holder: Option<u32>,
    },

    #[error("Race detected while reclaiming stale lock {name}: {detail}")]
    RaceDetected { name: String, detail: String },

    #[error("Lock {name} is no longer owned by this process")]
    LockStolen { name: String },

    #[error("{level} needs at least {required} members, got {given}")]
    InsufficientMembers {
        level: RaidLevel,
        required: usize,
        given: usize,
    },

    #[error("Could not take the mdadm lock for array {uuid} within {timeout:?}")]
    AssembleTimeout { uuid: MdUuid, timeout: Duration },

    #[error("Assembling array {uuid} failed: {diagnostic}")]
    AssembleFailed { uuid: MdUuid, diagnostic: String },

    #[error("Array {array} did not finish resync within {deadline:?}")]
    SyncTimeout { array: String, deadline: Duration },

    #[error("Tool not found: {}", tool.display())]
    ToolNotFound { tool: PathBuf },

    #[error("{} did not finish within {timeout:?}", tool.display())]
    ToolTimeout { tool: PathBuf, timeout: Duration },

    #[error("{operation} failed ({} exited with {exit_code}): {stderr}", tool.display())]
    ToolFailed {
        tool: PathBuf,
        operation: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Unexpected output from {tool}: {detail}")]
    UnexpectedOutput { tool: String, detail: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Coarse classification of [`SysError`] used to pick a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The device, array or path does not exist.
    NotFound,
    /// A lock, sync wait or tool invocation ran out of time.
    Timeout,
    /// Rejected before anything was executed.
    InvalidInput,
    /// An external tool ran and reported failure.
    ToolFailure,
    /// Lost a stale lock reclaim against another process.
    RaceDetected,
    Cancelled,
    Io,
}

impl SysError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SysError::DeviceNotFound(_)
            | SysError::ArrayNotFound(_)
            | SysError::ToolNotFound { .. } => ErrorKind::NotFound,

            SysError::LockTimeout { .. }
            | SysError::AssembleTimeout { .. }
            | SysError::SyncTimeout { .. }
            | SysError::ToolTimeout { .. } => ErrorKind::Timeout,

            SysError::Parse(_)
            | SysError::InsufficientMembers { .. }
            | SysError::ClassificationAmbiguous { .. }
            | SysError::InvalidArgument(_)
            | SysError::Config(_) => ErrorKind::InvalidInput,

            SysError::ToolFailed { .. }
            | SysError::AssembleFailed { .. }
            | SysError::UnexpectedOutput { .. } => ErrorKind::ToolFailure,

            SysError::RaceDetected { .. } | SysError::LockStolen { .. } => {
                ErrorKind::RaceDetected
            }

            SysError::Cancelled => ErrorKind::Cancelled,

            SysError::Io(_) | SysError::IoAt { .. } => ErrorKind::Io,
        }
    }

    /// Whether a caller may sensibly retry the same operation later.
    /// Nothing in this crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::RaceDetected)
    }

    pub(crate) fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SysError::IoAt {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for system operations
pub type Result<T> = std::result::Result<T, SysError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_retry_policy() {
        let err = SysError::LockTimeout {
            name: "mdadm".into(),
            waited: Duration::from_secs(15),
            holder: Some(42),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_retryable());

        let err = SysError::from(ParseError::InvalidHbtl("1:2".into()));
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(!err.is_retryable());

        let err = SysError::ToolFailed {
            tool: PathBuf::from("/sbin/mdadm"),
            operation: "stop md0".into(),
            exit_code: 1,
            stderr: "mdadm: Cannot get exclusive access".into(),
        };
        assert_eq!(err.kind(), ErrorKind::ToolFailure);
        assert!(err.to_string().contains("Cannot get exclusive access"));

        let err = SysError::RaceDetected {
            name: "lvm".into(),
            detail: "lock changed during reclaim".into(),
        };
        assert!(err.is_retryable());
    }
}
