// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

/// Rejections of malformed input, raised before anything touches the system.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid size {input:?}: {reason}")]
    UnitFormat { input: String, reason: String },

    #[error("{bytes} bytes is not a multiple of the 512 byte sector size")]
    NotSectorAligned { bytes: u128 },

    #[error("{bytes} bytes does not fit into a 64 bit sector count")]
    SectorOverflow { bytes: u128 },

    #[error("could not interpret {0:?} as a SCSI HBTL address")]
    InvalidHbtl(String),

    #[error("could not interpret {0:?} as an MD array UUID")]
    InvalidMdUuid(String),

    #[error("unsupported RAID level {0:?}")]
    InvalidRaidLevel(String),

    #[error("unsupported MD metadata format {0:?}")]
    InvalidMetadataFormat(String),

    #[error("unexpected sync progress {0:?}")]
    InvalidSyncProgress(String),

    #[error("invalid major:minor device number {0:?}")]
    InvalidDevNumber(String),

    #[error("invalid block device name {0:?}")]
    InvalidDeviceName(String),
}

pub type Result<T> = std::result::Result<T, ParseError>;
