// SPDX-License-Identifier: GPL-3.0-only

//! Multipath maps and their SCSI paths, as reported by `multipathd`.

mod device;
mod system;

pub use device::{LostPath, MultipathDevice, MultipathPath};
pub use system::{MapEntry, MultipathSystem, PATHS_FORMAT, PathEntry, PathMember};
