// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;

use serde::{Deserialize, Serialize};

/// Health of one SCSI path below a multipath map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathState {
    Active,
    Failed,
    /// Reachable, but only through a passive (standby) port.
    Ghost,
}

impl PathState {
    /// Derive the path state from the three columns multipathd reports:
    /// device-mapper state (`%t`), checker state (`%T`) and the SCSI device
    /// state (`%o`).
    ///
    /// A path counts as active only when device-mapper uses it and neither
    /// the checker nor the SCSI layer report a fault.
    pub fn from_multipathd(dm_state: &str, checker_state: &str, device_state: &str) -> Self {
        let dm_state = dm_state.trim().to_ascii_lowercase();
        let checker_state = checker_state.trim().to_ascii_lowercase();
        let device_state = device_state.trim().to_ascii_lowercase();

        if checker_state == "ghost" {
            return PathState::Ghost;
        }
        let checker_fault = matches!(checker_state.as_str(), "faulty" | "shaky");
        let device_fault = matches!(device_state.as_str(), "offline" | "blocked" | "transport-offline");
        if dm_state == "active" && !checker_fault && !device_fault {
            PathState::Active
        } else {
            PathState::Failed
        }
    }
}

impl fmt::Display for PathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PathState::Active => "active",
            PathState::Failed => "failed",
            PathState::Ghost => "ghost",
        })
    }
}

/// State of a multipath map, derived from its paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultipathState {
    Active,
    Degraded,
    Failed,
}

impl MultipathState {
    /// Every path active gives `Active`, a mix of active and failed/ghost
    /// paths gives `Degraded`, no active path at all (including an empty
    /// set) gives `Failed`.
    pub fn aggregate<I>(states: I) -> Self
    where
        I: IntoIterator<Item = PathState>,
    {
        let (mut active, mut inactive) = (0usize, 0usize);
        for state in states {
            match state {
                PathState::Active => active += 1,
                PathState::Failed | PathState::Ghost => inactive += 1,
            }
        }

        match (active, inactive) {
            (0, _) => MultipathState::Failed,
            (_, 0) => MultipathState::Active,
            _ => MultipathState::Degraded,
        }
    }
}

impl fmt::Display for MultipathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MultipathState::Active => "active",
            MultipathState::Degraded => "degraded",
            MultipathState::Failed => "failed",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::PathState::*;
    use super::*;

    #[test]
    fn aggregate_scenarios() {
        assert_eq!(MultipathState::aggregate([Active, Active]), MultipathState::Active);
        assert_eq!(MultipathState::aggregate([Active, Failed]), MultipathState::Degraded);
        assert_eq!(MultipathState::aggregate([Active, Ghost]), MultipathState::Degraded);
        assert_eq!(MultipathState::aggregate([Failed, Ghost]), MultipathState::Failed);
        assert_eq!(MultipathState::aggregate([]), MultipathState::Failed);
    }

    #[test]
    fn multipathd_columns_map_to_path_state() {
        assert_eq!(PathState::from_multipathd("active", "ready", "running"), Active);
        assert_eq!(PathState::from_multipathd("failed", "faulty", "running"), Failed);
        assert_eq!(PathState::from_multipathd("active", "ready", "offline"), Failed);
        assert_eq!(PathState::from_multipathd("active", "ghost", "running"), Ghost);
        assert_eq!(PathState::from_multipathd("undef", "undef", "unknown"), Failed);
    }
}
