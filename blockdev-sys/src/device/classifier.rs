// SPDX-License-Identifier: GPL-3.0-only

//! Decide which [`BlockDevice`] variant a device is.
//!
//! Rules are tried in the order of [`RULES`]. Multipath comes before plain
//! device-mapper because every multipath map is also a dm device; the
//! generic variant is the catch-all and never appears in the list.

use std::path::PathBuf;

use blockdev_types::{DeviceIdentity, DeviceKind, Hbtl};
use tracing::debug;

use super::{
    BlockDevice, DeviceBase, DmDevice, GenericDevice, IdentityResolver, LoopDevice, MdDevice,
    MultipathMap, ScsiDisk,
};
use crate::error::{Result, SysError};
use crate::scsi::ScsiDeviceInfo;

const LOOP_MAJOR: u32 = 7;

/// A sysfs predicate claiming a device for one kind.
#[derive(Debug, Clone, Copy)]
pub struct ClassificationRule {
    pub kind: DeviceKind,
    pub applies: fn(&DeviceBase) -> Result<bool>,
}

pub const RULES: [ClassificationRule; 5] = [
    ClassificationRule {
        kind: DeviceKind::Multipath,
        applies: is_multipath,
    },
    ClassificationRule {
        kind: DeviceKind::DeviceMapper,
        applies: is_device_mapper,
    },
    ClassificationRule {
        kind: DeviceKind::Loop,
        applies: is_loop,
    },
    ClassificationRule {
        kind: DeviceKind::Md,
        applies: is_md,
    },
    ClassificationRule {
        kind: DeviceKind::Scsi,
        applies: is_scsi,
    },
];

/// Whether a device claimed by `outer` is necessarily also claimed by
/// `inner`, so both claiming it is expected.
pub fn subsumes(outer: DeviceKind, inner: DeviceKind) -> bool {
    outer == inner || (outer == DeviceKind::Multipath && inner == DeviceKind::DeviceMapper)
}

/// Split a multipath dm uuid into the optional partition number and WWID:
/// `mpath-<wwid>` or `part<N>-mpath-<wwid>`.
fn parse_multipath_uuid(uuid: &str) -> Option<(Option<u32>, &str)> {
    if let Some(wwid) = uuid.strip_prefix("mpath-") {
        return Some((None, wwid));
    }
    let rest = uuid.strip_prefix("part")?;
    let (number, wwid) = rest.split_once("-mpath-")?;
    let number = number.parse().ok()?;
    Some((Some(number), wwid))
}

fn is_multipath(base: &DeviceBase) -> Result<bool> {
    Ok(base
        .attr("dm/uuid")?
        .is_some_and(|uuid| parse_multipath_uuid(&uuid).is_some()))
}

fn is_device_mapper(base: &DeviceBase) -> Result<bool> {
    Ok(base.attr("dm/uuid")?.is_some() || base.attr("dm/name")?.is_some())
}

fn is_loop(base: &DeviceBase) -> Result<bool> {
    Ok(base.identity().dev.major == LOOP_MAJOR || base.dir().join("loop/backing_file").exists())
}

fn is_md(base: &DeviceBase) -> Result<bool> {
    Ok(base.dir().join("md").is_dir())
}

fn is_scsi(base: &DeviceBase) -> Result<bool> {
    Ok(base.dir().join("device/scsi_device").is_dir())
}

#[derive(Debug, Clone)]
pub struct DeviceClassifier {
    resolver: IdentityResolver,
    strict: bool,
}

impl DeviceClassifier {
    pub fn new(resolver: IdentityResolver) -> Self {
        Self {
            resolver,
            strict: false,
        }
    }

    /// In strict mode every rule is evaluated and a device claimed by two
    /// unrelated kinds is rejected.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    /// Resolve `spec` (name, `major:minor`, node or sysfs path) and classify it.
    pub fn classify_spec(&self, spec: &str) -> Result<BlockDevice> {
        let identity = self.resolver.resolve(spec)?;
        self.classify(&identity)
    }

    pub fn classify(&self, identity: &DeviceIdentity) -> Result<BlockDevice> {
        let base = DeviceBase::new(
            identity.clone(),
            self.resolver.sysfs().clone(),
            self.resolver.dev_root(),
        );
        if !base.exists() {
            return Err(SysError::DeviceNotFound(identity.name.clone()));
        }

        let claimed = if self.strict {
            let mut claims = Vec::new();
            for rule in &RULES {
                if (rule.applies)(&base)? {
                    claims.push(rule.kind);
                }
            }
            if let Some(first) = claims.first().copied()
                && claims.iter().any(|kind| !subsumes(first, *kind))
            {
                return Err(SysError::ClassificationAmbiguous {
                    name: identity.name.clone(),
                    kinds: claims.iter().map(|kind| kind.label()).collect(),
                });
            }
            claims.first().copied()
        } else {
            let mut found = None;
            for rule in &RULES {
                if (rule.applies)(&base)? {
                    found = Some(rule.kind);
                    break;
                }
            }
            found
        };
        let kind = claimed.unwrap_or(DeviceKind::Generic);

        debug!(device = %identity, %kind, "Classified device");
        build(kind, base)
    }
}

fn build(kind: DeviceKind, base: DeviceBase) -> Result<BlockDevice> {
    let device = match kind {
        DeviceKind::Multipath => {
            let dm_uuid = base
                .attr("dm/uuid")?
                .ok_or_else(|| SysError::DeviceNotFound(base.name().to_string()))?;
            let (partition, wwid) = parse_multipath_uuid(&dm_uuid)
                .map(|(partition, wwid)| (partition, wwid.to_string()))
                .unwrap_or((None, String::new()));
            BlockDevice::Multipath(MultipathMap {
                dm_name: base.attr("dm/name")?.unwrap_or_default(),
                dm_uuid,
                wwid,
                partition,
                base,
            })
        }
        DeviceKind::DeviceMapper => BlockDevice::DeviceMapper(DmDevice {
            dm_name: base.attr("dm/name")?,
            dm_uuid: base.attr("dm/uuid")?.filter(|uuid| !uuid.is_empty()),
            base,
        }),
        DeviceKind::Loop => BlockDevice::Loop(LoopDevice {
            backing_file: base
                .attr("loop/backing_file")?
                .filter(|file| !file.is_empty())
                .map(PathBuf::from),
            offset: base.sysfs().read_u64(&base.dir().join("loop/offset"))?,
            autoclear: base
                .sysfs()
                .read_flag(&base.dir().join("loop/autoclear"))?
                .unwrap_or(false),
            base,
        }),
        DeviceKind::Md => BlockDevice::Md(MdDevice {
            level: base.attr("md/level")?,
            array_state: base.attr("md/array_state")?,
            metadata_version: base.attr("md/metadata_version")?,
            base,
        }),
        DeviceKind::Scsi => {
            let device_dir = base.dir().join("device");
            let hbtl = base
                .sysfs()
                .list_dir(&device_dir.join("scsi_device"))?
                .iter()
                .find_map(|entry| entry.parse::<Hbtl>().ok())
                .ok_or_else(|| SysError::DeviceNotFound(base.name().to_string()))?;
            let info = ScsiDeviceInfo::read(base.sysfs(), &device_dir)?;
            BlockDevice::Scsi(ScsiDisk { hbtl, info, base })
        }
        DeviceKind::Generic => BlockDevice::Generic(GenericDevice { base }),
    };
    Ok(device)
}
