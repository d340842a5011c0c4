// SPDX-License-Identifier: GPL-3.0-only

mod common;

use blockdev_sys::{
    BlockDevice, BlockDeviceOps, DeviceClassifier, IdentityResolver, SysError, Sysfs,
};
use blockdev_types::{DevNumber, DeviceKind, Hbtl};
use common::Fixture;

fn classifier(fixture: &Fixture) -> DeviceClassifier {
    DeviceClassifier::new(IdentityResolver::new(
        Sysfs::new(fixture.sys()),
        fixture.root().join("dev"),
    ))
}

#[test]
fn multipath_map_wins_over_plain_device_mapper() {
    let fixture = Fixture::new();
    fixture.add_block("dm-0", "253:0", 2_097_152);
    fixture.write("sys/class/block/dm-0/dm/name", "mpatha\n");
    fixture.write(
        "sys/class/block/dm-0/dm/uuid",
        "mpath-3600a098038303053453f463045727a6b\n",
    );

    for strict in [false, true] {
        let device = classifier(&fixture).strict(strict).classify_spec("dm-0").unwrap();
        assert_eq!(device.kind(), DeviceKind::Multipath);
        let BlockDevice::Multipath(map) = device else {
            panic!("expected a multipath map");
        };
        assert_eq!(map.dm_name, "mpatha");
        assert_eq!(map.wwid, "3600a098038303053453f463045727a6b");
        assert_eq!(map.partition, None);
    }
}

#[test]
fn other_dm_targets_are_device_mapper() {
    let fixture = Fixture::new();
    fixture.add_block("dm-1", "253:1", 409_600);
    fixture.write("sys/class/block/dm-1/dm/name", "vg0-root\n");
    fixture.write("sys/class/block/dm-1/dm/uuid", "LVM-Zx8kQ2\n");

    let device = classifier(&fixture).classify_spec("253:1").unwrap();
    let info = device.info().unwrap();
    assert_eq!(info.kind, DeviceKind::DeviceMapper);
    assert_eq!(info.dm_name.as_deref(), Some("vg0-root"));
    assert_eq!(info.identity.dev, DevNumber::new(253, 1));
}

#[test]
fn strict_mode_rejects_unrelated_claims() {
    let fixture = Fixture::new();
    fixture.add_block("dm-2", "253:2", 1024);
    fixture.write("sys/class/block/dm-2/dm/name", "odd\n");
    fixture.write("sys/class/block/dm-2/loop/backing_file", "/srv/disk.img\n");

    // First matching rule wins by default.
    let lenient = classifier(&fixture).classify_spec("dm-2").unwrap();
    assert_eq!(lenient.kind(), DeviceKind::DeviceMapper);

    let err = classifier(&fixture)
        .strict(true)
        .classify_spec("dm-2")
        .unwrap_err();
    match err {
        SysError::ClassificationAmbiguous { name, kinds } => {
            assert_eq!(name, "dm-2");
            assert_eq!(kinds, ["device-mapper", "loop"]);
        }
        other => panic!("expected ClassificationAmbiguous, got {other:?}"),
    }
}

#[test]
fn loop_md_and_scsi_devices() {
    let fixture = Fixture::new();
    fixture.add_block("loop0", "7:0", 0);
    fixture.add_block("md127", "9:127", 1_953_260_544);
    fixture.write("sys/class/block/md127/md/level", "raid5\n");
    fixture.write("sys/class/block/md127/md/array_state", "clean\n");
    fixture.add_scsi_disk("sdc", "8:32", "2:0:0:1");

    let classifier = classifier(&fixture);

    let BlockDevice::Loop(lo) = classifier.classify_spec("loop0").unwrap() else {
        panic!("expected a loop device");
    };
    assert_eq!(lo.backing_file, None);
    assert!(!lo.autoclear);

    let BlockDevice::Md(md) = classifier.classify_spec("md127").unwrap() else {
        panic!("expected an md device");
    };
    assert_eq!(md.level.as_deref(), Some("raid5"));
    assert_eq!(md.array_state.as_deref(), Some("clean"));

    let scsi = classifier.classify_spec("sdc").unwrap();
    let info = scsi.info().unwrap();
    assert_eq!(info.kind, DeviceKind::Scsi);
    assert_eq!(info.hbtl, Some(Hbtl::new(2, 0, 0, 1)));
    assert_eq!(info.size.bytes(), 1 << 30);
    let BlockDevice::Scsi(disk) = scsi else {
        panic!("expected a scsi disk");
    };
    assert_eq!(disk.info.vendor.as_deref(), Some("NETAPP"));
    assert!(disk.info.is_running());
}

#[test]
fn unknown_devices_fall_back_to_generic() {
    let fixture = Fixture::new();
    fixture.add_block("nvme0n1", "259:0", 1_000_215_216);

    let device = classifier(&fixture).strict(true).classify_spec("nvme0n1").unwrap();
    assert!(matches!(device, BlockDevice::Generic(_)));
    assert_eq!(device.name(), "nvme0n1");
    assert!(device.exists());
}

#[test]
fn missing_devices_are_not_found() {
    let fixture = Fixture::new();
    let classifier = classifier(&fixture);

    assert!(matches!(
        classifier.classify_spec("sdz"),
        Err(SysError::DeviceNotFound(_))
    ));
    assert!(matches!(
        classifier.classify_spec("8:240"),
        Err(SysError::DeviceNotFound(_))
    ));
}
