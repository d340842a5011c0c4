// SPDX-License-Identifier: GPL-3.0-only

mod common;

use std::sync::Arc;

use blockdev_sys::multipath::PATHS_FORMAT;
use blockdev_sys::{MultipathSystem, ScriptedRunner, SysError, ToolOutput};
use blockdev_types::{Hbtl, MultipathState, PathState};
use common::Fixture;

const MAPS: &str = "name   sysfs uuid\n\
    mpatha dm-0  3600a098038303053453f463045727a6b\n\
    mpathb dm-1  3600a098038303053453f463045727a6c\n\
    mpathc dm-2  3600a098038303053453f463045727a6d\n";

const PATHS: &str = "uuid   hcil    dev dev_t dm_st  dev_st  chk_st\n\
    mpatha 2:0:0:1 sdc 8:32  active running ready\n\
    mpatha 3:0:0:1 sdd 8:48  active running ready\n\
    mpathb 2:0:0:2 sde 8:64  active running ready\n\
    mpathb 3:0:0:2 sdf 8:80  failed running faulty\n\
    mpathc 4:0:0:3 sdg 8:96  active running ready\n\
    [orphan] #:#:#:# sdh 8:112 undef running ready\n";

fn setup() -> (Fixture, Arc<ScriptedRunner>, MultipathSystem) {
    let fixture = Fixture::new();
    fixture.add_scsi_disk("sdc", "8:32", "2:0:0:1");
    fixture.add_scsi_disk("sdd", "8:48", "3:0:0:1");
    fixture.add_scsi_disk("sde", "8:64", "2:0:0:2");
    fixture.add_scsi_disk("sdf", "8:80", "3:0:0:2");
    // sdg is listed by multipathd but already gone from sysfs.

    let runner = Arc::new(ScriptedRunner::new());
    runner.reply(&["show", "maps"], ToolOutput::success(MAPS));
    runner.reply(&["show", "paths"], ToolOutput::success(PATHS));
    let (locks, _) = fixture.fake_locks();
    let system = MultipathSystem::new(&fixture.config(), runner.clone(), locks);
    (fixture, runner, system)
}

#[test]
fn map_state_follows_its_paths() {
    let (_fixture, _runner, system) = setup();
    let topology = system.topology().unwrap();

    let states: Vec<(&str, MultipathState)> = topology
        .iter()
        .map(|device| (device.name.as_str(), device.state()))
        .collect();
    assert_eq!(
        states,
        [
            ("mpatha", MultipathState::Active),
            ("mpathb", MultipathState::Degraded),
            ("mpathc", MultipathState::Failed),
        ]
    );

    let mpathb = &topology[1];
    assert_eq!(mpathb.dm_device, "dm-1");
    assert_eq!(mpathb.active_paths(), 1);
    let failed = mpathb.path(Hbtl::new(3, 0, 0, 2)).unwrap();
    assert_eq!(failed.state, PathState::Failed);
    assert_eq!(failed.checker_state, "faulty");
    assert_eq!(failed.device.name, "sdf");

    // The vanished path is kept, as failed.
    let vanished = topology[2].path(Hbtl::new(4, 0, 0, 3)).unwrap();
    assert_eq!(vanished.state, PathState::Failed);
    assert_eq!(vanished.device.name, "sdg");
}

const PATHS_WITH_LOST: &str = "uuid   hcil    dev dev_t dm_st  dev_st  chk_st\n\
    mpatha 2:0:0:1 sdc 8:32  active running ready\n\
    mpatha #:#:#:# sdh #:#   failed offline faulty\n\
    mpathb 2:0:0:2 sde 8:64  active running ready\n\
    mpathb #:#:#:# sdf 8:80  failed running faulty\n\
    mpathc 4:0:0:3 sdg #:#   failed offline faulty\n";

#[test]
fn paths_losing_their_address_count_as_failed() {
    let (_fixture, runner, system) = setup();
    runner.reply(&["show", "paths"], ToolOutput::success(PATHS_WITH_LOST));

    let topology = system.topology().unwrap();
    let states: Vec<MultipathState> = topology.iter().map(|device| device.state()).collect();
    assert_eq!(
        states,
        [
            MultipathState::Degraded,
            MultipathState::Degraded,
            MultipathState::Failed,
        ]
    );

    // Gone from sysfs too: only the name is left.
    let mpatha = &topology[0];
    assert_eq!(mpatha.paths.len(), 1);
    assert_eq!(mpatha.active_paths(), 1);
    assert_eq!(mpatha.lost_paths.len(), 1);
    assert_eq!(mpatha.lost_paths[0].device, "sdh");
    assert_eq!(mpatha.lost_paths[0].hbtl, None);

    // Still in sysfs: the address is read back from there.
    let recovered = topology[1].path(Hbtl::new(3, 0, 0, 2)).unwrap();
    assert_eq!(recovered.device.name, "sdf");
    assert_eq!(recovered.state, PathState::Failed);
    assert!(topology[1].lost_paths.is_empty());

    let mpathc = &topology[2];
    assert!(mpathc.paths.is_empty());
    assert_eq!(mpathc.lost_paths[0].hbtl, Some(Hbtl::new(4, 0, 0, 3)));
}

#[test]
fn sysfs_device_state_overrides_multipathd() {
    let (fixture, _runner, system) = setup();
    fixture.write("sys/class/block/sdd/device/state", "offline\n");

    let mpatha = system.device("mpatha").unwrap();
    assert_eq!(mpatha.state(), MultipathState::Degraded);
    let offline = mpatha.path(Hbtl::new(3, 0, 0, 1)).unwrap();
    assert_eq!(offline.state, PathState::Failed);
    assert_eq!(offline.device_state, "offline");
}

#[test]
fn maps_are_found_by_name_dm_device_or_uuid() {
    let (_fixture, _runner, system) = setup();
    assert_eq!(system.device("dm-1").unwrap().name, "mpathb");
    assert_eq!(
        system
            .device("3600a098038303053453f463045727a6d")
            .unwrap()
            .name,
        "mpathc"
    );
    assert!(matches!(
        system.device("mpathz"),
        Err(SysError::DeviceNotFound(_))
    ));
}

#[test]
fn changes_are_followed_by_a_fresh_enumeration() {
    let (fixture, runner, system) = setup();
    runner.reply(&["fail", "path"], ToolOutput::success("ok\n"));

    let topology = system.fail_path("3:0:0:1").unwrap();
    assert_eq!(topology.len(), 3);
    assert_eq!(
        runner.command_lines(),
        [
            "fail path sdd".to_string(),
            "show maps".to_string(),
            format!("show paths format {PATHS_FORMAT}"),
        ]
    );

    system.reinstate_path("/dev/sdd").unwrap();
    system.add_path("sdc").unwrap();
    system.remove_path("sdc").unwrap();
    system.reconfigure().unwrap();
    let commands: Vec<String> = runner
        .command_lines()
        .into_iter()
        .filter(|line| !line.starts_with("show"))
        .collect();
    assert_eq!(
        commands,
        [
            "fail path sdd",
            "reinstate path sdd",
            "add path sdc",
            "del path sdc",
            "reconfigure"
        ]
    );
    assert!(!fixture.locks().join("multipath.lock").exists());
}

#[test]
fn failed_change_releases_the_lock() {
    let (fixture, runner, system) = setup();
    runner.reply(
        &["reinstate", "path"],
        ToolOutput::failure(1, "path sdf not found\n"),
    );
    runner.reply(&["add", "path"], ToolOutput::success("fail\n"));

    assert!(matches!(
        system.reinstate_path("sdf"),
        Err(SysError::ToolFailed { exit_code: 1, .. })
    ));
    assert!(!fixture.locks().join("multipath.lock").exists());

    assert!(matches!(
        system.add_path("sdf"),
        Err(SysError::ToolFailed { ref stderr, .. }) if stderr == "fail"
    ));
    assert!(!fixture.locks().join("multipath.lock").exists());

    // Neither failure triggered a re-enumeration.
    assert!(
        !runner
            .command_lines()
            .iter()
            .any(|line| line.starts_with("show"))
    );
    system.reconfigure().unwrap();
}

#[test]
fn path_arguments_are_validated() {
    let (_fixture, runner, system) = setup();
    assert!(matches!(
        system.fail_path("9:0:0:9"),
        Err(SysError::DeviceNotFound(_))
    ));
    assert!(matches!(system.fail_path("2:0:x:1"), Err(SysError::Parse(_))));
    assert!(system.fail_path("../sda").is_err());
    assert!(runner.calls().is_empty());
}
