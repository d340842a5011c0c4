// SPDX-License-Identifier: GPL-3.0-only

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use blockdev_sys::{BlockdevConfig, CancelToken, FakeClock, LockManager};
use tracing_subscriber::EnvFilter;

/// Route crate logs to the test harness; `RUST_LOG=debug` shows them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A throwaway `/sys`, `/dev`, `/proc` and lock directory.
pub struct Fixture {
    dir: tempfile::TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        init_tracing();
        let fixture = Self {
            dir: tempfile::tempdir().expect("tempdir"),
        };
        for sub in ["sys/class/block", "sys/dev/block", "dev", "proc", "locks"] {
            fs::create_dir_all(fixture.root().join(sub)).expect("fixture dirs");
        }
        fixture
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn sys(&self) -> PathBuf {
        self.root().join("sys")
    }

    pub fn locks(&self) -> PathBuf {
        self.root().join("locks")
    }

    pub fn config(&self) -> BlockdevConfig {
        let mut config = BlockdevConfig::default();
        config.sysfs_root = self.sys();
        config.dev_root = self.root().join("dev");
        config.proc_root = self.root().join("proc");
        config.locks.directory = self.locks();
        config
    }

    /// Lock manager on a virtual clock, so waits cost no real time.
    pub fn fake_locks(&self) -> (LockManager, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::new());
        let locks = LockManager::new(self.config().locks, clock.clone(), CancelToken::new());
        (locks, clock)
    }

    /// Write `contents` to `relative` below the fixture root, creating
    /// parent directories.
    pub fn write(&self, relative: &str, contents: &str) {
        let path = self.root().join(relative);
        fs::create_dir_all(path.parent().expect("parent")).expect("parent dirs");
        fs::write(path, contents).expect("write fixture file");
    }

    pub fn mkdir(&self, relative: &str) {
        fs::create_dir_all(self.root().join(relative)).expect("mkdir");
    }

    /// A block device `name` with number `dev` and `sectors` of size,
    /// reachable both by name and by number.
    pub fn add_block(&self, name: &str, dev: &str, sectors: u64) -> PathBuf {
        let dir = self.sys().join("class/block").join(name);
        fs::create_dir_all(&dir).expect("block dir");
        fs::write(dir.join("dev"), format!("{dev}\n")).expect("dev");
        fs::write(dir.join("size"), format!("{sectors}\n")).expect("size");
        fs::write(dir.join("uevent"), format!("DEVNAME={name}\n")).expect("uevent");
        let by_number = self.sys().join("dev/block").join(dev);
        if !by_number.exists() {
            std::os::unix::fs::symlink(&dir, &by_number).expect("dev symlink");
        }
        dir
    }

    /// A SCSI disk with its `device/scsi_device/<hbtl>` marker.
    pub fn add_scsi_disk(&self, name: &str, dev: &str, hbtl: &str) -> PathBuf {
        let dir = self.add_block(name, dev, 2_097_152);
        fs::create_dir_all(dir.join("device/scsi_device").join(hbtl)).expect("scsi_device");
        fs::write(dir.join("device/vendor"), "NETAPP  \n").expect("vendor");
        fs::write(dir.join("device/state"), "running\n").expect("state");
        let lun = self.sys().join("bus/scsi/devices").join(hbtl).join("block").join(name);
        fs::create_dir_all(lun).expect("lun dir");
        dir
    }
}
