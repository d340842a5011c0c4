// SPDX-License-Identifier: GPL-3.0-only

mod common;

use std::fs;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use blockdev_sys::{LVM_LOCK, LockManager, MDADM_LOCK, MULTIPATH_LOCK, SysError};
use common::Fixture;

const DEAD_PID: &str = "999999999";

#[test]
fn contending_threads_take_turns() {
    let fixture = Fixture::new();
    let mut settings = fixture.config().locks;
    settings.retry_start_ms = 10;
    settings.retry_step_ms = 10;
    settings.retry_max_ms = 20;
    let locks = LockManager::system(settings);

    let first = locks.acquire(MDADM_LOCK, Duration::from_secs(5)).unwrap();

    let (tx, rx) = mpsc::channel();
    let contender = locks.clone();
    let handle = thread::spawn(move || {
        let lock = contender
            .acquire(MDADM_LOCK, Duration::from_secs(10))
            .unwrap();
        tx.send(Instant::now()).unwrap();
        lock.release().unwrap();
    });

    thread::sleep(Duration::from_millis(150));
    assert!(rx.try_recv().is_err(), "second holder got in while the first held the lock");

    let released_at = Instant::now();
    first.release().unwrap();
    let acquired_at = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(acquired_at >= released_at);
    handle.join().unwrap();

    assert!(!locks.lock_path(MDADM_LOCK).exists());
}

#[test]
fn busy_lock_times_out_naming_the_holder() {
    let fixture = Fixture::new();
    let (locks, clock) = fixture.fake_locks();

    let _held = locks.acquire(MULTIPATH_LOCK, Duration::from_secs(1)).unwrap();
    let err = locks
        .acquire(MULTIPATH_LOCK, Duration::from_millis(500))
        .unwrap_err();

    assert!(err.is_retryable());
    match err {
        SysError::LockTimeout {
            name,
            waited,
            holder,
        } => {
            assert_eq!(name, MULTIPATH_LOCK);
            assert_eq!(waited, Duration::from_millis(500));
            assert_eq!(holder, Some(std::process::id()));
        }
        other => panic!("expected LockTimeout, got {other:?}"),
    }
    // 100 ms, then 200 ms, then whatever is left of the timeout.
    assert_eq!(
        clock.sleeps(),
        [
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(200)
        ]
    );
}

#[test]
fn lock_of_dead_process_is_reclaimed_without_waiting() {
    let fixture = Fixture::new();
    let (locks, clock) = fixture.fake_locks();
    let path = locks.lock_path(LVM_LOCK);
    fs::write(&path, format!("{DEAD_PID}\n")).unwrap();

    let lock = locks.acquire(LVM_LOCK, Duration::from_secs(5)).unwrap();

    assert!(clock.sleeps().is_empty());
    let contents = fs::read_to_string(&path).unwrap();
    assert!(contents.starts_with(&format!("{} ", std::process::id())));
    assert!(!fixture.locks().join("lvm.lock.reclaim").exists());

    lock.release().unwrap();
    assert!(!path.exists());
}

#[test]
fn overaged_lock_is_reclaimed_even_if_pid_is_alive() {
    let fixture = Fixture::new();
    let (locks, clock) = fixture.fake_locks();
    let path = locks.lock_path(MDADM_LOCK);
    fs::write(
        &path,
        format!(
            "{} 67e55044-10b1-426f-9247-bb680e5fe0c8 2001-01-01T00:00:00+00:00\n",
            std::process::id()
        ),
    )
    .unwrap();

    let lock = locks.acquire(MDADM_LOCK, Duration::from_secs(5)).unwrap();
    assert!(clock.sleeps().is_empty());
    assert!(!fs::read_to_string(&path).unwrap().contains("2001-01-01"));
    drop(lock);
    assert!(!path.exists());
}

#[test]
fn concurrent_reclaim_is_reported_as_a_race() {
    let fixture = Fixture::new();
    let (locks, _) = fixture.fake_locks();
    let path = locks.lock_path(LVM_LOCK);
    fs::write(&path, format!("{DEAD_PID}\n")).unwrap();
    // A live process is in the middle of reclaiming.
    let guard = fixture.locks().join("lvm.lock.reclaim");
    fs::write(&guard, format!("{}\n", std::process::id())).unwrap();

    let err = locks.acquire(LVM_LOCK, Duration::from_secs(5)).unwrap_err();
    assert!(matches!(err, SysError::RaceDetected { ref name, .. } if name == LVM_LOCK));
    assert!(err.is_retryable());

    // Neither the stale lock nor the other reclaimer's guard was touched.
    assert_eq!(fs::read_to_string(&path).unwrap(), format!("{DEAD_PID}\n"));
    assert!(guard.exists());
}

#[test]
fn abandoned_reclaim_guard_is_cleared() {
    let fixture = Fixture::new();
    let (locks, _) = fixture.fake_locks();
    let path = locks.lock_path(LVM_LOCK);
    fs::write(&path, format!("{DEAD_PID}\n")).unwrap();
    let guard = fixture.locks().join("lvm.lock.reclaim");
    fs::write(&guard, format!("{DEAD_PID}\n")).unwrap();

    let err = locks.acquire(LVM_LOCK, Duration::from_secs(5)).unwrap_err();
    assert!(matches!(err, SysError::RaceDetected { .. }));
    assert!(!guard.exists());

    // The next attempt reclaims normally.
    let lock = locks.acquire(LVM_LOCK, Duration::from_secs(5)).unwrap();
    lock.release().unwrap();
}

#[test]
fn with_lock_releases_after_an_error() {
    let fixture = Fixture::new();
    let (locks, _) = fixture.fake_locks();

    let result: Result<(), SysError> =
        locks.with_lock(MDADM_LOCK, Duration::from_secs(1), || {
            Err(SysError::DeviceNotFound("md9".to_string()))
        });
    assert!(matches!(result, Err(SysError::DeviceNotFound(_))));
    assert!(!locks.lock_path(MDADM_LOCK).exists());

    let value = locks
        .with_lock(MDADM_LOCK, Duration::from_secs(1), || Ok(7))
        .unwrap();
    assert_eq!(value, 7);
}

#[test]
fn cancelled_manager_refuses_to_wait() {
    let fixture = Fixture::new();
    let (locks, clock) = fixture.fake_locks();
    let _held = locks.acquire(MDADM_LOCK, Duration::from_secs(1)).unwrap();

    locks.cancel_token().cancel();
    assert!(matches!(
        locks.acquire(MDADM_LOCK, Duration::from_secs(60)),
        Err(SysError::Cancelled)
    ));
    assert!(clock.sleeps().is_empty());
}
