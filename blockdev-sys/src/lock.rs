// SPDX-License-Identifier: GPL-3.0-only

//! Cross-process administrative locks backed by lock files.
//!
//! A lock is held while `<directory>/<name>.lock` exists and names a live
//! process. The file holds a single line:
//!
//! ```text
//! <pid> <token> <acquired-at, RFC 3339>
//! ```
//!
//! Files written by other tools that only contain a PID are understood as
//! well. The locks are advisory; they only exclude processes that use them.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{CancelToken, Clock, SystemClock};
use crate::config::LockSettings;
use crate::error::{Result, SysError};

/// Whether `pid` names a running process. EPERM means it exists but
/// belongs to somebody else.
pub fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LockRecord {
    pid: u32,
    token: Option<Uuid>,
    acquired_at: Option<DateTime<Utc>>,
}

impl LockRecord {
    fn parse(text: &str) -> Option<Self> {
        let mut fields = text.split_whitespace();
        let pid = fields.next()?.parse().ok()?;
        let token = fields.next().and_then(|t| Uuid::parse_str(t).ok());
        let acquired_at = fields
            .next()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));
        Some(Self {
            pid,
            token,
            acquired_at,
        })
    }

    fn render(&self) -> String {
        let mut line = self.pid.to_string();
        if let Some(token) = self.token {
            line.push_str(&format!(" {token}"));
            if let Some(at) = self.acquired_at {
                line.push_str(&format!(" {}", at.to_rfc3339()));
            }
        }
        line.push('\n');
        line
    }
}

/// Who holds a lock file, as far as we can tell.
enum Holder {
    /// The file disappeared while we looked at it.
    Vanished,
    Live(Option<u32>),
    Stale {
        pid: Option<u32>,
        reason: &'static str,
    },
}

fn create_exclusive(path: &Path, contents: &str) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(path)?;
    if let Err(e) = file.write_all(contents.as_bytes()).and_then(|()| file.sync_all()) {
        let _ = fs::remove_file(path);
        return Err(e);
    }
    Ok(())
}

fn guard_path(lock_path: &Path) -> PathBuf {
    let mut name = lock_path.as_os_str().to_os_string();
    name.push(".reclaim");
    PathBuf::from(name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Displaced {
    Removed,
    /// Another process's record was found and put back.
    Restored,
    Vanished,
}

/// Move a stale lock file aside under a unique name and delete it only if
/// it still holds `observed`. A file created by a newcomer in the meantime
/// is linked back into place; `hard_link` never clobbers a third file.
fn displace_stale(path: &Path, observed: &str) -> io::Result<Displaced> {
    let mut aside = path.as_os_str().to_os_string();
    aside.push(format!(".stale-{}", Uuid::new_v4().simple()));
    let aside = PathBuf::from(aside);

    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Displaced::Vanished),
        Err(e) => return Err(e),
    }

    if fs::read_to_string(&aside).is_ok_and(|current| current == observed) {
        fs::remove_file(&aside)?;
        return Ok(Displaced::Removed);
    }

    match fs::hard_link(&aside, path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            warn!(path = %path.display(), "Lock file replaced twice during reclaim");
        }
        Err(e) => return Err(e),
    }
    fs::remove_file(&aside)?;
    Ok(Displaced::Restored)
}

/// Removes the reclaim guard file when dropped.
struct ReclaimGuard {
    path: PathBuf,
}

impl Drop for ReclaimGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "Failed to remove reclaim guard: {e}");
        }
    }
}

/// Hands out [`AdminLock`]s. Cheap to clone; clones share the clock and
/// cancellation token.
#[derive(Clone)]
pub struct LockManager {
    settings: LockSettings,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("settings", &self.settings)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl LockManager {
    pub fn new(settings: LockSettings, clock: Arc<dyn Clock>, cancel: CancelToken) -> Self {
        Self {
            settings,
            clock,
            cancel,
        }
    }

    /// Manager on the wall clock with a fresh cancellation token.
    pub fn system(settings: LockSettings) -> Self {
        Self::new(settings, Arc::new(SystemClock), CancelToken::new())
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.settings.path_for(name)
    }

    /// Take the lock `name`, waiting up to `timeout`.
    ///
    /// A lock whose owner is gone (or whose file is older than the
    /// configured maximum age) is reclaimed at once, at most once per call.
    /// Losing the reclaim to another process yields
    /// [`SysError::RaceDetected`].
    pub fn acquire(&self, name: &str, timeout: Duration) -> Result<AdminLock> {
        let path = self.lock_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| SysError::io_at(parent, e))?;
        }

        let started = self.clock.now();
        let mut delay = self.settings.retry_start();
        let mut last_holder = None;

        loop {
            if self.cancel.is_cancelled() {
                return Err(SysError::Cancelled);
            }

            let record = self.new_record();
            match create_exclusive(&path, &record.render()) {
                Ok(()) => return Ok(self.granted(name, path, record, timeout)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(SysError::io_at(&path, e)),
            }

            let (holder, observed) = self.inspect(&path)?;
            let waited = self.clock.now().saturating_duration_since(started);
            match holder {
                Holder::Vanished if waited < timeout => continue,
                Holder::Vanished => {}
                Holder::Stale { pid, reason } => {
                    warn!(lock = name, ?pid, reason, "Reclaiming stale lock");
                    return self.reclaim(name, &path, &observed, timeout);
                }
                Holder::Live(pid) => last_holder = pid,
            }

            if waited >= timeout {
                return Err(SysError::LockTimeout {
                    name: name.to_string(),
                    waited,
                    holder: last_holder,
                });
            }

            let pause = delay.min(timeout - waited);
            debug!(lock = name, holder = ?last_holder, ?pause, "Lock busy, backing off");
            if !self.clock.sleep(pause, &self.cancel) {
                return Err(SysError::Cancelled);
            }
            delay = (delay + self.settings.retry_step()).min(self.settings.retry_max());
        }
    }

    /// Run `f` while holding `name`. The lock is released on every exit
    /// path, including errors from `f`.
    pub fn with_lock<T>(
        &self,
        name: &str,
        timeout: Duration,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let lock = self.acquire(name, timeout)?;
        let result = f();
        let released = lock.release();
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                warn!(lock = name, "Release after failed operation also failed: {release_err}");
                Err(e)
            }
        }
    }

    fn new_record(&self) -> LockRecord {
        LockRecord {
            pid: std::process::id(),
            token: Some(Uuid::new_v4()),
            acquired_at: Some(self.clock.utc_now()),
        }
    }

    fn granted(&self, name: &str, path: PathBuf, record: LockRecord, timeout: Duration) -> AdminLock {
        info!(lock = name, path = %path.display(), "Acquired lock");
        AdminLock {
            name: name.to_string(),
            path,
            pid: record.pid,
            token: record.token.unwrap_or_default(),
            acquired_at: record.acquired_at.unwrap_or_else(|| self.clock.utc_now()),
            timeout,
            released: false,
        }
    }

    fn inspect(&self, path: &Path) -> Result<(Holder, String)> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok((Holder::Vanished, String::new()));
            }
            Err(e) => return Err(SysError::io_at(path, e)),
        };

        let record = LockRecord::parse(&contents);
        let written_at = match record.as_ref().and_then(|r| r.acquired_at) {
            Some(at) => Some(at),
            None => fs::metadata(path)
                .and_then(|meta| meta.modified())
                .ok()
                .map(DateTime::<Utc>::from),
        };
        let too_old = written_at.is_some_and(|at| {
            (self.clock.utc_now() - at)
                .to_std()
                .is_ok_and(|age| age > self.settings.max_age())
        });

        let holder = match record {
            Some(record) if !process_alive(record.pid) => Holder::Stale {
                pid: Some(record.pid),
                reason: "owner process is gone",
            },
            Some(record) if too_old => Holder::Stale {
                pid: Some(record.pid),
                reason: "lock file exceeded maximum age",
            },
            Some(record) => Holder::Live(Some(record.pid)),
            // Possibly a peer between creating and writing the file.
            None if too_old => Holder::Stale {
                pid: None,
                reason: "unreadable lock file exceeded maximum age",
            },
            None => Holder::Live(None),
        };
        Ok((holder, contents))
    }

    fn reclaim(
        &self,
        name: &str,
        path: &Path,
        observed: &str,
        timeout: Duration,
    ) -> Result<AdminLock> {
        let race = |detail: &str| SysError::RaceDetected {
            name: name.to_string(),
            detail: detail.to_string(),
        };

        let guard_path = guard_path(path);
        let guard_record = LockRecord {
            pid: std::process::id(),
            token: None,
            acquired_at: None,
        };
        match create_exclusive(&guard_path, &guard_record.render()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let owner = fs::read_to_string(&guard_path)
                    .ok()
                    .and_then(|text| LockRecord::parse(&text));
                if let Some(owner) = owner
                    && !process_alive(owner.pid)
                {
                    warn!(lock = name, pid = owner.pid, "Clearing abandoned reclaim guard");
                    fs::remove_file(&guard_path).or_else(|e| match e.kind() {
                        io::ErrorKind::NotFound => Ok(()),
                        _ => Err(SysError::io_at(&guard_path, e)),
                    })?;
                    return Err(race("cleared a reclaim guard left by a dead process"));
                }
                return Err(race("another process is reclaiming the lock"));
            }
            Err(e) => return Err(SysError::io_at(&guard_path, e)),
        }
        let _guard = ReclaimGuard { path: guard_path };

        match displace_stale(path, observed).map_err(|e| SysError::io_at(path, e))? {
            Displaced::Removed => {}
            Displaced::Restored => return Err(race("lock file changed during reclaim")),
            Displaced::Vanished => return Err(race("lock file vanished during reclaim")),
        }

        let record = self.new_record();
        match create_exclusive(path, &record.render()) {
            Ok(()) => {
                info!(lock = name, "Reclaimed stale lock");
                Ok(self.granted(name, path.to_path_buf(), record, timeout))
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(race("another process took the lock during reclaim"))
            }
            Err(e) => Err(SysError::io_at(path, e)),
        }
    }
}

/// Exclusive ownership of a named administrative resource.
///
/// Dropping the lock releases it. [`AdminLock::release`] does the same but
/// reports whether the file still belonged to us.
#[derive(Debug)]
pub struct AdminLock {
    name: String,
    path: PathBuf,
    pid: u32,
    token: Uuid,
    acquired_at: DateTime<Utc>,
    timeout: Duration,
    released: bool,
}

impl AdminLock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn owning_pid(&self) -> u32 {
        self.pid
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Timeout the lock was requested with.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Remove the lock file if it still carries our token. A file that
    /// was reclaimed by someone else is left alone and reported as
    /// [`SysError::LockStolen`].
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.remove_if_owned()
    }

    fn remove_if_owned(&self) -> Result<()> {
        let stolen = || SysError::LockStolen {
            name: self.name.clone(),
        };
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(stolen()),
            Err(e) => return Err(SysError::io_at(&self.path, e)),
        };

        let owned = LockRecord::parse(&contents)
            .is_some_and(|record| record.pid == self.pid && record.token == Some(self.token));
        if !owned {
            warn!(lock = %self.name, "Lock file no longer carries our token, leaving it");
            return Err(stolen());
        }

        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(stolen()),
            Err(e) => return Err(SysError::io_at(&self.path, e)),
        }
        info!(lock = %self.name, "Released lock");
        Ok(())
    }
}

impl Drop for AdminLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.remove_if_owned() {
            warn!(lock = %self.name, "Failed to release lock: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    fn settings(dir: &Path) -> LockSettings {
        LockSettings {
            directory: dir.to_path_buf(),
            ..LockSettings::default()
        }
    }

    fn fake_manager(dir: &Path) -> (LockManager, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::new());
        let manager = LockManager::new(settings(dir), clock.clone(), CancelToken::new());
        (manager, clock)
    }

    #[test]
    fn parses_full_and_pid_only_records() {
        let token = Uuid::new_v4();
        let line = format!("4242 {token} 2026-01-02T03:04:05+00:00\n");
        let record = LockRecord::parse(&line).unwrap();
        assert_eq!(record.pid, 4242);
        assert_eq!(record.token, Some(token));
        assert_eq!(record.render().trim_end(), format!("4242 {token} 2026-01-02T03:04:05+00:00"));

        let foreign = LockRecord::parse("  1234\n").unwrap();
        assert_eq!(foreign.pid, 1234);
        assert_eq!(foreign.token, None);
        assert!(LockRecord::parse("").is_none());
        assert!(LockRecord::parse("abc").is_none());
    }

    #[test]
    fn liveness() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(0));
        assert!(!process_alive(999_999_999));
    }

    #[test]
    fn acquire_writes_and_release_removes() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = fake_manager(dir.path());

        let lock = manager.acquire("mdadm", Duration::from_secs(1)).unwrap();
        let contents = fs::read_to_string(lock.path()).unwrap();
        let record = LockRecord::parse(&contents).unwrap();
        assert_eq!(record.pid, std::process::id());
        assert!(record.token.is_some());
        assert_eq!(lock.owning_pid(), std::process::id());

        let path = lock.path().to_path_buf();
        lock.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = fake_manager(dir.path());
        let path = {
            let lock = manager.acquire("lvm", Duration::from_secs(1)).unwrap();
            lock.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn backoff_grows_and_never_oversleeps_the_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, clock) = fake_manager(dir.path());

        let _held = manager.acquire("multipath", Duration::from_secs(1)).unwrap();
        let err = manager
            .acquire("multipath", Duration::from_millis(2500))
            .unwrap_err();

        match err {
            SysError::LockTimeout { waited, holder, .. } => {
                assert_eq!(waited, Duration::from_millis(2500));
                assert_eq!(holder, Some(std::process::id()));
            }
            other => panic!("unexpected error {other:?}"),
        }
        let millis: Vec<u128> = clock.sleeps().iter().map(Duration::as_millis).collect();
        assert_eq!(millis, [100, 200, 300, 400, 500, 600, 400]);
    }

    #[test]
    fn backoff_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, clock) = fake_manager(dir.path());

        let _held = manager.acquire("mdadm", Duration::from_secs(1)).unwrap();
        assert!(manager.acquire("mdadm", Duration::from_secs(10)).is_err());
        assert!(clock.sleeps().iter().all(|d| *d <= Duration::from_secs(1)));
        assert_eq!(clock.elapsed(), Duration::from_secs(10));
    }

    #[test]
    fn old_lock_file_is_reclaimed_even_if_pid_is_alive() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, clock) = fake_manager(dir.path());
        let path = manager.lock_path("mdadm");
        let stale = LockRecord {
            pid: std::process::id(),
            token: Some(Uuid::new_v4()),
            acquired_at: Some(clock.utc_now() - chrono::Duration::hours(1)),
        };
        fs::write(&path, stale.render()).unwrap();

        let lock = manager.acquire("mdadm", Duration::from_secs(5)).unwrap();
        assert!(clock.sleeps().is_empty());
        assert_ne!(fs::read_to_string(lock.path()).unwrap(), stale.render());
    }

    #[test]
    fn displaced_file_is_deleted_only_if_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mdadm.lock");
        let stale = "999999999 old\n";

        fs::write(&path, stale).unwrap();
        assert_eq!(displace_stale(&path, stale).unwrap(), Displaced::Removed);
        assert!(!path.exists());

        // A newcomer took the lock after the stale record was read.
        fs::write(&path, "4242 new\n").unwrap();
        assert_eq!(displace_stale(&path, stale).unwrap(), Displaced::Restored);
        assert_eq!(fs::read_to_string(&path).unwrap(), "4242 new\n");

        assert_eq!(
            displace_stale(&dir.path().join("lvm.lock"), stale).unwrap(),
            Displaced::Vanished
        );
        let left: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(left.len(), 1);
    }

    #[test]
    fn release_leaves_a_reclaimed_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = fake_manager(dir.path());
        let lock = manager.acquire("lvm", Duration::from_secs(1)).unwrap();
        let path = lock.path().to_path_buf();

        fs::write(&path, format!("1 {}\n", Uuid::new_v4())).unwrap();
        assert!(matches!(lock.release(), Err(SysError::LockStolen { .. })));
        assert!(path.exists());
    }

    #[test]
    fn with_lock_releases_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = fake_manager(dir.path());
        let path = manager.lock_path("mdadm");

        let result: Result<()> = manager.with_lock("mdadm", Duration::from_secs(1), || {
            assert!(path.exists());
            Err(SysError::DeviceNotFound("md9".into()))
        });
        assert!(matches!(result, Err(SysError::DeviceNotFound(_))));
        assert!(!path.exists());
    }

    #[test]
    fn cancelled_manager_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = fake_manager(dir.path());
        let _held = manager.acquire("mdadm", Duration::from_secs(1)).unwrap();

        manager.cancel_token().cancel();
        assert!(matches!(
            manager.acquire("mdadm", Duration::from_secs(5)),
            Err(SysError::Cancelled)
        ));
    }
}
