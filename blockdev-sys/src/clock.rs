// SPDX-License-Identifier: GPL-3.0-only

//! Time sources and caller-driven cancellation for the blocking operations
//! (lock acquisition and resync waits).

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Cloneable cancellation flag. Cancelling wakes every sleeper at once.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block for up to `duration`. Returns `false` if cancelled before or
    /// during the wait.
    pub fn sleep(&self, duration: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, duration, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        !*guard
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Wall clock time, used for lock file timestamps.
    fn utc_now(&self) -> DateTime<Utc>;

    /// Sleep for `duration` unless `cancel` fires first. Returns `false`
    /// when cancelled.
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        cancel.sleep(duration)
    }
}

/// Virtual clock for tests: `sleep` returns immediately and advances time.
#[derive(Debug)]
pub struct FakeClock {
    start: Instant,
    start_utc: DateTime<Utc>,
    elapsed: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            start_utc: Utc::now(),
            elapsed: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.elapsed.lock().unwrap_or_else(PoisonError::into_inner) += by;
    }

    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every duration passed to [`Clock::sleep`] so far.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        self.start_utc
            + chrono::Duration::from_std(self.elapsed()).unwrap_or(chrono::Duration::MAX)
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
        self.advance(duration);
        !cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fake_clock_advances_on_sleep() {
        let clock = FakeClock::new();
        let cancel = CancelToken::new();
        let before = clock.now();
        assert!(clock.sleep(Duration::from_millis(250), &cancel));
        assert_eq!(clock.now() - before, Duration::from_millis(250));
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(250)]);
    }

    #[test]
    fn cancelled_sleep_returns_false() {
        let clock = FakeClock::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(!clock.sleep(Duration::from_secs(1), &cancel));
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn cancel_wakes_a_system_sleep() {
        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let started = Instant::now();
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });

        assert!(!SystemClock.sleep(Duration::from_secs(30), &cancel));
        assert!(started.elapsed() < Duration::from_secs(10));
        waker.join().unwrap();
    }
}
