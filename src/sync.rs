//! Small synchronisation helpers shared by the pipeline threads.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Cooperative stop flag for one surveillance run.
///
/// Every capture loop and recorder session of a run holds a clone. Waiting
/// on the signal doubles as the loops' pacing sleep, so a stop wakes them
/// immediately instead of after the current sleep.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Idempotent.
    pub fn trigger(&self) {
        let (flag, cvar) = &*self.inner;
        *lock(flag) = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *lock(&self.inner.0)
    }

    /// Sleep for up to `timeout`. Returns true if the signal fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (flag, cvar) = &*self.inner;
        let mut stopped = lock(flag);
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = cvar
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            stopped = guard;
        }
        true
    }
}

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
///
/// Only used for state that stays consistent across a panic (counters,
/// `Option` swaps, map inserts).
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Join a thread, giving up once `deadline` passes.
///
/// Returns false when the thread was still running at the deadline; the
/// thread is then left detached.
pub(crate) fn join_until(handle: JoinHandle<()>, deadline: Instant) -> bool {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    if handle.join().is_err() {
        log::error!("worker thread panicked");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_returns_early_when_triggered() {
        let signal = StopSignal::new();
        let remote = signal.clone();
        let waiter = std::thread::spawn(move || {
            let start = Instant::now();
            let stopped = remote.wait_timeout(Duration::from_secs(10));
            (stopped, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(50));
        signal.trigger();
        let (stopped, elapsed) = waiter.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn wait_times_out_without_trigger() {
        let signal = StopSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(20)));
        assert!(!signal.is_triggered());
    }

    #[test]
    fn join_until_reports_stuck_threads() {
        let release = StopSignal::new();
        let held = release.clone();
        let handle = std::thread::spawn(move || {
            held.wait_timeout(Duration::from_secs(10));
        });
        assert!(!join_until(handle, Instant::now() + Duration::from_millis(30)));
        release.trigger();

        let quick = std::thread::spawn(|| {});
        assert!(join_until(quick, Instant::now() + Duration::from_secs(1)));
    }
}
