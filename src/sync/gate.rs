//! A counting semaphore, independent of a [`crate::sync::SyncObject`]'s
//! reentrant mutex, used to permit-limit entrance to a region without
//! serialising it the way the mutex would.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::time;

/// A classic counting semaphore built from `Mutex` + `Condvar`, the same
/// composition the pack's `synca::LockSignal` uses for its own
/// Condvar-backed wait primitive.
pub struct Gate {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Gate {
    pub fn new(initial: usize) -> Self {
        Self {
            permits: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    /// Acquires one permit, blocking until one is available.
    pub fn acquire(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.available.wait(permits).unwrap();
        }
        *permits -= 1;
    }

    /// Acquires one permit, blocking at most `timeout`. Returns `false` on
    /// timeout.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = time::now_secs() + timeout.as_secs_f64();
        let mut permits = self.permits.lock().unwrap();
        loop {
            if *permits > 0 {
                *permits -= 1;
                return true;
            }
            let left = deadline - time::now_secs();
            if left <= 0.0 {
                return false;
            }
            let (guard, timeout_result) = self
                .available
                .wait_timeout(permits, Duration::from_secs_f64(left))
                .unwrap();
            permits = guard;
            if timeout_result.timed_out() && *permits == 0 {
                return false;
            }
        }
    }

    /// Attempts to acquire a permit without blocking.
    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock().unwrap();
        if *permits > 0 {
            *permits -= 1;
            true
        } else {
            false
        }
    }

    /// Releases one permit back to the gate, waking one waiter.
    pub fn release(&self) {
        let mut permits = self.permits.lock().unwrap();
        *permits += 1;
        self.available.notify_one();
    }

    /// Runs `f` while holding one permit, always releasing it afterwards
    /// even if `f` panics.
    pub fn guarded<R>(&self, f: impl FnOnce() -> R) -> R {
        self.acquire();
        let _release = crate::sync::RunOnDrop::new(|| self.release());
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn acquire_and_release_round_trips() {
        let gate = Gate::new(1);
        gate.acquire();
        gate.release();
        gate.acquire();
        gate.release();
    }

    #[test]
    fn try_acquire_fails_when_exhausted() {
        let gate = Gate::new(1);
        assert!(gate.try_acquire());
        assert!(!gate.try_acquire());
        gate.release();
        assert!(gate.try_acquire());
    }

    #[test]
    fn acquire_timeout_respects_deadline() {
        let gate = Gate::new(0);
        let start = std::time::Instant::now();
        assert!(!gate.acquire_timeout(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn limits_concurrent_entrants() {
        let gate = Arc::new(Gate::new(2));
        let active = Arc::new(Mutex::new(0usize));
        let max_seen = Arc::new(Mutex::new(0usize));
        let mut handles = vec![];
        for _ in 0..8 {
            let gate = gate.clone();
            let active = active.clone();
            let max_seen = max_seen.clone();
            handles.push(thread::spawn(move || {
                gate.guarded(|| {
                    {
                        let mut a = active.lock().unwrap();
                        *a += 1;
                        let mut m = max_seen.lock().unwrap();
                        *m = (*m).max(*a);
                    }
                    thread::sleep(Duration::from_millis(20));
                    *active.lock().unwrap() -= 1;
                });
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(*max_seen.lock().unwrap() <= 2);
    }
}
