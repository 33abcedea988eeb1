//! The reentrant sync base underlying every coordination primitive in this
//! crate.
//!
//! Every other primitive in this crate (`Deque`, `Promise`, `RWLock`,
//! `TaskQueue`, `Scheduler`) embeds a [`SyncObject`] and funnels its
//! mutating operations through [`SyncObject::enter`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::error::{CoordinationError, Result};
use crate::sync::drops::RunOnDrop;
use crate::time;

struct Inner {
    owner: Option<ThreadId>,
    depth: u32,
}

/// A reentrant mutex bundled with a condition variable and a counting
/// semaphore "gate", exposing `sleep`/`wakeup`/`sleep_until` primitives.
///
/// The mutex (`L` in the design) is reentrant: the thread that holds it may
/// re-enter via nested [`SyncObject::enter`] calls and must release once per
/// acquisition. The condition (`C`) shares the same internal state as `L` so
/// that [`SyncObject::sleep`] can atomically release `L` and wait, the same
/// way Python's `Condition(lock)` behaves when bound to an `RLock`.
pub struct SyncObject {
    state: Mutex<Inner>,
    acquired: Condvar,
    woken: Condvar,
    gate: crate::sync::Gate,
    alarm: Mutex<Option<Arc<AtomicU64>>>,
    name: Option<String>,
}

impl SyncObject {
    pub fn new(name: Option<String>) -> Self {
        Self::with_gate(name, 1)
    }

    /// Creates a sync object whose gate starts with `gate_permits` permits
    /// instead of the default of one.
    pub fn with_gate(name: Option<String>, gate_permits: usize) -> Self {
        Self {
            state: Mutex::new(Inner {
                owner: None,
                depth: 0,
            }),
            acquired: Condvar::new(),
            woken: Condvar::new(),
            gate: crate::sync::Gate::new(gate_permits),
            alarm: Mutex::new(None),
            name,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The independent gate semaphore (design: "used as an independent
    /// 'gate' separate from `L`").
    pub fn gate(&self) -> &crate::sync::Gate {
        &self.gate
    }

    /// Enters the critical section, blocking until acquired. Reentrant: the
    /// same thread may call this again (e.g. via a nested synchronized
    /// method) without blocking on itself.
    pub fn enter(&self) -> SyncGuard<'_> {
        let tid = thread::current().id();
        let mut inner = self.state.lock().unwrap();
        loop {
            match inner.owner {
                None => {
                    inner.owner = Some(tid);
                    inner.depth = 1;
                    break;
                }
                Some(o) if o == tid => {
                    inner.depth += 1;
                    break;
                }
                Some(_) => {
                    inner = self.acquired.wait(inner).unwrap();
                }
            }
        }
        drop(inner);
        tracing::trace!(name = ?self.name, "sync object entered");
        SyncGuard { sync: self }
    }

    fn release_one(&self) {
        let mut inner = self.state.lock().unwrap();
        debug_assert_eq!(inner.owner, Some(thread::current().id()));
        inner.depth -= 1;
        if inner.depth == 0 {
            inner.owner = None;
            drop(inner);
            self.acquired.notify_all();
        }
    }

    /// Blocks until [`SyncObject::wakeup`] is called (or `timeout`
    /// elapses), atomically releasing `L` for the duration of the wait and
    /// re-acquiring it before returning. Must be called while the current
    /// thread holds `L` (i.e. inside a [`SyncObject::enter`] scope).
    ///
    /// Elapsing the timeout is not an error at this layer: the caller
    /// returns normally and is expected to re-check its own condition (see
    /// [`SyncObject::sleep_until`], which does this and turns a stale
    /// timeout into [`CoordinationError::Timeout`]).
    pub fn sleep(&self, timeout: Option<Duration>) {
        let tid = thread::current().id();
        let mut inner = self.state.lock().unwrap();
        debug_assert_eq!(inner.owner, Some(tid));
        let saved_depth = inner.depth;
        inner.owner = None;
        inner.depth = 0;
        self.acquired.notify_all();

        inner = match timeout {
            Some(d) => self.woken.wait_timeout(inner, d).unwrap().0,
            None => self.woken.wait(inner).unwrap(),
        };

        loop {
            match inner.owner {
                None => {
                    inner.owner = Some(tid);
                    break;
                }
                Some(o) if o == tid => break,
                Some(_) => {
                    inner = self.acquired.wait(inner).unwrap();
                }
            }
        }
        inner.depth = saved_depth;
    }

    /// Loops calling `pred` under `L`, sleeping on `C` until it returns
    /// true. Fails with [`CoordinationError::Timeout`] if the deadline is
    /// crossed while `pred` is still false.
    pub fn sleep_until(&self, mut pred: impl FnMut() -> bool, timeout: Option<Duration>) -> Result<()> {
        let deadline = time::deadline_from(timeout);
        loop {
            let timed_out = time::past(deadline);
            if timed_out {
                return if pred() {
                    Ok(())
                } else {
                    Err(CoordinationError::Timeout)
                };
            }
            if pred() {
                return Ok(());
            }
            self.sleep(time::remaining(deadline));
        }
    }

    /// Notifies all waiters (`all=true`, the default) or the first `n`
    /// waiters. Must be called while holding `L`.
    pub fn wakeup(&self, all: bool, n: usize) {
        let _inner = self.state.lock().unwrap();
        if all {
            self.woken.notify_all();
        } else {
            for _ in 0..n {
                self.woken.notify_one();
            }
        }
        tracing::trace!(name = ?self.name, all, n, "wakeup");
    }

    /// A scoped inverter: while the returned guard is alive, `L` is fully
    /// released (regardless of reentrancy depth); dropping the guard
    /// re-acquires it at the same depth. Equivalent to the design's
    /// `sync.unlock` context manager.
    pub fn unlock(&self) -> UnlockGuard<'_> {
        let tid = thread::current().id();
        let mut inner = self.state.lock().unwrap();
        debug_assert_eq!(inner.owner, Some(tid));
        let saved_depth = inner.depth;
        inner.owner = None;
        inner.depth = 0;
        drop(inner);
        self.acquired.notify_all();
        UnlockGuard {
            sync: self,
            depth: saved_depth,
        }
    }

    /// Arms a new alarm that calls `callback` at absolute time `at` (in
    /// `now_secs()` units) on a dedicated thread. Arming cancels any
    /// previously pending alarm on this sync object (design: "at most one
    /// pending timer per sync object").
    pub fn alarm<F>(&self, at: f64, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel_alarm();
        let generation = Arc::new(AtomicU64::new(1));
        *self.alarm.lock().unwrap() = Some(generation.clone());
        let name = self.name.clone();
        thread::spawn(move || {
            let delay = (at - time::now_secs()).max(0.0);
            thread::sleep(Duration::from_secs_f64(delay));
            if generation.load(Ordering::SeqCst) == 1 {
                callback();
            } else {
                tracing::trace!(name = ?name, "alarm callback superseded; skipping");
            }
        });
    }

    /// Cancels the pending alarm, if any. A no-op if none is armed.
    pub fn cancel_alarm(&self) {
        if let Some(generation) = self.alarm.lock().unwrap().take() {
            generation.store(0, Ordering::SeqCst);
        }
    }
}

/// RAII guard returned by [`SyncObject::enter`]; releases one level of
/// reentrancy depth on drop.
pub struct SyncGuard<'a> {
    sync: &'a SyncObject,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.sync.release_one();
    }
}

/// RAII guard returned by [`SyncObject::unlock`]; re-acquires `L` at the
/// saved depth on drop.
pub struct UnlockGuard<'a> {
    sync: &'a SyncObject,
    depth: u32,
}

impl Drop for UnlockGuard<'_> {
    fn drop(&mut self) {
        let tid = thread::current().id();
        let mut inner = self.sync.state.lock().unwrap();
        loop {
            match inner.owner {
                None => {
                    inner.owner = Some(tid);
                    break;
                }
                Some(o) if o == tid => break,
                Some(_) => {
                    inner = self.sync.acquired.wait(inner).unwrap();
                }
            }
        }
        inner.depth = self.depth;
    }
}

/// Runs `f` once `cond` exceeds its wait, disarming cleanly either way.
/// Small helper used by call sites that want a `sleep`-then-check pattern
/// without hand-rolling the `RunOnDrop` dance each time.
pub fn run_guarded<R>(sync: &SyncObject, f: impl FnOnce() -> R) -> R {
    let _entered = sync.enter();
    let guard = RunOnDrop::new(|| {});
    let result = f();
    guard.disarm();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tracing_test::traced_test;

    #[test]
    fn reentrant_enter_does_not_deadlock_same_thread() {
        let sync = SyncObject::new(None);
        let _outer = sync.enter();
        let _inner = sync.enter();
    }

    #[test]
    #[traced_test]
    fn sleep_and_wakeup_hand_off_between_threads() {
        let sync = Arc::new(SyncObject::new(Some("handoff".into())));
        let ready = Arc::new(Mutex::new(false));

        let sync2 = sync.clone();
        let ready2 = ready.clone();
        let handle = thread::spawn(move || {
            let _guard = sync2.enter();
            while !*ready2.lock().unwrap() {
                sync2.sleep(Some(Duration::from_secs(5)));
            }
        });

        thread::sleep(Duration::from_millis(30));
        {
            let _guard = sync.enter();
            *ready.lock().unwrap() = true;
            sync.wakeup(true, 0);
        }
        handle.join().unwrap();
    }

    #[test]
    fn sleep_until_times_out() {
        let sync = SyncObject::new(None);
        let _guard = sync.enter();
        let result = sync.sleep_until(|| false, Some(Duration::from_millis(30)));
        assert!(matches!(result, Err(CoordinationError::Timeout)));
    }

    #[test]
    fn sleep_until_zero_timeout_does_not_block() {
        let sync = SyncObject::new(None);
        let _guard = sync.enter();
        let start = std::time::Instant::now();
        let result = sync.sleep_until(|| false, Some(Duration::ZERO));
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn unlock_releases_and_reacquires() {
        let sync = Arc::new(SyncObject::new(None));
        let entered_inner = Arc::new(Mutex::new(false));

        let _outer = sync.enter();
        {
            let _unlocked = sync.unlock();
            // while unlocked, another thread can acquire
            let sync2 = sync.clone();
            let entered_inner2 = entered_inner.clone();
            thread::spawn(move || {
                let _guard = sync2.enter();
                *entered_inner2.lock().unwrap() = true;
            })
            .join()
            .unwrap();
        }
        assert!(*entered_inner.lock().unwrap());
    }

    #[test]
    fn alarm_fires_and_can_be_superseded() {
        let sync = Arc::new(SyncObject::new(None));
        let fired = Arc::new(Mutex::new(0u32));

        let fired1 = fired.clone();
        sync.alarm(time::now_secs() + 0.02, move || {
            *fired1.lock().unwrap() += 1;
        });
        // Superseding immediately should cancel the first alarm.
        let fired2 = fired.clone();
        sync.alarm(time::now_secs() + 0.02, move || {
            *fired2.lock().unwrap() += 10;
        });

        thread::sleep(Duration::from_millis(60));
        assert_eq!(*fired.lock().unwrap(), 10);
    }
}
