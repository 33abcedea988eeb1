//! A reentrant readers-writer lock.
//!
//! Exclusive acquisition is reentrant per-thread and mutually exclusive
//! with every other acquisition. Shared acquisition is reentrant per-thread
//! and compatible with any number of other shared holders, but blocks
//! while any other thread holds the lock exclusively. A thread that holds
//! the lock exclusively may also acquire it in shared mode without
//! blocking (and vice versa, for the degenerate case of a single shared
//! holder upgrading).
//!
//! The original design purges bookkeeping for threads that died without
//! releasing by checking the live thread set. Rust has no portable
//! equivalent of `threading.enumerate()`, so each acquisition instead
//! registers a [`std::sync::Weak`] handle to a thread-local sentinel; the
//! sentinel's `Arc` is dropped when its owning thread's thread-locals tear
//! down, so a stale entry's `Weak::upgrade` reliably fails even if the
//! thread exited without calling the matching release.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::error::Result;
use crate::sync::SyncObject;

thread_local! {
    static ALIVE: Arc<()> = Arc::new(());
}

fn alive_sentinel() -> Weak<()> {
    ALIVE.with(Arc::downgrade)
}

fn is_alive(sentinel: &Weak<()>) -> bool {
    sentinel.strong_count() > 0
}

struct State {
    exclusive: Option<ThreadId>,
    exclusive_sentinel: Weak<()>,
    exclusive_count: u32,
    exclusive_queue: Vec<(ThreadId, Weak<()>)>,
    shared: HashMap<ThreadId, (u32, Weak<()>)>,
}

/// A reentrant readers-writer lock.
pub struct RWLock {
    sync: SyncObject,
    state: Mutex<State>,
}

impl RWLock {
    pub fn new() -> Self {
        Self::named(None)
    }

    pub fn named(name: Option<String>) -> Self {
        Self {
            sync: SyncObject::new(name),
            state: Mutex::new(State {
                exclusive: None,
                exclusive_sentinel: Weak::new(),
                exclusive_count: 0,
                exclusive_queue: Vec::new(),
                shared: HashMap::new(),
            }),
        }
    }

    fn purge(state: &mut State) {
        if let Some(owner) = state.exclusive {
            if !is_alive(&state.exclusive_sentinel) {
                let _ = owner;
                state.exclusive = None;
                state.exclusive_count = 0;
            }
        }
        state.shared.retain(|_, (_, sentinel)| is_alive(sentinel));
        state.exclusive_queue.retain(|(_, sentinel)| is_alive(sentinel));
    }

    fn try_acquire_exclusive(state: &mut State, tid: ThreadId) -> bool {
        Self::purge(state);
        if state.exclusive == Some(tid) {
            state.exclusive_count += 1;
            return true;
        }
        let shared_ok = state.shared.is_empty() || (state.shared.len() == 1 && state.shared.contains_key(&tid));
        if state.exclusive.is_none() && shared_ok {
            if let Some((front, _)) = state.exclusive_queue.first() {
                if *front == tid {
                    state.exclusive_queue.remove(0);
                } else {
                    if !state.exclusive_queue.iter().any(|(queued, _)| *queued == tid) {
                        state.exclusive_queue.push((tid, alive_sentinel()));
                    }
                    return false;
                }
            }
            state.exclusive = Some(tid);
            state.exclusive_sentinel = alive_sentinel();
            state.exclusive_count = 1;
            return true;
        }
        false
    }

    fn try_acquire_shared(state: &mut State, tid: ThreadId) -> bool {
        Self::purge(state);
        if let Some(owner) = state.exclusive {
            if owner != tid {
                return false;
            }
        }
        let entry = state.shared.entry(tid).or_insert((0, alive_sentinel()));
        entry.0 += 1;
        true
    }

    /// Acquires the lock exclusively, blocking until no other thread holds
    /// it in either mode. Reentrant for the same thread.
    pub fn acquire_exclusive(&self) {
        let _guard = self.sync.enter();
        let tid = thread::current().id();
        loop {
            if Self::try_acquire_exclusive(&mut self.state.lock().unwrap(), tid) {
                return;
            }
            self.sync.sleep(None);
        }
    }

    /// Acquires the lock exclusively with a timeout.
    pub fn acquire_exclusive_timeout(&self, timeout: Duration) -> Result<()> {
        let _guard = self.sync.enter();
        let tid = thread::current().id();
        self.sync.sleep_until(
            || Self::try_acquire_exclusive(&mut self.state.lock().unwrap(), tid),
            Some(timeout),
        )
    }

    /// Acquires the lock in shared mode, blocking while another thread
    /// holds it exclusively. Reentrant for the same thread, and granted
    /// immediately to the thread already holding the exclusive lock.
    pub fn acquire_shared(&self) {
        let _guard = self.sync.enter();
        let tid = thread::current().id();
        loop {
            if Self::try_acquire_shared(&mut self.state.lock().unwrap(), tid) {
                return;
            }
            self.sync.sleep(None);
        }
    }

    pub fn acquire_shared_timeout(&self, timeout: Duration) -> Result<()> {
        let _guard = self.sync.enter();
        let tid = thread::current().id();
        self.sync.sleep_until(
            || Self::try_acquire_shared(&mut self.state.lock().unwrap(), tid),
            Some(timeout),
        )
    }

    /// Releases one level of exclusive acquisition held by the current
    /// thread. Fails with [`crate::error::CoordinationError::InvalidState`]
    /// if the calling thread does not hold the exclusive lock.
    pub fn release_exclusive(&self) -> Result<()> {
        let _guard = self.sync.enter();
        let tid = thread::current().id();
        let mut state = self.state.lock().unwrap();
        if state.exclusive != Some(tid) {
            return Err(crate::error::CoordinationError::InvalidState(
                "release_exclusive called without a matching acquire_exclusive",
            ));
        }
        state.exclusive_count = state.exclusive_count.saturating_sub(1);
        if state.exclusive_count == 0 {
            state.exclusive = None;
        }
        drop(state);
        self.sync.wakeup(true, 0);
        Ok(())
    }

    /// Releases one level of shared acquisition held by the current
    /// thread. Fails with [`crate::error::CoordinationError::InvalidState`]
    /// if the calling thread does not hold the shared lock.
    pub fn release_shared(&self) -> Result<()> {
        let _guard = self.sync.enter();
        let tid = thread::current().id();
        let mut state = self.state.lock().unwrap();
        let Some(entry) = state.shared.get_mut(&tid) else {
            return Err(crate::error::CoordinationError::InvalidState(
                "release_shared called without a matching acquire_shared",
            ));
        };
        entry.0 -= 1;
        if entry.0 == 0 {
            state.shared.remove(&tid);
        }
        drop(state);
        self.sync.wakeup(true, 0);
        Ok(())
    }

    /// Acquires exclusively, returning an RAII guard that releases on
    /// drop.
    pub fn exclusive(&self) -> ExclusiveGuard<'_> {
        self.acquire_exclusive();
        ExclusiveGuard { lock: self }
    }

    /// Acquires in shared mode, returning an RAII guard that releases on
    /// drop.
    pub fn shared(&self) -> SharedGuard<'_> {
        self.acquire_shared();
        SharedGuard { lock: self }
    }

    /// The current exclusive owner and the set of shared-mode holders.
    pub fn owners(&self) -> (Option<ThreadId>, Vec<ThreadId>) {
        let _guard = self.sync.enter();
        let mut state = self.state.lock().unwrap();
        Self::purge(&mut state);
        (state.exclusive, state.shared.keys().copied().collect())
    }
}

impl Default for RWLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for an exclusive acquisition, from [`RWLock::exclusive`].
pub struct ExclusiveGuard<'a> {
    lock: &'a RWLock,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        let _ = self.lock.release_exclusive();
    }
}

/// RAII guard for a shared acquisition, from [`RWLock::shared`].
pub struct SharedGuard<'a> {
    lock: &'a RWLock,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        let _ = self.lock.release_shared();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn exclusive_is_reentrant_for_same_thread() {
        let lock = RWLock::new();
        lock.acquire_exclusive();
        lock.acquire_exclusive();
        lock.release_exclusive().unwrap();
        lock.release_exclusive().unwrap();
    }

    #[test]
    fn release_without_acquire_is_invalid_state() {
        let lock = RWLock::new();
        assert!(matches!(
            lock.release_exclusive(),
            Err(crate::error::CoordinationError::InvalidState(_))
        ));
        assert!(matches!(
            lock.release_shared(),
            Err(crate::error::CoordinationError::InvalidState(_))
        ));
    }

    #[test]
    fn shared_allows_multiple_readers() {
        let lock = Arc::new(RWLock::new());
        let _a = lock.shared();
        let _b = lock.shared();
    }

    #[test]
    fn exclusive_blocks_other_threads() {
        let lock = Arc::new(RWLock::new());
        let _guard = lock.exclusive();

        let lock2 = lock.clone();
        let acquired = Arc::new(Mutex::new(false));
        let acquired2 = acquired.clone();
        let handle = thread::spawn(move || {
            lock2.acquire_exclusive();
            *acquired2.lock().unwrap() = true;
            lock2.release_exclusive().unwrap();
        });

        thread::sleep(Duration::from_millis(30));
        assert!(!*acquired.lock().unwrap());
        drop(_guard);
        handle.join().unwrap();
        assert!(*acquired.lock().unwrap());
    }

    #[test]
    fn exclusive_timeout_fails_while_blocked() {
        let lock = Arc::new(RWLock::new());
        let _guard = lock.exclusive();

        let lock2 = lock.clone();
        let result = thread::spawn(move || lock2.acquire_exclusive_timeout(Duration::from_millis(30)))
            .join()
            .unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn owner_can_also_acquire_shared() {
        let lock = RWLock::new();
        let _exclusive = lock.exclusive();
        let _shared = lock.shared();
    }

    #[test]
    fn sole_shared_reader_can_upgrade_to_exclusive() {
        let lock = RWLock::new();
        let _shared = lock.shared();
        lock.acquire_exclusive();
        lock.release_exclusive().unwrap();
    }
}
