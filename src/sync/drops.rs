//! Drop-based cleanup helpers used throughout the coordination primitives to
//! guarantee a release/notify step runs even when a critical section exits
//! early via an error or an early `return`.

/// Runs a closure when dropped, giving call sites a `defer`-like guarantee.
///
/// Used by [`crate::sync::SyncObject::unlock`] to re-acquire the lock when
/// the inner scope ends, and by the task queue executor to clear the
/// `running` flag and re-trigger dispatch regardless of how the task body
/// returns.
pub struct RunOnDrop<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> RunOnDrop<F> {
    pub fn new(f: F) -> Self {
        Self(Some(f))
    }

    /// Cancels the deferred call; the closure will not run on drop.
    pub fn disarm(mut self) {
        self.0.take();
    }
}

impl<F: FnOnce()> Drop for RunOnDrop<F> {
    fn drop(&mut self) {
        if let Some(cb) = self.0.take() {
            cb();
        }
    }
}
