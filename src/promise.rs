//! A single-assignment deferred result with callbacks, chaining and
//! cancellation.
//!
//! A [`Promise<T>`] starts pending and is delivered exactly once, by one of
//! [`Promise::complete`], [`Promise::fail`] or [`Promise::cancel`].
//! Delivery runs the single-shot handler for that outcome, then the
//! generic callback list in insertion order (stopping early the first time
//! one returns `true`), then forwards the same outcome to every chained
//! promise, then wakes anyone blocked in [`Promise::wait`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{CoordinationError, Result, TaskFailure};
use crate::sync::SyncObject;

enum Outcome<T> {
    Pending,
    Complete(T),
    Failed(Arc<TaskFailure>),
    Cancelled,
}

/// A duck-typed generic listener attachable via [`Promise::add_callback`],
/// mirroring the design's `PromiseCallback`: implement only the method(s)
/// you need, the rest default to a no-op `false` return. Returning `true`
/// from `on_complete`/`on_exception` stops dispatch to any callback
/// registered after this one in the list; returning `true` from
/// `on_exception` additionally marks the failure as consumed, so
/// [`Promise::wait`] returns `Ok(None)` instead of re-raising it.
pub trait PromiseCallback<T>: Send {
    fn on_complete(&mut self, _result: &T, _promise: &Arc<Promise<T>>) -> bool {
        false
    }
    fn on_exception(&mut self, _promise: &Arc<Promise<T>>, _failure: &TaskFailure) -> bool {
        false
    }
    fn on_cancel(&mut self, _promise: &Arc<Promise<T>>) -> bool {
        false
    }
}

struct State<T> {
    outcome: Outcome<T>,
    on_complete: Option<Box<dyn FnMut(&T) -> bool + Send>>,
    on_exception: Option<Box<dyn FnMut(&TaskFailure) -> bool + Send>>,
    on_cancel: Option<Box<dyn FnMut() -> bool + Send>>,
    callbacks: Vec<Box<dyn PromiseCallback<T>>>,
    chained: Vec<Arc<Promise<T>>>,
    /// Set once an exception handler (single-shot or generic) returns
    /// `true`: the failure is "consumed" and `wait()` resolves to
    /// `Ok(None)` rather than re-raising it.
    consumed_exception: bool,
}

/// A promise for a value of type `T`, deliverable exactly once.
pub struct Promise<T> {
    sync: SyncObject,
    state: Mutex<State<T>>,
}

impl<T: Clone + Send + 'static> Promise<T> {
    pub fn new() -> Arc<Self> {
        Self::named(None)
    }

    pub fn named(name: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            sync: SyncObject::new(name),
            state: Mutex::new(State {
                outcome: Outcome::Pending,
                on_complete: None,
                on_exception: None,
                on_cancel: None,
                callbacks: Vec::new(),
                chained: Vec::new(),
                consumed_exception: false,
            }),
        })
    }

    /// Registers (replacing any prior) completion callback. Fires
    /// immediately, inline, if the promise has already completed.
    pub fn on_complete(self: &Arc<Self>, mut cb: impl FnMut(&T) -> bool + Send + 'static) -> Arc<Self> {
        let _guard = self.sync.enter();
        let mut state = self.state.lock().unwrap();
        if let Outcome::Complete(ref result) = state.outcome {
            cb(result);
        }
        state.on_complete = Some(Box::new(cb));
        self.clone()
    }

    /// Registers (replacing any prior) exception callback. Fires
    /// immediately if the promise has already failed; a truthy return
    /// marks the failure consumed (see [`PromiseCallback`]).
    pub fn on_exception(self: &Arc<Self>, mut cb: impl FnMut(&TaskFailure) -> bool + Send + 'static) -> Arc<Self> {
        let _guard = self.sync.enter();
        let mut state = self.state.lock().unwrap();
        if let Outcome::Failed(ref failure) = state.outcome {
            if cb(failure) {
                state.consumed_exception = true;
            }
        }
        state.on_exception = Some(Box::new(cb));
        self.clone()
    }

    /// Registers (replacing any prior) cancellation callback. Fires
    /// immediately if the promise has already been cancelled.
    pub fn on_cancel(self: &Arc<Self>, mut cb: impl FnMut() -> bool + Send + 'static) -> Arc<Self> {
        let _guard = self.sync.enter();
        let mut state = self.state.lock().unwrap();
        if matches!(state.outcome, Outcome::Cancelled) {
            cb();
        }
        state.on_cancel = Some(Box::new(cb));
        self.clone()
    }

    /// Registers a generic [`PromiseCallback`] listener. If the promise is
    /// already terminal, the matching method fires immediately instead of
    /// being appended to the list (design: "fires immediately if terminal,
    /// else appended to the list").
    pub fn add_callback(self: &Arc<Self>, cb: impl PromiseCallback<T> + 'static) -> Arc<Self> {
        let _guard = self.sync.enter();
        let mut boxed: Box<dyn PromiseCallback<T>> = Box::new(cb);
        let mut state = self.state.lock().unwrap();
        match &state.outcome {
            Outcome::Complete(result) => {
                boxed.on_complete(result, self);
            }
            Outcome::Failed(failure) => {
                if boxed.on_exception(self, failure) {
                    state.consumed_exception = true;
                }
            }
            Outcome::Cancelled => {
                boxed.on_cancel(self);
            }
            Outcome::Pending => {
                state.callbacks.push(boxed);
            }
        }
        self.clone()
    }

    /// Creates a new promise chained to this one via `on_complete`/
    /// `on_exception`, returning the new promise.
    pub fn then(
        self: &Arc<Self>,
        on_complete: Option<impl FnMut(&T) -> bool + Send + 'static>,
        on_exception: Option<impl FnMut(&TaskFailure) -> bool + Send + 'static>,
    ) -> Arc<Self> {
        let next = Self::new();
        if let Some(cb) = on_complete {
            next.on_complete(cb);
        }
        if let Some(cb) = on_exception {
            next.on_exception(cb);
        }
        self.chain(&[next.clone()], true);
        next
    }

    /// Adds `promises` as chained: when `self` delivers, each of
    /// `promises` is delivered with the same outcome. If `self` has
    /// already delivered, the chained promises are delivered immediately.
    /// `cancel_chained` controls whether a cancellation of `self`
    /// propagates to the new chained promises too.
    pub fn chain(self: &Arc<Self>, promises: &[Arc<Promise<T>>], cancel_chained: bool) {
        let _guard = self.sync.enter();
        let mut state = self.state.lock().unwrap();
        match &state.outcome {
            Outcome::Failed(failure) => {
                let failure = failure.clone();
                for p in promises {
                    p.deliver_failure(failure.clone());
                }
            }
            Outcome::Complete(result) => {
                let result = result.clone();
                for p in promises {
                    p.complete(result.clone());
                }
            }
            Outcome::Cancelled if cancel_chained => {
                for p in promises {
                    p.cancel(true);
                }
            }
            _ => state.chained.extend(promises.iter().cloned()),
        }
    }

    /// Delivers the promise as successfully completed. A no-op if the
    /// promise has already transitioned (design: "at most one terminal
    /// transition per promise").
    pub fn complete(self: &Arc<Self>, result: T) {
        let _guard = self.sync.enter();
        let (chained, callbacks) = {
            let mut state = self.state.lock().unwrap();
            if !matches!(state.outcome, Outcome::Pending) {
                return;
            }
            state.outcome = Outcome::Complete(result.clone());
            if let Some(cb) = state.on_complete.as_mut() {
                cb(&result);
            }
            (std::mem::take(&mut state.chained), std::mem::take(&mut state.callbacks))
        };
        for mut cb in callbacks {
            if cb.on_complete(&result, self) {
                break;
            }
        }
        for p in chained {
            p.complete(result.clone());
        }
        self.sync.wakeup(true, 0);
        self.cleanup();
        tracing::trace!(name = ?self.sync.name(), "promise completed");
    }

    /// Delivers the promise as failed. `wait()` re-surfaces this as
    /// [`CoordinationError::TaskFailed`] unless a handler claims it.
    pub fn fail(self: &Arc<Self>, failure: TaskFailure) {
        self.deliver_failure(Arc::new(failure));
    }

    fn deliver_failure(self: &Arc<Self>, failure: Arc<TaskFailure>) {
        let _guard = self.sync.enter();
        let (chained, callbacks, mut consumed) = {
            let mut state = self.state.lock().unwrap();
            if !matches!(state.outcome, Outcome::Pending) {
                return;
            }
            state.outcome = Outcome::Failed(failure.clone());
            let consumed = state.on_exception.as_mut().map(|cb| cb(&failure)).unwrap_or(false);
            (
                std::mem::take(&mut state.chained),
                std::mem::take(&mut state.callbacks),
                consumed,
            )
        };
        for mut cb in callbacks {
            if cb.on_exception(self, &failure) {
                consumed = true;
                break;
            }
        }
        self.state.lock().unwrap().consumed_exception = consumed;
        for p in chained {
            p.deliver_failure(failure.clone());
        }
        self.sync.wakeup(true, 0);
        self.cleanup();
        tracing::trace!(name = ?self.sync.name(), "promise failed");
    }

    /// Cancels the promise. `wait()` returns `Ok(None)` for a cancelled
    /// promise: cancellation is not an error at this layer. A no-op if the
    /// promise has already transitioned.
    pub fn cancel(self: &Arc<Self>, cancel_chained: bool) {
        let _guard = self.sync.enter();
        let (chained, callbacks) = {
            let mut state = self.state.lock().unwrap();
            if !matches!(state.outcome, Outcome::Pending) {
                return;
            }
            if let Some(cb) = state.on_cancel.as_mut() {
                cb();
            }
            state.outcome = Outcome::Cancelled;
            let callbacks = std::mem::take(&mut state.callbacks);
            let chained = if cancel_chained {
                std::mem::take(&mut state.chained)
            } else {
                Vec::new()
            };
            (chained, callbacks)
        };
        for mut cb in callbacks {
            if cb.on_cancel(self) {
                break;
            }
        }
        for p in chained {
            p.cancel(true);
        }
        self.sync.wakeup(true, 0);
        self.cleanup();
    }

    fn cleanup(&self) {
        let mut state = self.state.lock().unwrap();
        state.chained.clear();
        state.callbacks.clear();
        state.on_complete = None;
        state.on_exception = None;
        state.on_cancel = None;
    }

    /// Blocks until the promise is delivered. Returns `Ok(Some(result))`
    /// on success, `Ok(None)` if cancelled or if a failure was consumed by
    /// a handler, `Err(Timeout)` if `timeout` elapses first, or
    /// `Err(TaskFailed)` if the promise failed and no handler claimed it.
    pub fn wait(self: &Arc<Self>, timeout: Option<Duration>) -> Result<Option<T>> {
        let _guard = self.sync.enter();
        self.sync.sleep_until(
            || !matches!(self.state.lock().unwrap().outcome, Outcome::Pending),
            timeout,
        )?;
        let mut state = self.state.lock().unwrap();
        let result = match &state.outcome {
            Outcome::Complete(result) => Ok(Some(result.clone())),
            Outcome::Cancelled => Ok(None),
            Outcome::Failed(failure) => {
                if state.consumed_exception {
                    Ok(None)
                } else {
                    Err(CoordinationError::TaskFailed(match Arc::try_unwrap(failure.clone()) {
                        Ok(f) => f,
                        Err(arc) => TaskFailure::Failed(Box::<dyn std::error::Error + Send + Sync>::from(arc.to_string())),
                    }))
                }
            }
            Outcome::Pending => Err(CoordinationError::Timeout),
        };
        state.chained.clear();
        state.callbacks.clear();
        state.on_complete = None;
        state.on_exception = None;
        state.on_cancel = None;
        result
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state.lock().unwrap().outcome, Outcome::Complete(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.state.lock().unwrap().outcome, Outcome::Cancelled)
    }
}

/// Combines promises such that the combinator completes once every
/// constituent promise has delivered (design: `Promise.all`).
pub struct PromiseAll<T> {
    promises: Vec<Arc<Promise<T>>>,
}

impl<T: Clone + Send + 'static> PromiseAll<T> {
    pub fn new(promises: &[Arc<Promise<T>>]) -> Arc<Self> {
        Arc::new(Self {
            promises: promises.to_vec(),
        })
    }

    /// Blocks until every constituent promise has delivered, waiting on
    /// them in list order — grounded directly on the original's
    /// `ANDPromise.wait`, which is simply `[p.wait(timeout) for p in
    /// self.Promises]`. A constituent's own `wait()` already resolves a
    /// cancellation to `Ok(None)` without raising; the first exception hit
    /// while walking the list short-circuits immediately via `?`, the same
    /// way a raise part-way through that list comprehension would abandon
    /// the remaining, not-yet-waited-on promises.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Vec<Option<T>>> {
        self.promises.iter().map(|p| p.wait(timeout)).collect()
    }
}

/// Combines promises such that the combinator completes as soon as the
/// first constituent promise delivers successfully (design: `Promise.any`).
pub struct PromiseAny<T> {
    sync: SyncObject,
    fulfilled: Mutex<Option<T>>,
}

impl<T: Clone + Send + 'static> PromiseAny<T> {
    pub fn new(promises: &[Arc<Promise<T>>]) -> Arc<Self> {
        let this = Arc::new(Self {
            sync: SyncObject::new(None),
            fulfilled: Mutex::new(None),
        });
        for promise in promises {
            let this2 = this.clone();
            promise.on_complete(move |result| {
                this2.fulfill(result.clone());
                false
            });
        }
        this
    }

    fn fulfill(self: &Arc<Self>, result: T) {
        let _guard = self.sync.enter();
        let mut fulfilled = self.fulfilled.lock().unwrap();
        if fulfilled.is_none() {
            *fulfilled = Some(result);
            self.sync.wakeup(true, 0);
        }
    }

    /// Blocks until one constituent promise completes successfully.
    pub fn wait(self: &Arc<Self>, timeout: Option<Duration>) -> Result<T> {
        let _guard = self.sync.enter();
        self.sync
            .sleep_until(|| self.fulfilled.lock().unwrap().is_some(), timeout)?;
        Ok(self.fulfilled.lock().unwrap().clone().expect("fulfilled"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn complete_delivers_result_to_wait() {
        let p = Promise::<i32>::new();
        let p2 = p.clone();
        thread::spawn(move || p2.complete(42));
        assert_eq!(p.wait(Some(Duration::from_secs(2))).unwrap(), Some(42));
    }

    #[test]
    fn on_complete_fires_immediately_if_already_done() {
        let p = Promise::<i32>::new();
        p.complete(7);
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        p.on_complete(move |r| {
            *seen2.lock().unwrap() = Some(*r);
            true
        });
        assert_eq!(*seen.lock().unwrap(), Some(7));
    }

    #[test]
    fn cancel_resolves_wait_to_none() {
        let p = Promise::<i32>::new();
        p.cancel(true);
        assert_eq!(p.wait(None).unwrap(), None);
    }

    #[test]
    fn fail_surfaces_as_task_failed_error() {
        let p = Promise::<i32>::new();
        p.fail(TaskFailure::Failed(Box::<dyn std::error::Error + Send + Sync>::from("boom")));
        let result = p.wait(None);
        assert!(matches!(result, Err(CoordinationError::TaskFailed(_))));
    }

    #[test]
    fn second_transition_attempt_is_a_no_op() {
        let p = Promise::<i32>::new();
        p.complete(1);
        p.complete(2);
        p.cancel(true);
        assert_eq!(p.wait(None).unwrap(), Some(1));
    }

    #[test]
    fn chain_propagates_completion() {
        let p = Promise::<i32>::new();
        let child = Promise::<i32>::new();
        p.chain(&[child.clone()], true);
        p.complete(99);
        assert_eq!(child.wait(Some(Duration::from_secs(1))).unwrap(), Some(99));
    }

    #[test]
    fn then_chains_a_new_promise() {
        let p = Promise::<i32>::new();
        let next = p.then(Some(|_: &i32| false), None::<fn(&TaskFailure) -> bool>);
        p.complete(3);
        assert_eq!(next.wait(Some(Duration::from_secs(1))).unwrap(), Some(3));
    }

    #[test]
    fn then_onexception_consuming_resolves_wait_to_none() {
        let p = Promise::<i32>::new();
        let handled = Arc::new(AtomicBool::new(false));
        let handled2 = handled.clone();
        let q = p.then(
            None::<fn(&i32) -> bool>,
            Some(move |_failure: &TaskFailure| {
                handled2.store(true, Ordering::SeqCst);
                true
            }),
        );
        p.fail(TaskFailure::Failed(Box::<dyn std::error::Error + Send + Sync>::from("boom")));
        assert!(handled.load(Ordering::SeqCst));
        assert_eq!(q.wait(Some(Duration::from_secs(1))).unwrap(), None);
    }

    #[test]
    fn then_onexception_not_consuming_reraises() {
        let p = Promise::<i32>::new();
        let q = p.then(None::<fn(&i32) -> bool>, Some(|_failure: &TaskFailure| false));
        p.fail(TaskFailure::Failed(Box::<dyn std::error::Error + Send + Sync>::from("boom")));
        let result = q.wait(Some(Duration::from_secs(1)));
        assert!(matches!(result, Err(CoordinationError::TaskFailed(_))));
    }

    struct RecordingCallback {
        seen: Arc<Mutex<Vec<&'static str>>>,
    }

    impl PromiseCallback<i32> for RecordingCallback {
        fn on_complete(&mut self, _result: &i32, _promise: &Arc<Promise<i32>>) -> bool {
            self.seen.lock().unwrap().push("complete");
            false
        }

        fn on_cancel(&mut self, _promise: &Arc<Promise<i32>>) -> bool {
            self.seen.lock().unwrap().push("cancel");
            false
        }
    }

    #[test]
    fn add_callback_fires_for_pending_then_delivered_promise() {
        let p = Promise::<i32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        p.add_callback(RecordingCallback { seen: seen.clone() });
        p.complete(5);
        assert_eq!(*seen.lock().unwrap(), vec!["complete"]);
    }

    #[test]
    fn add_callback_fires_immediately_when_already_terminal() {
        let p = Promise::<i32>::new();
        p.cancel(true);
        let seen = Arc::new(Mutex::new(Vec::new()));
        p.add_callback(RecordingCallback { seen: seen.clone() });
        assert_eq!(*seen.lock().unwrap(), vec!["cancel"]);
    }

    #[test]
    fn promise_all_waits_for_every_constituent() {
        let a = Promise::<i32>::new();
        let b = Promise::<i32>::new();
        let all = PromiseAll::new(&[a.clone(), b.clone()]);
        let b2 = b.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            b2.complete(2);
        });
        a.complete(1);
        let results = all.wait(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(results, vec![Some(1), Some(2)]);
    }

    #[test]
    fn promise_all_resolves_a_cancelled_constituent_to_none() {
        let a = Promise::<i32>::new();
        let b = Promise::<i32>::new();
        a.complete(1);
        b.cancel(true);
        let all = PromiseAll::new(&[a, b]);
        let results = all.wait(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(results, vec![Some(1), None]);
    }

    #[test]
    fn promise_all_short_circuits_on_first_exception() {
        let a = Promise::<i32>::new();
        let b = Promise::<i32>::new();
        a.fail(TaskFailure::Failed(Box::<dyn std::error::Error + Send + Sync>::from("boom")));
        let all = PromiseAll::new(&[a, b.clone()]);
        let result = all.wait(Some(Duration::from_millis(50)));
        assert!(matches!(result, Err(CoordinationError::TaskFailed(_))));
        // b was never waited on, so it is still pending.
        assert!(!b.is_complete());
    }

    #[test]
    fn promise_any_resolves_on_first_completion() {
        let a = Promise::<i32>::new();
        let b = Promise::<i32>::new();
        let any = PromiseAny::new(&[a.clone(), b.clone()]);
        b.complete(55);
        assert_eq!(any.wait(Some(Duration::from_secs(1))).unwrap(), 55);
    }
}
