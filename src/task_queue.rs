//! A staggered, worker-capped task queue.
//!
//! Tasks are appended to an internal [`Deque`] and dispatched onto their
//! own `std::thread` as worker slots and stagger timing allow. A task may
//! ask to repeat: when it finishes, the queue consults the task's
//! remaining run count and repeat interval (and the delegate's veto) to
//! decide whether to leave it in the queue for another run instead of
//! delivering its promise.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::deque::Deque;
use crate::error::{PanicPayload, Result, TaskFailure};
use crate::promise::Promise;
use crate::sync::SyncObject;
use crate::time;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// The work a [`ScheduledTask`] performs. `FunctionTask` is the only
/// implementation most callers need; implement this directly for tasks
/// that want to override [`TaskBody::should_repeat`].
pub trait TaskBody<T>: Send {
    fn run(&mut self) -> std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

    /// Called after a run that asked to repeat, to give the task body a
    /// final veto. Defaults to `true`.
    fn should_repeat(&self) -> bool {
        true
    }
}

/// Wraps a plain closure as a [`TaskBody`].
pub struct FunctionTask<F> {
    f: F,
}

impl<F> FunctionTask<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, T> TaskBody<T> for FunctionTask<F>
where
    F: FnMut() -> std::result::Result<T, Box<dyn std::error::Error + Send + Sync>> + Send,
{
    fn run(&mut self) -> std::result::Result<T, Box<dyn std::error::Error + Send + Sync>> {
        (self.f)()
    }
}

struct Schedule<T> {
    promise: Option<Arc<Promise<T>>>,
    repeat_interval: Option<f64>,
    run_count: Option<u32>,
    after: Option<f64>,
    running: bool,
    last_start: Option<f64>,
    cancelled: bool,
}

/// A task queued (or running, or finished) in a [`TaskQueue`]. Its
/// [`ScheduledTask::promise`] is delivered with the task's result once it
/// finishes (or its last repetition finishes).
pub struct ScheduledTask<T> {
    id: u64,
    pub name: Option<String>,
    pub created: f64,
    queued: Mutex<Option<f64>>,
    started: Mutex<Option<f64>>,
    ended: Mutex<Option<f64>>,
    schedule: Mutex<Schedule<T>>,
    body: Mutex<Box<dyn TaskBody<T>>>,
}

impl<T> PartialEq for ScheduledTask<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T: Clone + Send + 'static> ScheduledTask<T> {
    pub fn new(body: impl TaskBody<T> + 'static) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::SeqCst),
            name: None,
            created: time::now_secs(),
            queued: Mutex::new(None),
            started: Mutex::new(None),
            ended: Mutex::new(None),
            schedule: Mutex::new(Schedule {
                promise: Some(Promise::new()),
                repeat_interval: None,
                run_count: Some(1),
                after: None,
                running: false,
                last_start: None,
                cancelled: false,
            }),
            body: Mutex::new(Box::new(body)),
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.schedule.lock().unwrap().cancelled
    }

    pub fn is_running(&self) -> bool {
        self.schedule.lock().unwrap().running
    }

    pub fn has_started(&self) -> bool {
        self.started.lock().unwrap().is_some()
    }

    /// The promise delivered with this task's result once it (finally)
    /// finishes. Clone it out before the task starts if you plan to wait
    /// on it, since the queue clears its own reference on delivery.
    pub fn promise(&self) -> Option<Arc<Promise<T>>> {
        self.schedule.lock().unwrap().promise.clone()
    }

    /// Cancels the task: if it hasn't started, it won't run; its promise
    /// (if any) is cancelled. Already-running tasks finish uninterrupted.
    pub fn cancel(&self) {
        let mut schedule = self.schedule.lock().unwrap();
        if !schedule.cancelled {
            schedule.cancelled = true;
            if let Some(p) = schedule.promise.take() {
                p.cancel(true);
            }
        }
    }

    fn to_be_repeated(&self) -> bool {
        let schedule = self.schedule.lock().unwrap();
        let interval_wants = schedule.repeat_interval.is_some()
            && schedule.run_count.map_or(true, |c| c > 0);
        let count_wants = schedule.repeat_interval.is_none()
            && schedule.run_count.map_or(false, |c| c > 0);
        (interval_wants || count_wants) && self.body.lock().unwrap().should_repeat()
    }

    fn mark_started(&self) {
        let now = time::now_secs();
        let mut started = self.started.lock().unwrap();
        if started.is_none() {
            *started = Some(now);
        }
        drop(started);
        let mut schedule = self.schedule.lock().unwrap();
        if let Some(count) = schedule.run_count.as_mut() {
            *count -= 1;
        }
        schedule.last_start = Some(now);
        schedule.running = true;
    }

    fn mark_ended(&self) {
        *self.ended.lock().unwrap() = Some(time::now_secs());
        self.schedule.lock().unwrap().running = false;
    }
}

/// Callbacks for observing a [`TaskQueue`]'s dispatch activity. All
/// methods have a default no-op body; implement only what you need.
pub trait TaskQueueDelegate<T>: Send + Sync {
    fn task_is_starting(&self, _task: &Arc<ScheduledTask<T>>) {}
    fn task_started(&self, _task: &Arc<ScheduledTask<T>>) {}
    fn task_ended(&self, _task: &Arc<ScheduledTask<T>>) {}
    fn task_failed(&self, _task: &Arc<ScheduledTask<T>>, _failure: &TaskFailure) {}
    fn task_will_repeat(&self, _task: &Arc<ScheduledTask<T>>) -> bool {
        true
    }
    fn task_cancelled(&self, _task: &Arc<ScheduledTask<T>>) {}
}

/// Tunables for a [`TaskQueue`], mirroring its constructor keyword
/// arguments in the original design.
pub struct TaskQueueConfig {
    pub nworkers: Option<usize>,
    pub capacity: Option<usize>,
    pub stagger: Option<Duration>,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            nworkers: None,
            capacity: None,
            stagger: None,
        }
    }
}

/// Parameters for scheduling a single task, mirroring `append`/`insert`'s
/// keyword arguments.
pub struct ScheduleOptions {
    pub after: Option<f64>,
    pub count: Option<u32>,
    pub interval: Option<f64>,
    pub timeout: Option<Duration>,
    pub force: bool,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            after: None,
            count: None,
            interval: None,
            timeout: None,
            force: false,
        }
    }
}

/// A queue that dispatches tasks onto worker threads subject to a
/// concurrency cap and an optional stagger delay between consecutive
/// starts.
pub struct TaskQueue<T> {
    sync: SyncObject,
    queue: Deque<Arc<ScheduledTask<T>>>,
    nworkers: Option<usize>,
    stagger: Option<Duration>,
    last_start: Mutex<f64>,
    held: AtomicBool,
    stop: AtomicBool,
    delegate: Option<Arc<dyn TaskQueueDelegate<T>>>,
}

impl<T: Clone + Send + 'static> TaskQueue<T> {
    pub fn new(config: TaskQueueConfig, delegate: Option<Arc<dyn TaskQueueDelegate<T>>>) -> Arc<Self> {
        Arc::new(Self {
            sync: SyncObject::new(None),
            queue: Deque::new(config.capacity),
            nworkers: config.nworkers,
            stagger: config.stagger,
            last_start: Mutex::new(0.0),
            held: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            delegate,
        })
    }

    /// Best-effort delegate dispatch: a panicking delegate is caught and
    /// logged rather than tearing down the dispatcher or an executor
    /// thread (design: "exceptions from delegates are swallowed and
    /// logged").
    fn notify(&self, hook: &'static str, f: impl FnOnce(&dyn TaskQueueDelegate<T>)) {
        if let Some(delegate) = &self.delegate {
            let delegate = delegate.as_ref();
            if let Err(panic) = catch_unwind(AssertUnwindSafe(move || f(delegate))) {
                tracing::warn!(
                    queue = ?self.sync.name(),
                    hook,
                    error = %PanicPayload::from_any(panic),
                    "task queue delegate panicked; ignoring"
                );
            }
        }
    }

    /// Asks the delegate whether a repeat should proceed, defaulting to
    /// `true` (no veto) both when there is no delegate and when the
    /// delegate panics.
    fn ask_will_repeat(&self, task: &Arc<ScheduledTask<T>>) -> bool {
        match &self.delegate {
            None => true,
            Some(delegate) => {
                let delegate = delegate.as_ref();
                match catch_unwind(AssertUnwindSafe(|| delegate.task_will_repeat(task))) {
                    Ok(veto) => veto,
                    Err(panic) => {
                        tracing::warn!(
                            queue = ?self.sync.name(),
                            hook = "task_will_repeat",
                            error = %PanicPayload::from_any(panic),
                            "task queue delegate panicked; defaulting to no veto"
                        );
                        true
                    }
                }
            }
        }
    }

    /// Stops the queue: no further tasks will start (already-running ones
    /// finish normally), and further `append`/`insert` calls fail with
    /// [`crate::error::CoordinationError::QueueClosed`].
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.queue.close();
        self.sync.cancel_alarm();
    }

    /// Prevents new tasks from starting without closing the queue; queued
    /// tasks simply wait for [`TaskQueue::release`].
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(self: &Arc<Self>) {
        self.held.store(false, Ordering::SeqCst);
        self.start_tasks();
    }

    /// Appends a task to the back of the queue and kicks off dispatch.
    pub fn append(self: &Arc<Self>, body: impl TaskBody<T> + 'static, options: ScheduleOptions) -> Result<Arc<ScheduledTask<T>>> {
        self.add(body, options, false)
    }

    /// Inserts a task at the front of the queue, otherwise identical to
    /// [`TaskQueue::append`].
    pub fn insert(self: &Arc<Self>, body: impl TaskBody<T> + 'static, options: ScheduleOptions) -> Result<Arc<ScheduledTask<T>>> {
        self.add(body, options, true)
    }

    fn add(
        self: &Arc<Self>,
        body: impl TaskBody<T> + 'static,
        options: ScheduleOptions,
        front: bool,
    ) -> Result<Arc<ScheduledTask<T>>> {
        let task = ScheduledTask::new(body);
        {
            let mut schedule = task.schedule.lock().unwrap();
            schedule.run_count = match (options.interval, options.count) {
                (None, None) => Some(1),
                _ => options.count,
            };
            schedule.repeat_interval = options.interval;
            schedule.after = options.after.map(time::resolve_after);
        }
        if front {
            self.queue.push_front(task.clone(), options.timeout, options.force)?;
        } else {
            self.queue.push_back(task.clone(), options.timeout, options.force)?;
        }
        *task.queued.lock().unwrap() = Some(time::now_secs());
        self.start_tasks();
        Ok(task)
    }

    /// Re-queues a task at the front, bypassing capacity. Used internally
    /// when a repeating task needs to go back in line for its next run.
    fn reinsert(self: &Arc<Self>, task: Arc<ScheduledTask<T>>) {
        let _ = self.queue.push_front(task, None, true);
    }

    pub fn waiting_tasks(&self) -> Vec<Arc<ScheduledTask<T>>> {
        self.queue.items().into_iter().filter(|t| !t.is_running()).collect()
    }

    pub fn active_tasks(&self) -> Vec<Arc<ScheduledTask<T>>> {
        self.queue.items().into_iter().filter(|t| t.is_running()).collect()
    }

    pub fn nrunning(&self) -> usize {
        self.active_tasks().len()
    }

    pub fn nwaiting(&self) -> usize {
        self.waiting_tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn flush(&self) {
        self.queue.flush();
    }

    /// Cancels a queued task and removes it from the queue. Already
    /// running tasks are not interrupted.
    pub fn cancel(self: &Arc<Self>, task: &Arc<ScheduledTask<T>>) {
        task.cancel();
        self.queue.pop_if_first(task);
        tracing::debug!(queue = ?self.sync.name(), task_id = task.id, "task cancelled");
        self.notify("task_cancelled", |d| d.task_cancelled(task));
        self.start_tasks();
    }

    /// Blocks until no tasks are queued or running.
    pub fn wait_until_empty(&self, timeout: Option<Duration>) -> Result<()> {
        let _guard = self.sync.enter();
        self.sync.sleep_until(|| self.queue.is_empty(), timeout)
    }

    /// Blocks until no tasks are currently running (queued-but-not-started
    /// tasks are ignored).
    pub fn drain(&self, timeout: Option<Duration>) -> Result<()> {
        let _guard = self.sync.enter();
        self.sync.sleep_until(|| self.nrunning() == 0, timeout)
    }

    /// Re-evaluates the queue and starts as many eligible tasks as the
    /// worker cap, stagger delay and `after` times allow. Arms an internal
    /// alarm to re-run itself when a task becomes eligible later.
    fn start_tasks(self: &Arc<Self>) {
        let _guard = self.sync.enter();
        self.sync.cancel_alarm();

        for task in self.queue.items() {
            if task.is_cancelled() && !task.is_running() {
                self.queue.pop_if_first(&task);
            }
        }

        loop {
            if self.stop.load(Ordering::SeqCst) || self.held.load(Ordering::SeqCst) {
                return;
            }
            let now = time::now_secs();
            if let Some(stagger) = self.stagger {
                let last = *self.last_start.lock().unwrap();
                if last + stagger.as_secs_f64() > now {
                    let fire_at = last + stagger.as_secs_f64();
                    let this = self.clone();
                    self.sync.alarm(fire_at, move || this.start_tasks());
                    return;
                }
            }
            if self.queue.is_empty() {
                return;
            }
            let nrunning = self.nrunning();
            if let Some(cap) = self.nworkers {
                if nrunning >= cap {
                    return;
                }
            }

            let mut next_task = None;
            let mut sleep_until = None;
            for task in self.waiting_tasks() {
                let after = task.schedule.lock().unwrap().after;
                match after {
                    None => {
                        next_task = Some(task);
                        break;
                    }
                    Some(t) if t <= now => {
                        next_task = Some(task);
                        break;
                    }
                    Some(t) => {
                        sleep_until = Some(sleep_until.map_or(t, |s: f64| s.min(t)));
                    }
                }
            }

            match next_task {
                Some(task) => {
                    *self.last_start.lock().unwrap() = time::now_secs();
                    self.notify("task_is_starting", |d| d.task_is_starting(&task));
                    tracing::debug!(queue = ?self.sync.name(), task_id = task.id, "task starting");
                    self.spawn_executor(task.clone());
                    self.notify("task_started", |d| d.task_started(&task));
                }
                None => {
                    if let Some(t) = sleep_until {
                        let this = self.clone();
                        self.sync.alarm(t, move || this.start_tasks());
                    }
                    return;
                }
            }
        }
    }

    fn spawn_executor(self: &Arc<Self>, task: Arc<ScheduledTask<T>>) {
        task.schedule.lock().unwrap().running = true;
        let queue = self.clone();
        thread::spawn(move || {
            task.mark_started();
            let run_result = catch_unwind(AssertUnwindSafe(|| task.body.lock().unwrap().run()));

            let outcome = match run_result {
                Ok(Ok(value)) => {
                    task.mark_ended();
                    let repeat = task.to_be_repeated() && queue.ask_will_repeat(&task);
                    if repeat {
                        let mut schedule = task.schedule.lock().unwrap();
                        let interval = schedule.repeat_interval.unwrap_or(0.0);
                        let base = schedule.after.unwrap_or_else(|| schedule.last_start.unwrap_or_else(time::now_secs));
                        schedule.after = Some(base + interval);
                        drop(schedule);
                        tracing::debug!(queue = ?queue.sync.name(), task_id = task.id, "task finished; repeat scheduled");
                        None
                    } else {
                        tracing::debug!(queue = ?queue.sync.name(), task_id = task.id, "task ended");
                        queue.notify("task_ended", |d| d.task_ended(&task));
                        Some(Ok(value))
                    }
                }
                Ok(Err(e)) => {
                    task.mark_ended();
                    let failure = TaskFailure::Failed(e);
                    tracing::warn!(queue = ?queue.sync.name(), task_id = task.id, error = %failure, "task failed");
                    queue.notify("task_failed", |d| d.task_failed(&task, &failure));
                    Some(Err(failure))
                }
                Err(panic) => {
                    task.mark_ended();
                    let failure = TaskFailure::Panicked(PanicPayload::from_any(panic));
                    tracing::warn!(queue = ?queue.sync.name(), task_id = task.id, error = %failure, "task panicked");
                    queue.notify("task_failed", |d| d.task_failed(&task, &failure));
                    Some(Err(failure))
                }
            };

            let repeat = outcome.is_none();
            if let Some(result) = outcome {
                let mut schedule = task.schedule.lock().unwrap();
                if let Some(promise) = schedule.promise.take() {
                    drop(schedule);
                    if task.is_cancelled() {
                        promise.cancel(true);
                    } else {
                        match result {
                            Ok(value) => promise.complete(value),
                            Err(failure) => promise.fail(failure),
                        }
                    }
                }
            }

            task.schedule.lock().unwrap().running = false;
            if !repeat {
                queue.queue.pop_if_first(&task);
                let _guard = queue.sync.enter();
                queue.sync.wakeup(true, 0);
            } else {
                queue.reinsert(task.clone());
            }
            queue.start_tasks();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use std::sync::Arc;

    #[test]
    fn runs_a_single_appended_task() {
        let queue: Arc<TaskQueue<()>> = TaskQueue::new(TaskQueueConfig::default(), None);
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        queue
            .append(
                FunctionTask::new(move || {
                    ran2.store(true, Ordering::SeqCst);
                    Ok(())
                }),
                ScheduleOptions::default(),
            )
            .unwrap();
        queue.wait_until_empty(Some(Duration::from_secs(2))).unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn honors_worker_cap() {
        let config = TaskQueueConfig {
            nworkers: Some(1),
            ..Default::default()
        };
        let queue: Arc<TaskQueue<()>> = TaskQueue::new(config, None);
        let active = Arc::new(AtomicI32::new(0));
        let max_seen = Arc::new(AtomicI32::new(0));
        for _ in 0..4 {
            let active = active.clone();
            let max_seen = max_seen.clone();
            queue
                .append(
                    FunctionTask::new(move || {
                        let n = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(n, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }),
                    ScheduleOptions::default(),
                )
                .unwrap();
        }
        queue.wait_until_empty(Some(Duration::from_secs(3))).unwrap();
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn repeating_task_runs_count_times() {
        let queue: Arc<TaskQueue<()>> = TaskQueue::new(TaskQueueConfig::default(), None);
        let runs = Arc::new(AtomicI32::new(0));
        let runs2 = runs.clone();
        queue
            .append(
                FunctionTask::new(move || {
                    runs2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
                ScheduleOptions {
                    count: Some(3),
                    interval: Some(0.01),
                    ..Default::default()
                },
            )
            .unwrap();
        queue.drain(Some(Duration::from_secs(3))).unwrap();
        thread::sleep(Duration::from_millis(50));
        queue.wait_until_empty(Some(Duration::from_secs(3))).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn interval_without_explicit_count_repeats_indefinitely() {
        let queue: Arc<TaskQueue<()>> = TaskQueue::new(TaskQueueConfig::default(), None);
        let runs = Arc::new(AtomicI32::new(0));
        let runs2 = runs.clone();
        queue
            .append(
                FunctionTask::new(move || {
                    runs2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
                ScheduleOptions {
                    interval: Some(0.01),
                    ..Default::default()
                },
            )
            .unwrap();
        thread::sleep(Duration::from_millis(100));
        queue.stop();
        assert!(runs.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn panicking_task_does_not_poison_the_queue() {
        let queue: Arc<TaskQueue<()>> = TaskQueue::new(TaskQueueConfig::default(), None);
        queue
            .append(FunctionTask::new(|| panic!("boom")), ScheduleOptions::default())
            .unwrap();
        queue.wait_until_empty(Some(Duration::from_secs(2))).unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        queue
            .append(
                FunctionTask::new(move || {
                    ran2.store(true, Ordering::SeqCst);
                    Ok(())
                }),
                ScheduleOptions::default(),
            )
            .unwrap();
        queue.wait_until_empty(Some(Duration::from_secs(2))).unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
