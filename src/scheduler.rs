//! A timeline-driven job scheduler.
//!
//! Jobs are kept on an in-memory timeline ordered by next-fire time. A
//! background thread wakes whenever the nearest job is due, dispatches it
//! onto its own worker thread (subject to the `max_concurrent` cap, which is
//! strictly enforced: a due job found at capacity is left on the timeline and
//! retried shortly after rather than spawned), and re-inserts repeating jobs
//! with their next fire time computed from the job's return value, its
//! `interval`, and its `jitter`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use crate::error::{PanicPayload, TaskFailure};
use crate::promise::Promise;
use crate::sync::SyncObject;
use crate::time;

/// What a job's callable asks the scheduler to do next.
pub enum NextRun {
    /// Do not run this job again.
    Stop,
    /// Run again at this absolute or relative time (resolved the same way
    /// as every other time value in this crate, see [`time::resolve_after`]).
    At(f64),
    /// Run again after `interval` (the job's own configured interval; an
    /// error if the job has none).
    AfterInterval,
}

type JobFn = dyn FnMut() -> std::result::Result<NextRun, Box<dyn std::error::Error + Send + Sync>> + Send;

/// A scheduled unit of work.
pub struct Job {
    pub id: String,
    interval: Option<f64>,
    jitter: f64,
    count: Mutex<Option<u32>>,
    next_t: Mutex<f64>,
    promise: Mutex<Option<Arc<Promise<()>>>>,
    cancelled: AtomicBool,
    f: Mutex<Box<JobFn>>,
}

impl Job {
    pub fn promise(&self) -> Option<Arc<Promise<()>>> {
        self.promise.lock().unwrap().clone()
    }

    pub fn next_fire_time(&self) -> f64 {
        *self.next_t.lock().unwrap()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Options controlling a single [`Scheduler::add`] call.
pub struct JobOptions {
    pub interval: Option<f64>,
    pub t: Option<f64>,
    pub id: Option<String>,
    pub jitter: f64,
    pub count: Option<u32>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            interval: None,
            t: None,
            id: None,
            jitter: 0.0,
            count: None,
        }
    }
}

/// Callbacks for observing job completion, mirroring the design's
/// `jobEnded`/`jobFailed` delegate hooks.
pub trait SchedulerDelegate: Send + Sync {
    fn job_ended(&self, _job: &Arc<Job>) {}
    fn job_failed(&self, _job: &Arc<Job>, _failure: &TaskFailure) {}
}

static NEXT_JOB_ID: AtomicUsize = AtomicUsize::new(1);

fn generate_job_id() -> String {
    format!("job-{}", NEXT_JOB_ID.fetch_add(1, Ordering::SeqCst))
}

fn jittered(base: f64, jitter: f64) -> f64 {
    if jitter <= 0.0 {
        base
    } else {
        base + fastrand::f64() * jitter
    }
}

/// Tunables for a [`Scheduler`], mirroring its constructor keyword
/// arguments in the original design.
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub stop_when_empty: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 100,
            stop_when_empty: false,
        }
    }
}

/// A background-thread-driven timeline of jobs.
pub struct Scheduler {
    sync: SyncObject,
    timeline: Mutex<Vec<Arc<Job>>>,
    max_concurrent: usize,
    running: AtomicUsize,
    stop_when_empty: bool,
    stop: AtomicBool,
    delegate: Option<Arc<dyn SchedulerDelegate>>,
}

impl Scheduler {
    /// Creates and starts a scheduler's background dispatch loop.
    pub fn start(config: SchedulerConfig, delegate: Option<Arc<dyn SchedulerDelegate>>) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            sync: SyncObject::new(None),
            timeline: Mutex::new(Vec::new()),
            max_concurrent: config.max_concurrent,
            running: AtomicUsize::new(0),
            stop_when_empty: config.stop_when_empty,
            stop: AtomicBool::new(false),
            delegate,
        });
        let this = scheduler.clone();
        thread::spawn(move || this.run_loop());
        scheduler
    }

    /// Stops the background dispatch loop. Jobs already running finish
    /// uninterrupted.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _guard = self.sync.enter();
        self.sync.wakeup(true, 0);
    }

    /// Best-effort delegate dispatch: a panicking delegate is caught and
    /// logged rather than tearing down a job's worker thread.
    fn notify(&self, hook: &'static str, f: impl FnOnce(&dyn SchedulerDelegate)) {
        if let Some(delegate) = &self.delegate {
            let delegate = delegate.as_ref();
            if let Err(panic) = catch_unwind(AssertUnwindSafe(move || f(delegate))) {
                tracing::warn!(
                    hook,
                    error = %PanicPayload::from_any(panic),
                    "scheduler delegate panicked; ignoring"
                );
            }
        }
    }

    /// Schedules `f` to run, returning the job and its promise.
    pub fn add(self: &Arc<Self>, f: impl FnMut() -> std::result::Result<NextRun, Box<dyn std::error::Error + Send + Sync>> + Send + 'static, options: JobOptions) -> (Arc<Job>, Arc<Promise<()>>) {
        let now = time::now_secs();
        let t = match options.t {
            Some(t) if t < time::RELATIVE_CUTOFF_SECS => now + t,
            Some(t) => t,
            None => jittered(now + options.interval.unwrap_or(0.0), options.jitter),
        };
        let job = Arc::new(Job {
            id: options.id.unwrap_or_else(generate_job_id),
            interval: options.interval,
            jitter: options.jitter,
            count: Mutex::new(options.count),
            next_t: Mutex::new(t),
            promise: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            f: Mutex::new(Box::new(f)),
        });
        let promise = self.add_job(job.clone(), t);
        (job, promise)
    }

    fn add_job(self: &Arc<Self>, job: Arc<Job>, t: f64) -> Arc<Promise<()>> {
        let _guard = self.sync.enter();
        *job.next_t.lock().unwrap() = t;
        let promise = Promise::new();
        let job_for_cancel = job.clone();
        promise.on_cancel(move || {
            job_for_cancel.cancelled.store(true, Ordering::SeqCst);
            false
        });
        *job.promise.lock().unwrap() = Some(promise.clone());
        self.timeline.lock().unwrap().push(job);
        self.sync.wakeup(true, 0);
        promise
    }

    /// Removes a job from the timeline by id. Does not stop it if it is
    /// currently running.
    pub fn remove(&self, job_id: &str) {
        let _guard = self.sync.enter();
        self.timeline.lock().unwrap().retain(|j| j.id != job_id);
    }

    pub fn jobs(&self) -> Vec<Arc<Job>> {
        let _guard = self.sync.enter();
        self.timeline.lock().unwrap().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.timeline.lock().unwrap().is_empty()
    }

    /// Blocks until the timeline is empty. A currently-running repeating
    /// job is not back on the timeline until it finishes, so this can
    /// return slightly before such a job's next occurrence is scheduled.
    pub fn wait_until_empty(&self, timeout: Option<Duration>) -> crate::error::Result<()> {
        let _guard = self.sync.enter();
        self.sync.sleep_until(|| self.is_empty(), timeout)
    }

    fn run_jobs(self: &Arc<Self>) -> Option<f64> {
        let _guard = self.sync.enter();
        let now = time::now_secs();
        let mut next_run = None;
        let mut keep = Vec::new();
        for job in self.timeline.lock().unwrap().drain(..) {
            if job.is_cancelled() {
                continue;
            }
            let due = *job.next_t.lock().unwrap() <= now;
            if due && self.running.load(Ordering::SeqCst) < self.max_concurrent {
                self.spawn_job(job);
            } else if due {
                // at capacity: retry again very soon instead of spinning
                next_run = Some(next_run.map_or(now + 0.01, |t: f64| t.min(now + 0.01)));
                keep.push(job);
            } else {
                let t = job.next_fire_time();
                next_run = Some(next_run.map_or(t, |r: f64| r.min(t)));
                keep.push(job);
            }
        }
        *self.timeline.lock().unwrap() = keep;
        next_run
    }

    fn spawn_job(self: &Arc<Self>, job: Arc<Job>) {
        self.running.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(job_id = %job.id, "job starting");
        let scheduler = self.clone();
        thread::spawn(move || {
            let start = time::now_secs();
            let promise = job.promise.lock().unwrap().take();
            let outcome = catch_unwind(AssertUnwindSafe(|| (job.f.lock().unwrap())()));

            let (next_t, failure) = match outcome {
                Ok(Ok(next)) => {
                    if let Some(p) = &promise {
                        p.complete(());
                    }
                    (scheduler.resolve_next(&job, next, start), None)
                }
                Ok(Err(e)) => {
                    let failure = TaskFailure::Failed(e);
                    if let Some(p) = &promise {
                        p.fail(clone_for_promise(&failure));
                    }
                    (scheduler.resolve_next(&job, NextRun::AfterInterval, start), Some(failure))
                }
                Err(panic) => {
                    let failure = TaskFailure::Panicked(PanicPayload::from_any(panic));
                    if let Some(p) = &promise {
                        p.fail(clone_for_promise(&failure));
                    }
                    (scheduler.resolve_next(&job, NextRun::AfterInterval, start), Some(failure))
                }
            };

            if let Some(failure) = &failure {
                tracing::warn!(job_id = %job.id, error = %failure, "job failed");
                scheduler.notify("job_failed", |d| d.job_failed(&job, failure));
            } else {
                tracing::debug!(job_id = %job.id, "job ended");
                scheduler.notify("job_ended", |d| d.job_ended(&job));
            }

            if let Some(t) = next_t {
                scheduler.add_job(job, t);
            }
            scheduler.running.fetch_sub(1, Ordering::SeqCst);
            let _guard = scheduler.sync.enter();
            scheduler.sync.wakeup(true, 0);
        });
    }

    fn resolve_next(&self, job: &Arc<Job>, requested: NextRun, start: f64) -> Option<f64> {
        let mut count = job.count.lock().unwrap();
        if let Some(c) = count.as_mut() {
            *c -= 1;
            if *c == 0 {
                return None;
            }
        }
        drop(count);
        match requested {
            NextRun::Stop => None,
            NextRun::At(t) if t < time::RELATIVE_CUTOFF_SECS => Some(jittered(start + t, job.jitter)),
            NextRun::At(t) => Some(t),
            NextRun::AfterInterval => job.interval.map(|interval| jittered(start + interval, job.jitter)),
        }
    }

    fn run_loop(self: Arc<Self>) {
        loop {
            let _guard = self.sync.enter();
            if self.stop.load(Ordering::SeqCst) || (self.is_empty() && self.stop_when_empty) {
                return;
            }
            let delta = if self.timeline.lock().unwrap().is_empty() {
                Duration::from_secs(100)
            } else {
                let next_run = self.run_jobs();
                match next_run {
                    Some(t) => time::remaining(Some(t)).unwrap_or(Duration::ZERO),
                    None => Duration::from_secs(100),
                }
            };
            self.sync.sleep(Some(delta));
        }
    }
}

fn clone_for_promise(failure: &TaskFailure) -> TaskFailure {
    match failure {
        TaskFailure::Panicked(p) => TaskFailure::Panicked(PanicPayload::from_any(Box::new(p.message().to_string()))),
        TaskFailure::Failed(e) => TaskFailure::Failed(Box::<dyn std::error::Error + Send + Sync>::from(e.to_string())),
    }
}

static GLOBAL_SCHEDULER: OnceLock<Arc<Scheduler>> = OnceLock::new();

/// The process-wide default scheduler, started lazily on first access.
pub fn global_scheduler() -> Arc<Scheduler> {
    GLOBAL_SCHEDULER
        .get_or_init(|| Scheduler::start(SchedulerConfig::default(), None))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    // The global scheduler is a process-wide singleton, so any test that
    // touches it must not run concurrently with another such test.
    #[test]
    #[serial_test::serial]
    fn global_scheduler_is_a_lazily_started_singleton() {
        let a = global_scheduler();
        let b = global_scheduler();
        assert!(Arc::ptr_eq(&a, &b));

        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let (_job, promise) = a.add(
            move || {
                ran2.store(true, Ordering::SeqCst);
                Ok(NextRun::Stop)
            },
            JobOptions::default(),
        );
        promise.wait(Some(Duration::from_secs(2))).unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn runs_a_one_shot_job() {
        let scheduler = Scheduler::start(SchedulerConfig::default(), None);
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let (_job, promise) = scheduler.add(
            move || {
                ran2.store(true, Ordering::SeqCst);
                Ok(NextRun::Stop)
            },
            JobOptions::default(),
        );
        promise.wait(Some(Duration::from_secs(2))).unwrap();
        scheduler.stop();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn repeats_on_interval_for_given_count() {
        let scheduler = Scheduler::start(SchedulerConfig::default(), None);
        let runs = Arc::new(AtomicI32::new(0));
        let runs2 = runs.clone();
        scheduler.add(
            move || {
                runs2.fetch_add(1, Ordering::SeqCst);
                Ok(NextRun::AfterInterval)
            },
            JobOptions {
                interval: Some(0.02),
                count: Some(3),
                ..Default::default()
            },
        );
        scheduler.wait_until_empty(Some(Duration::from_secs(3))).unwrap();
        scheduler.stop();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn enforces_max_concurrent() {
        let config = SchedulerConfig {
            max_concurrent: 1,
            ..Default::default()
        };
        let scheduler = Scheduler::start(config, None);
        let active = Arc::new(AtomicI32::new(0));
        let max_seen = Arc::new(AtomicI32::new(0));
        for _ in 0..4 {
            let active = active.clone();
            let max_seen = max_seen.clone();
            scheduler.add(
                move || {
                    let n = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(n, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(30));
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(NextRun::Stop)
                },
                JobOptions::default(),
            );
        }
        scheduler.wait_until_empty(Some(Duration::from_secs(3))).unwrap();
        scheduler.stop();
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_drops_a_pending_job() {
        let scheduler = Scheduler::start(SchedulerConfig::default(), None);
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let (job, _promise) = scheduler.add(
            move || {
                ran2.store(true, Ordering::SeqCst);
                Ok(NextRun::Stop)
            },
            JobOptions {
                t: Some(60.0 * 60.0),
                ..Default::default()
            },
        );
        scheduler.remove(&job.id);
        thread::sleep(Duration::from_millis(50));
        scheduler.stop();
        assert!(!ran.load(Ordering::SeqCst));
        assert!(scheduler.is_empty());
    }
}
