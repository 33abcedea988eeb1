//! Small ambient compositions built on top of the core primitives: a
//! one-shot boolean event ([`Flag`]), a rendezvous point for a fixed number
//! of threads ([`Barrier`]), a fixed-size named worker pool ([`Gang`]), and
//! a permit-gated call wrapper ([`Processor`]).
//! None of these add new synchronization primitives of their own; each is
//! a thin, commonly-needed shape built from [`crate::sync::SyncObject`],
//! [`crate::promise::Promise`], [`crate::deque::Deque`] and
//! [`crate::task_queue::TaskQueue`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::deque::Deque;
use crate::error::Result;
use crate::promise::Promise;
use crate::sync::SyncObject;
use crate::task_queue::{FunctionTask, ScheduleOptions, TaskQueue, TaskQueueConfig};

/// A one-shot (or repeatedly re-settable) boolean event other threads can
/// block on.
pub struct Flag {
    sync: SyncObject,
    value: Mutex<bool>,
}

impl Flag {
    pub fn new(value: bool) -> Self {
        Self {
            sync: SyncObject::new(None),
            value: Mutex::new(value),
        }
    }

    pub fn get(&self) -> bool {
        *self.value.lock().unwrap()
    }

    pub fn set(&self, value: bool) {
        let _guard = self.sync.enter();
        *self.value.lock().unwrap() = value;
        self.sync.wakeup(true, 0);
    }

    /// Blocks until the flag's value satisfies `predicate`, or `timeout`
    /// elapses.
    pub fn wait_until(&self, timeout: Option<Duration>, mut predicate: impl FnMut(bool) -> bool) -> Result<()> {
        let _guard = self.sync.enter();
        self.sync.sleep_until(|| predicate(*self.value.lock().unwrap()), timeout)
    }

    /// Blocks until the flag is `true`.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        self.wait_until(timeout, |v| v)
    }
}

/// A rendezvous point for a fixed number of participants: each call to
/// [`Barrier::wait`] blocks until `height` total participants have
/// arrived, then all are released together.
pub struct Barrier {
    sync: SyncObject,
    height: usize,
    waiting: Mutex<Vec<Arc<Promise<()>>>>,
}

impl Barrier {
    pub fn new(height: usize) -> Self {
        Self {
            sync: SyncObject::new(None),
            height,
            waiting: Mutex::new(Vec::new()),
        }
    }

    /// Blocks until `height` participants (including this call) have
    /// arrived at the barrier.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let promise = {
            let _guard = self.sync.enter();
            let mut waiting = self.waiting.lock().unwrap();
            if waiting.len() >= self.height.saturating_sub(1) {
                let arrived = std::mem::take(&mut *waiting);
                drop(waiting);
                for p in arrived {
                    p.complete(());
                }
                return Ok(());
            }
            let promise = Promise::new();
            waiting.push(promise.clone());
            promise
        };
        promise.wait(timeout)?;
        Ok(())
    }

    /// Releases everyone currently waiting, regardless of whether `height`
    /// was reached.
    pub fn flush(&self) {
        let _guard = self.sync.enter();
        let waiting = std::mem::take(&mut *self.waiting.lock().unwrap());
        for p in waiting {
            p.complete(());
        }
    }
}

/// A fixed-size named worker pool: runs the same callable `n` times (once
/// per element of `params`, or `n` times with no argument), fanning out
/// over an internal [`TaskQueue`], and collects every result.
pub struct Gang<T> {
    promises: Vec<Arc<Promise<T>>>,
}

impl<T: Clone + Send + 'static> Gang<T> {
    /// Runs `f(param)` once per entry in `params`, with up to
    /// `concurrency` running at a time (`None` for unlimited).
    pub fn run<P: Send + 'static>(
        f: impl FnMut(P) -> std::result::Result<T, Box<dyn std::error::Error + Send + Sync>> + Clone + Send + 'static,
        params: Vec<P>,
        concurrency: Option<usize>,
        stagger: Option<Duration>,
    ) -> Self {
        let queue = TaskQueue::new(
            TaskQueueConfig {
                nworkers: concurrency,
                stagger,
                ..Default::default()
            },
            None,
        );
        let mut promises = Vec::with_capacity(params.len());
        for param in params {
            let mut f = f.clone();
            let task = queue
                .append(FunctionTask::new(move || f(param)), ScheduleOptions::default())
                .expect("unbounded queue never rejects an append");
            promises.push(task.promise().expect("freshly created task always has a promise"));
        }
        Self { promises }
    }

    /// Blocks until every dispatched call has delivered, returning each
    /// result in input order.
    pub fn wait(&self, timeout: Option<Duration>) -> Vec<Result<Option<T>>> {
        self.promises.iter().map(|p| p.wait(timeout)).collect()
    }
}

/// Wraps a processing closure behind a worker pool and an output queue:
/// [`Processor::put`] enqueues an item, the closure runs on a worker
/// thread, and its result lands on [`Processor::get`]'s output deque.
pub struct Processor<I, O> {
    queue: Arc<TaskQueue<()>>,
    output: Arc<Deque<O>>,
    closed: Mutex<bool>,
    process: Arc<Mutex<Box<dyn FnMut(I) -> std::result::Result<O, Box<dyn std::error::Error + Send + Sync>> + Send>>>,
}

impl<I: Send + 'static, O: Clone + Send + 'static> Processor<I, O> {
    pub fn new(
        config: TaskQueueConfig,
        output_capacity: Option<usize>,
        process: impl FnMut(I) -> std::result::Result<O, Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
    ) -> Self {
        Self {
            queue: TaskQueue::new(config, None),
            output: Arc::new(Deque::new(output_capacity)),
            closed: Mutex::new(false),
            process: Arc::new(Mutex::new(Box::new(process))),
        }
    }

    /// Enqueues `item` for processing, returning a promise delivered once
    /// the item has been fed to the output queue (or failed).
    pub fn put(&self, item: I, timeout: Option<Duration>) -> Result<Arc<Promise<()>>> {
        if *self.closed.lock().unwrap() {
            return Err(crate::error::CoordinationError::QueueClosed);
        }
        let process = self.process.clone();
        let output = self.output.clone();
        let mut slot = Some(item);
        let task = self.queue.append(
            FunctionTask::new(move || {
                let item = slot.take().expect("processor task runs exactly once");
                let result = (process.lock().unwrap())(item);
                if let Ok(value) = &result {
                    let _ = output.push_back(value.clone(), None, true);
                }
                result.map(|_| ())
            }),
            ScheduleOptions {
                timeout,
                count: Some(1),
                interval: None,
                ..Default::default()
            },
        )?;
        Ok(task.promise().expect("freshly created task always has a promise"))
    }

    pub fn get(&self, timeout: Option<Duration>) -> Option<O> {
        self.output.pop_front(timeout)
    }

    pub fn close(&self) {
        *self.closed.lock().unwrap() = true;
        self.output.close();
    }

    pub fn nrunning(&self) -> usize {
        self.queue.nrunning()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn flag_wait_blocks_until_set() {
        let flag = Arc::new(Flag::new(false));
        let flag2 = flag.clone();
        let handle = thread::spawn(move || flag2.wait(Some(Duration::from_secs(2))));
        thread::sleep(Duration::from_millis(30));
        flag.set(true);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn flag_wait_times_out() {
        let flag = Flag::new(false);
        assert!(flag.wait(Some(Duration::from_millis(30))).is_err());
    }

    #[test]
    fn barrier_releases_all_participants_together() {
        let barrier = Arc::new(Barrier::new(3));
        let arrived = Arc::new(AtomicBool::new(false));
        let mut handles = vec![];
        for _ in 0..2 {
            let barrier = barrier.clone();
            let arrived = arrived.clone();
            handles.push(thread::spawn(move || {
                barrier.wait(Some(Duration::from_secs(2))).unwrap();
                arrived.store(true, Ordering::SeqCst);
            }));
        }
        thread::sleep(Duration::from_millis(30));
        assert!(!arrived.load(Ordering::SeqCst));
        barrier.wait(Some(Duration::from_secs(2))).unwrap();
        for h in handles {
            h.join().unwrap();
        }
        assert!(arrived.load(Ordering::SeqCst));
    }

    #[test]
    fn zero_height_barrier_releases_immediately() {
        let barrier = Barrier::new(0);
        barrier.wait(Some(Duration::from_millis(50))).unwrap();
    }

    #[test]
    fn gang_runs_all_params_and_collects_results() {
        let gang = Gang::run(
            |n: i32| Ok::<i32, Box<dyn std::error::Error + Send + Sync>>(n * 2),
            vec![1, 2, 3],
            Some(2),
            None,
        );
        let results: Vec<_> = gang
            .wait(Some(Duration::from_secs(2)))
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();
        let mut sorted = results.clone();
        sorted.sort();
        assert_eq!(sorted, vec![2, 4, 6]);
    }
}
