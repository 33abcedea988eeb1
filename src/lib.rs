//! Reusable concurrency primitives and coordination engines.
//!
//! Every primitive in this crate is built on the reentrant [`sync::SyncObject`]
//! rather than directly on `std::sync::Mutex`: a bounded double-ended
//! blocking queue ([`deque::Deque`]), a single-assignment deferred result
//! with callbacks and chaining ([`promise::Promise`]), a reentrant
//! readers-writer lock ([`rwlock::RWLock`]), a staggered worker-capped task
//! queue ([`task_queue::TaskQueue`]), a timeline-driven job scheduler
//! ([`scheduler::Scheduler`]), and a handful of thin ambient compositions
//! over those ([`helpers::Flag`], [`helpers::Barrier`], [`helpers::Gang`],
//! [`helpers::Processor`]).
//!
//! None of this crate is async; every blocking call parks an OS thread.

pub mod deque;
pub mod error;
pub mod helpers;
pub mod promise;
pub mod rwlock;
pub mod scheduler;
pub mod sync;
pub mod task_queue;
pub mod time;

pub use deque::Deque;
pub use error::{CoordinationError, Result, TaskFailure};
pub use promise::{Promise, PromiseAll, PromiseAny, PromiseCallback};
pub use rwlock::RWLock;
pub use scheduler::{Job, NextRun, Scheduler, SchedulerConfig, SchedulerDelegate};
pub use sync::SyncObject;
pub use task_queue::{FunctionTask, ScheduledTask, TaskQueue, TaskQueueConfig, TaskQueueDelegate};
