//! A bounded, double-ended blocking queue.
//!
//! Producers block in [`Deque::push_back`]/[`Deque::push_front`] while the
//! queue is at capacity; consumers block in [`Deque::pop_front`]/
//! [`Deque::pop_back`] while it is empty. Closing the queue wakes every
//! blocked caller: producers get [`CoordinationError::QueueClosed`],
//! consumers get `None`.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{CoordinationError, Result};
use crate::sync::SyncObject;
use crate::time;

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// A capacity-bounded deque shared between producer and consumer threads.
///
/// `capacity = None` means unbounded (pushes never block on room).
pub struct Deque<T> {
    sync: SyncObject,
    capacity: Option<usize>,
    state: Mutex<State<T>>,
}

impl<T> Deque<T> {
    pub fn new(capacity: Option<usize>) -> Self {
        Self::named(None, capacity)
    }

    pub fn named(name: Option<String>, capacity: Option<usize>) -> Self {
        Self {
            sync: SyncObject::new(name),
            capacity,
            state: Mutex::new(State {
                items: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Re-opens a previously closed queue so producers can push again.
    pub fn open(&self) {
        let _guard = self.sync.enter();
        self.state.lock().unwrap().closed = false;
        self.sync.wakeup(true, 0);
    }

    /// Closes the queue: further pushes fail, blocked pushers wake with
    /// [`CoordinationError::QueueClosed`], blocked poppers wake and drain
    /// whatever remains before receiving `None`.
    pub fn close(&self) {
        let _guard = self.sync.enter();
        self.state.lock().unwrap().closed = true;
        self.sync.wakeup(true, 0);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn has_room(&self) -> bool {
        let state = self.state.lock().unwrap();
        match self.capacity {
            Some(cap) => state.items.len() < cap,
            None => true,
        }
    }

    fn wait_for_room(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = time::deadline_from(timeout);
        loop {
            if self.has_room() || self.state.lock().unwrap().closed {
                return Ok(());
            }
            if time::past(deadline) {
                return Err(CoordinationError::Timeout);
            }
            self.sync.sleep(time::remaining(deadline));
        }
    }

    /// Pushes `item` to the back, blocking until there is room (or
    /// `force` is set, which bypasses the capacity check entirely, for
    /// internal re-queues).
    pub fn push_back(&self, item: T, timeout: Option<Duration>, force: bool) -> Result<()> {
        let _guard = self.sync.enter();
        if !force {
            self.wait_for_room(timeout)?;
        }
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(CoordinationError::QueueClosed);
        }
        state.items.push_back(item);
        drop(state);
        self.sync.wakeup(true, 0);
        Ok(())
    }

    /// Pushes `item` to the front, otherwise identical to
    /// [`Deque::push_back`].
    pub fn push_front(&self, item: T, timeout: Option<Duration>, force: bool) -> Result<()> {
        let _guard = self.sync.enter();
        if !force {
            self.wait_for_room(timeout)?;
        }
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(CoordinationError::QueueClosed);
        }
        state.items.push_front(item);
        drop(state);
        self.sync.wakeup(true, 0);
        Ok(())
    }

    /// Pops from the front, blocking while the queue is empty and open.
    /// Returns `None` once the queue is closed and drained, or once
    /// `timeout` elapses with nothing available.
    pub fn pop_front(&self, timeout: Option<Duration>) -> Option<T> {
        self.pop(timeout, true)
    }

    /// Pops from the back; otherwise identical to [`Deque::pop_front`].
    pub fn pop_back(&self, timeout: Option<Duration>) -> Option<T> {
        self.pop(timeout, false)
    }

    fn pop(&self, timeout: Option<Duration>, front: bool) -> Option<T> {
        let _guard = self.sync.enter();
        let deadline = time::deadline_from(timeout);
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if !state.items.is_empty() {
                    let item = if front {
                        state.items.pop_front()
                    } else {
                        state.items.pop_back()
                    };
                    drop(state);
                    self.sync.wakeup(true, 0);
                    return item;
                }
                if state.closed {
                    return None;
                }
            }
            if time::past(deadline) {
                return None;
            }
            self.sync.sleep(time::remaining(deadline));
        }
    }

    /// Drops an item whose position matches the front of the queue
    /// without blocking, if and only if it equals `item`.
    pub fn pop_if_first(&self, item: &T) -> Option<T>
    where
        T: PartialEq + Clone,
    {
        let _guard = self.sync.enter();
        let mut state = self.state.lock().unwrap();
        if state.items.front() == Some(item) {
            let popped = state.items.pop_front();
            drop(state);
            self.sync.wakeup(true, 0);
            return popped;
        }
        None
    }

    /// Discards all queued items without closing the queue.
    pub fn flush(&self) {
        let _guard = self.sync.enter();
        self.state.lock().unwrap().items.clear();
        self.sync.wakeup(true, 0);
    }

    /// A snapshot copy of the currently queued items, front to back.
    pub fn items(&self) -> Vec<T>
    where
        T: Clone,
    {
        let _guard = self.sync.enter();
        self.state.lock().unwrap().items.iter().cloned().collect()
    }

    /// A copy of the item at the front, without removing it.
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let _guard = self.sync.enter();
        self.state.lock().unwrap().items.front().cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }
}
