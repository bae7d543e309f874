//! Closeable blocking FIFO for handing owned items between threads.
//!
//! A mutex/condvar queue with three access styles per operation:
//! blocking, timed, and best-effort. Closing the queue wakes every
//! blocked waiter; items already queued can still be drained afterwards.
//!
//! # Overview
//!
//! - [`ConcurrentQueue::push`] / [`ConcurrentQueue::try_push`]
//! - [`ConcurrentQueue::pop`] / [`ConcurrentQueue::pop_timeout`] /
//!   [`ConcurrentQueue::try_pop`]
//! - [`ConcurrentQueue::flush`] family: detach the entire backlog in a
//!   single synchronization step
//!
//! # Ownership
//!
//! A pushed item belongs to the queue; a popped item belongs to the
//! caller. Items still queued when the queue is dropped are dropped with
//! it.
//!
//! # Example
//!
//! ```
//! use framewire::sync::queue::ConcurrentQueue;
//!
//! let queue = ConcurrentQueue::new();
//! assert!(queue.push(7u32));
//! assert_eq!(queue.pop(), Some(7));
//! queue.close();
//! assert_eq!(queue.pop(), None);
//! ```

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use minstant::Instant;

struct State<T> {
    fifo: VecDeque<T>,
    open: bool,
}

/// Thread-safe closeable FIFO of owned items.
pub struct ConcurrentQueue<T> {
    state: Mutex<State<T>>,
    available: Condvar,
}

impl<T> Default for ConcurrentQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConcurrentQueue<T> {
    /// Creates an empty, open queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                fifo: VecDeque::new(),
                open: true,
            }),
            available: Condvar::new(),
        }
    }

    // The state is a plain FIFO plus a flag; a panic elsewhere cannot leave
    // it inconsistent, so a poisoned lock is recovered rather than spread.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pushes an item, waking one waiter.
    ///
    /// Returns `false` (and drops the item) if the queue is closed.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.lock();
        if !state.open {
            return false;
        }
        state.fifo.push_back(item);
        drop(state);
        self.available.notify_one();
        true
    }

    /// Best-effort push: gives the item back if the lock is contended or
    /// the queue is closed.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` when the push did not happen.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let Ok(mut state) = self.state.try_lock() else {
            return Err(item);
        };
        if !state.open {
            return Err(item);
        }
        state.fifo.push_back(item);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Pops one item, blocking while the queue is open and empty.
    ///
    /// Returns `None` only once the queue is closed *and* drained.
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        let mut state = self.lock();
        while state.open && state.fifo.is_empty() {
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.fifo.pop_front()
    }

    /// Pops one item, waiting at most `timeout`.
    ///
    /// Returns `None` on timeout as well as on close-and-drained.
    #[must_use]
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.open && state.fifo.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline.duration_since(now))
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        state.fifo.pop_front()
    }

    /// Best-effort pop: `None` if the lock is contended or nothing is
    /// queued.
    #[must_use]
    pub fn try_pop(&self) -> Option<T> {
        let Ok(mut state) = self.state.try_lock() else {
            return None;
        };
        state.fifo.pop_front()
    }

    /// Detaches and returns the whole backlog, blocking while the queue is
    /// open and empty.
    ///
    /// The queue is left empty; many items are claimed under a single
    /// lock acquisition. Returns `None` once the queue is closed and
    /// drained.
    #[must_use]
    pub fn flush(&self) -> Option<VecDeque<T>> {
        let mut state = self.lock();
        while state.open && state.fifo.is_empty() {
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Self::take_backlog(&mut state)
    }

    /// As [`ConcurrentQueue::flush`], waiting at most `timeout`.
    #[must_use]
    pub fn flush_timeout(&self, timeout: Duration) -> Option<VecDeque<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.open && state.fifo.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline.duration_since(now))
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        Self::take_backlog(&mut state)
    }

    /// Best-effort flush: `None` if the lock is contended or nothing is
    /// queued.
    #[must_use]
    pub fn try_flush(&self) -> Option<VecDeque<T>> {
        let Ok(mut state) = self.state.try_lock() else {
            return None;
        };
        Self::take_backlog(&mut state)
    }

    fn take_backlog(state: &mut State<T>) -> Option<VecDeque<T>> {
        if state.fifo.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut state.fifo))
        }
    }

    /// Closes the queue and wakes every blocked waiter.
    ///
    /// Pending pops drain the remaining items and then return `None`.
    /// Idempotent.
    pub fn close(&self) {
        let mut state = self.lock();
        state.open = false;
        drop(state);
        self.available.notify_all();
    }

    /// Whether [`ConcurrentQueue::close`] has not been called yet.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// Number of items currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().fifo.len()
    }

    /// Whether the queue is currently empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().fifo.is_empty()
    }
}
