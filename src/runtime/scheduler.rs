//! Deadline scheduler: one timer thread dispatching items at their fire
//! time.
//!
//! Newly scheduled entries arrive on a [`ConcurrentQueue`]; the timer
//! thread keeps them in a min-heap ordered by fire time and hands every
//! due item to the posting callback supplied at construction. The thread
//! blocks on the incoming queue while idle, bounded by the remaining time
//! to the nearest deadline (plus a small slack so a wake never lands just
//! before its deadline) while entries are pending.
//!
//! Dispatch across distinct targets follows fire-time order. No ordering
//! is promised between a directly posted message and a just-fired
//! deadline for the same target: both race for the same downstream queue.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use minstant::Instant;

use crate::sync::queue::ConcurrentQueue;
use crate::trace::{info, trace};

/// Wake this much after the nominal deadline to avoid a spurious early
/// wake followed by a second sleep.
const SLACK: Duration = Duration::from_millis(2);

struct Entry<T> {
    fire_at: Instant,
    item: T,
}

// Heap order: earliest deadline on top. Ties are broken arbitrarily.
impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.fire_at.cmp(&self.fire_at)
    }
}

/// Cheap cloneable scheduling endpoint for a running
/// [`DeadlineScheduler`].
pub struct ScheduleHandle<T: Send> {
    incoming: Arc<ConcurrentQueue<Entry<T>>>,
}

impl<T: Send> Clone for ScheduleHandle<T> {
    fn clone(&self) -> Self {
        Self {
            incoming: Arc::clone(&self.incoming),
        }
    }
}

impl<T: Send> ScheduleHandle<T> {
    /// Schedules `item` to be dispatched at `fire_at`.
    ///
    /// A fire time in the past dispatches on the next timer pass. Returns
    /// `false` if the scheduler has shut down.
    pub fn schedule_at(&self, fire_at: Instant, item: T) -> bool {
        self.incoming.push(Entry { fire_at, item })
    }

    /// Schedules `item` to be dispatched `delay` from now.
    pub fn schedule_after(&self, delay: Duration, item: T) -> bool {
        self.schedule_at(Instant::now() + delay, item)
    }
}

/// Dedicated timer thread dispatching deadline-ordered items through a
/// posting callback.
pub struct DeadlineScheduler<T: Send + 'static> {
    incoming: Arc<ConcurrentQueue<Entry<T>>>,
    thread: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> DeadlineScheduler<T> {
    /// Spawns the timer thread, named `<name>-timer`.
    ///
    /// `post` receives every item whose deadline has passed, on the timer
    /// thread, in fire-time order.
    ///
    /// # Panics
    ///
    /// Panics if the timer thread cannot be spawned.
    pub fn new(name: &str, post: impl Fn(T) + Send + 'static) -> Self {
        let incoming = Arc::new(ConcurrentQueue::new());
        let queue = Arc::clone(&incoming);
        let thread = thread::Builder::new()
            .name(format!("{name}-timer"))
            .spawn(move || timer_main(&queue, &post))
            .expect("failed to spawn timer thread");
        Self {
            incoming,
            thread: Some(thread),
        }
    }

    /// Returns a cloneable handle for scheduling entries.
    #[must_use]
    pub fn handle(&self) -> ScheduleHandle<T> {
        ScheduleHandle {
            incoming: Arc::clone(&self.incoming),
        }
    }

    /// Closes the incoming queue and joins the timer thread.
    ///
    /// Entries whose deadline has not passed yet are dropped.
    pub fn shutdown(mut self) {
        self.incoming.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl<T: Send + 'static> Drop for DeadlineScheduler<T> {
    fn drop(&mut self) {
        // Signal the thread; shutdown() is the joining variant.
        self.incoming.close();
    }
}

fn timer_main<T: Send>(incoming: &ConcurrentQueue<Entry<T>>, post: &(impl Fn(T) + Send)) {
    let mut pending: BinaryHeap<Entry<T>> = BinaryHeap::new();
    loop {
        // Wait for a new entry, or until the nearest deadline passes.
        let arrival = match pending.peek() {
            None => incoming.pop(),
            Some(next) => {
                let now = Instant::now();
                let wait = if next.fire_at <= now {
                    Duration::ZERO
                } else {
                    next.fire_at.duration_since(now) + SLACK
                };
                incoming.pop_timeout(wait)
            }
        };
        if let Some(entry) = arrival {
            pending.push(entry);
        }

        while let Some(next) = pending.peek() {
            if next.fire_at > Instant::now() {
                break;
            }
            if let Some(due) = pending.pop() {
                trace!("deadline fired");
                post(due.item);
            }
        }

        if !incoming.is_open() {
            break;
        }
    }
    info!(pending = pending.len(), "timer thread exiting");
}
