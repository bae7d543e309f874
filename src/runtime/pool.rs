//! Elastic worker pool over the shared blocking queue.
//!
//! A [`WorkerPool`] distributes owned work items across a set of named
//! threads. Each worker loops "pop one item, invoke the treat callback"
//! until it is told to retire or the queue closes. The pool can grow and
//! shrink at any time: shrinking flags the oldest surplus workers, which
//! finish their current item, report themselves on a retirement queue and
//! are joined lazily on the next [`WorkerPool::post`] or at
//! [`WorkerPool::stop`]; in-flight work is never aborted.
//!
//! A panic escaping the treat callback is caught, logged and terminates
//! only the worker thread it happened on. The pool does not respawn the
//! slot, so repeated panics shrink the available concurrency over time.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::sync::queue::ConcurrentQueue;
use crate::trace::{debug, error, info};

/// Work consumer invoked by pool workers, one item at a time.
///
/// Blanket-implemented for closures, which is the usual way to build a
/// pool: `WorkerPool::new(4, "demux", move |item| ...)`.
pub trait Treat<T>: Send + Sync + 'static {
    /// Processes one item. Runs on a worker thread.
    fn treat(&self, item: T);
}

impl<T, F> Treat<T> for F
where
    F: Fn(T) + Send + Sync + 'static,
{
    fn treat(&self, item: T) {
        self(item);
    }
}

type WorkerId = u64;

struct Shared<T: Send> {
    /// Thread name prefix.
    name: String,
    /// Work items, closed at stop.
    messages: ConcurrentQueue<T>,
    /// Ids of workers that have exited and await a join.
    retired: ConcurrentQueue<WorkerId>,
    treat: Box<dyn Treat<T>>,
}

struct WorkerSlot {
    retire: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// Resizable set of worker threads draining one shared queue.
pub struct WorkerPool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    /// Keyed by spawn id; the lowest ids are the oldest workers.
    workers: Mutex<BTreeMap<WorkerId, WorkerSlot>>,
    next_id: AtomicU64,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Creates a pool with `workers` threads named `<name>-worker-<id>`.
    ///
    /// # Panics
    ///
    /// Panics if a worker thread cannot be spawned.
    pub fn new(workers: usize, name: &str, treat: impl Treat<T>) -> Self {
        let pool = Self {
            shared: Arc::new(Shared {
                name: name.to_owned(),
                messages: ConcurrentQueue::new(),
                retired: ConcurrentQueue::new(),
                treat: Box::new(treat),
            }),
            workers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
        };
        for _ in 0..workers {
            pool.add_worker();
        }
        pool
    }

    fn lock_workers(&self) -> MutexGuard<'_, BTreeMap<WorkerId, WorkerSlot>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues one item for processing.
    ///
    /// Also joins any worker that retired since the last call. Items
    /// posted after [`WorkerPool::stop`] are dropped.
    pub fn post(&self, item: T) {
        self.reap_retired();
        if !self.shared.messages.push(item) {
            debug!(pool = %self.shared.name, "item posted to a stopped pool, dropping");
        }
    }

    /// Current number of workers, counting retiring ones until joined.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.reap_retired();
        self.lock_workers().len()
    }

    /// Grows or shrinks the pool to `n` workers.
    ///
    /// Growing spawns threads immediately. Shrinking flags the oldest
    /// surplus workers for retirement; each finishes its current item
    /// first, so no work is aborted.
    pub fn set_workers(&self, n: usize) {
        self.reap_retired();
        let current = self.lock_workers().len();
        if current < n {
            for _ in 0..n - current {
                self.add_worker();
            }
        } else {
            self.retire_workers(current - n);
        }
    }

    /// Stops the pool: closes the queue, tells every worker to retire and
    /// joins them all.
    ///
    /// Items still queued are dropped with the queue.
    pub fn stop(&self) {
        self.shared.messages.close();
        let mut workers = self.lock_workers();
        for slot in workers.values() {
            slot.retire.store(true, Ordering::Relaxed);
        }
        for (_id, mut slot) in std::mem::take(&mut *workers) {
            if let Some(handle) = slot.handle.take() {
                if handle.join().is_err() {
                    error!(pool = %self.shared.name, worker = _id, "worker thread panicked");
                }
            }
        }
        drop(workers);
        while self.shared.retired.try_pop().is_some() {}
        info!(pool = %self.shared.name, "pool stopped");
    }

    fn add_worker(&self) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let retire = Arc::new(AtomicBool::new(false));
        let shared = Arc::clone(&self.shared);
        let flag = Arc::clone(&retire);
        let handle = thread::Builder::new()
            .name(format!("{}-worker-{id}", self.shared.name))
            .spawn(move || worker_main(&shared, id, &flag))
            .expect("failed to spawn worker thread");
        self.lock_workers().insert(
            id,
            WorkerSlot {
                retire,
                handle: Some(handle),
            },
        );
    }

    /// Flags the `count` oldest not-yet-retiring workers.
    fn retire_workers(&self, count: usize) {
        let workers = self.lock_workers();
        let mut remaining = count;
        for slot in workers.values() {
            if remaining == 0 {
                break;
            }
            if !slot.retire.swap(true, Ordering::Relaxed) {
                remaining -= 1;
            }
        }
    }

    /// Joins workers that reported their own exit.
    fn reap_retired(&self) {
        while let Some(id) = self.shared.retired.try_pop() {
            let slot = self.lock_workers().remove(&id);
            if let Some(mut slot) = slot {
                if let Some(handle) = slot.handle.take() {
                    let _ = handle.join();
                }
                debug!(pool = %self.shared.name, worker = id, "retired worker joined");
            }
        }
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_main<T: Send + 'static>(shared: &Shared<T>, id: WorkerId, retire: &AtomicBool) {
    while !retire.load(Ordering::Relaxed) {
        // None = queue closed and drained.
        let Some(item) = shared.messages.pop() else {
            break;
        };
        if catch_unwind(AssertUnwindSafe(|| shared.treat.treat(item))).is_err() {
            error!(
                pool = %shared.name,
                worker = id,
                "unhandled panic in treat; this worker terminates"
            );
            break;
        }
    }
    shared.retired.push(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn processes_all_items() {
        let seen = Arc::new(AtomicUsize::new(0));
        let pool = {
            let seen = Arc::clone(&seen);
            WorkerPool::new(3, "test", move |n: usize| {
                seen.fetch_add(n, Ordering::Relaxed);
            })
        };
        for _ in 0..100 {
            pool.post(1);
        }
        wait_until(|| seen.load(Ordering::Relaxed) == 100);
        pool.stop();
    }

    #[test]
    fn grow_and_shrink() {
        let pool = WorkerPool::new(1, "resize", |_: u32| {});
        assert_eq!(pool.worker_count(), 1);
        pool.set_workers(4);
        assert_eq!(pool.worker_count(), 4);

        pool.set_workers(1);
        // Retiring workers wake on the next items and report themselves;
        // joins happen lazily inside post().
        for _ in 0..16 {
            pool.post(0);
            thread::sleep(Duration::from_millis(5));
        }
        wait_until(|| pool.worker_count() == 1);
        pool.stop();
    }

    #[test]
    fn panic_kills_one_worker_only() {
        let seen = Arc::new(AtomicUsize::new(0));
        let pool = {
            let seen = Arc::clone(&seen);
            WorkerPool::new(2, "panicky", move |n: i32| {
                if n < 0 {
                    panic!("bad item");
                }
                seen.fetch_add(1, Ordering::Relaxed);
            })
        };
        pool.post(-1);
        for _ in 0..20 {
            pool.post(1);
        }
        wait_until(|| seen.load(Ordering::Relaxed) == 20);
        pool.stop();
    }

    #[test]
    fn stop_joins_every_worker() {
        let pool = WorkerPool::new(4, "stopper", move |_: u32| {
            thread::sleep(Duration::from_millis(5));
        });
        for _ in 0..8 {
            pool.post(0);
        }
        pool.stop();
        assert_eq!(pool.worker_count(), 0);
    }
}
