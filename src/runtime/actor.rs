//! Addressable actors with strictly serialized dispatch.
//!
//! An [`Actor`] is a unit of sequential message processing: the runtime
//! guarantees that at most one worker is ever inside a given actor, while
//! distinct actors run in parallel across the dispatch pool. Registering
//! an actor moves it into the runtime's slot table and yields a typed
//! [`ActorHandle`], the only way to address it afterwards.
//!
//! # Lifecycle
//!
//! [`ActorHandle::kill`] is cooperative: it clears the alive flag and
//! posts one sentinel message so the actor is visited at least once more.
//! The dispatch step that observes the dead flag removes the actor from
//! the table; messages addressed to an id that is already gone are
//! silently dropped (delivery is best-effort, at most once). Messages
//! already queued when `kill` runs may still execute; the flag only
//! stops dispatch that has not started yet.
//!
//! # Dispatch locking
//!
//! Workers take the registry lock only to look up the cell, then the
//! actor's own lock, then release the registry lock before running user
//! code. The registry is therefore never blocked behind a slow handler,
//! and two messages for the same actor serialize on the actor lock.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::runtime::pool::WorkerPool;
use crate::runtime::scheduler::{DeadlineScheduler, ScheduleHandle};
use crate::trace::{debug, info};

/// A unit of strictly serialized message processing.
///
/// Implementations receive their messages in `treat` and deadline wakes
/// in `timeout`. Both run on dispatch-pool workers, never concurrently
/// for the same actor.
pub trait Actor: Send + 'static {
    /// Message type accepted by [`Actor::treat`].
    type Message: Send + 'static;

    /// Handles one message.
    fn treat(&mut self, msg: Self::Message);

    /// Handles a scheduled timeout. Default: ignore.
    fn timeout(&mut self) {}
}

/// Opaque actor identifier. Stable for the life of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActorId(u64);

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Type-erased message: applied to the actor body under the actor lock.
type Thunk = Box<dyn FnOnce(&mut (dyn Any + Send)) + Send>;

/// One dispatch-pool work item. `thunk: None` is the kill sentinel.
struct Envelope {
    id: u64,
    thunk: Option<Thunk>,
}

/// Slot-table entry. The registry owns the actor from registration until
/// the dispatch step that observes `alive == false` removes it.
struct ActorCell {
    alive: AtomicBool,
    body: Mutex<Box<dyn Any + Send>>,
}

struct Registry {
    actors: Mutex<HashMap<u64, Arc<ActorCell>>>,
    next_id: AtomicU64,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<ActorCell>>> {
        self.actors.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct RuntimeShared {
    registry: Arc<Registry>,
    pool: Arc<WorkerPool<Envelope>>,
    timers: ScheduleHandle<Envelope>,
}

impl RuntimeShared {
    fn post(&self, id: u64, thunk: Option<Thunk>) {
        self.pool.post(Envelope { id, thunk });
    }

    fn kill(&self, id: u64) {
        let actors = self.registry.lock();
        let Some(cell) = actors.get(&id) else {
            return;
        };
        cell.alive.store(false, Ordering::Release);
        drop(actors);
        // The sentinel guarantees one more visit, which performs removal.
        self.post(id, None);
    }
}

/// Typed, cloneable address of a registered actor.
///
/// All actions go through the runtime by id; the handle never touches
/// the actor directly and stays valid (but inert) after the actor dies.
pub struct ActorHandle<A: Actor> {
    id: ActorId,
    shared: Arc<RuntimeShared>,
    _actor: PhantomData<fn(A)>,
}

impl<A: Actor> Clone for ActorHandle<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            shared: Arc::clone(&self.shared),
            _actor: PhantomData,
        }
    }
}

impl<A: Actor> ActorHandle<A> {
    /// The actor's id.
    #[must_use]
    pub fn id(&self) -> ActorId {
        self.id
    }

    /// Posts a message; the caller never blocks beyond queue contention.
    pub fn post(&self, msg: A::Message) {
        self.shared.post(self.id.0, Some(treat_thunk::<A>(msg)));
    }

    /// Posts a message to be dispatched `delay` from now.
    pub fn post_after(&self, delay: Duration, msg: A::Message) {
        self.shared
            .timers
            .schedule_after(delay, Envelope {
                id: self.id.0,
                thunk: Some(treat_thunk::<A>(msg)),
            });
    }

    /// Schedules a [`Actor::timeout`] wake `delay` from now.
    pub fn schedule_timeout(&self, delay: Duration) {
        self.shared
            .timers
            .schedule_after(delay, Envelope {
                id: self.id.0,
                thunk: Some(timeout_thunk::<A>()),
            });
    }

    /// Kills the actor: no dispatch that starts after the flag is
    /// observed will run user code, and the actor is removed on its next
    /// visit. Messages already being dispatched may still run.
    pub fn kill(&self) {
        self.shared.kill(self.id.0);
    }
}

fn treat_thunk<A: Actor>(msg: A::Message) -> Thunk {
    Box::new(move |body| {
        if let Some(actor) = body.downcast_mut::<A>() {
            actor.treat(msg);
        }
    })
}

fn timeout_thunk<A: Actor>() -> Thunk {
    Box::new(|body| {
        if let Some(actor) = body.downcast_mut::<A>() {
            actor.timeout();
        }
    })
}

/// Configuration for [`ActorRuntime::new`].
pub struct ActorRuntimeConfig {
    /// Dispatch pool size.
    pub workers: usize,
    /// Prefix for worker and timer thread names.
    pub name: String,
}

impl Default for ActorRuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            name: "actor".to_owned(),
        }
    }
}

/// Registry of addressable actors over a dispatch pool and a deadline
/// scheduler.
pub struct ActorRuntime {
    shared: Arc<RuntimeShared>,
    scheduler: Option<DeadlineScheduler<Envelope>>,
}

impl ActorRuntime {
    /// Builds the runtime: a dispatch pool of `config.workers` threads
    /// plus one timer thread.
    ///
    /// # Panics
    ///
    /// Panics if a thread cannot be spawned.
    #[must_use]
    pub fn new(config: ActorRuntimeConfig) -> Self {
        let registry = Arc::new(Registry {
            actors: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        });
        let pool = {
            let registry = Arc::clone(&registry);
            Arc::new(WorkerPool::new(
                config.workers,
                &config.name,
                move |envelope| dispatch(&registry, envelope),
            ))
        };
        let scheduler = {
            let pool = Arc::clone(&pool);
            DeadlineScheduler::new(&config.name, move |envelope| pool.post(envelope))
        };
        let shared = Arc::new(RuntimeShared {
            registry,
            pool,
            timers: scheduler.handle(),
        });
        info!(name = %config.name, workers = config.workers, "actor runtime started");
        Self {
            shared,
            scheduler: Some(scheduler),
        }
    }

    /// Registers an actor, moving it into the runtime.
    pub fn register<A: Actor>(&self, actor: A) -> ActorHandle<A> {
        let registry = &self.shared.registry;
        let id = registry.next_id.fetch_add(1, Ordering::Relaxed);
        let cell = Arc::new(ActorCell {
            alive: AtomicBool::new(true),
            body: Mutex::new(Box::new(actor)),
        });
        registry.lock().insert(id, cell);
        debug!(actor = %ActorId(id), "actor registered");
        ActorHandle {
            id: ActorId(id),
            shared: Arc::clone(&self.shared),
            _actor: PhantomData,
        }
    }

    /// Registers an actor and schedules an initial [`Actor::timeout`].
    pub fn register_with_timeout<A: Actor>(&self, actor: A, delay: Duration) -> ActorHandle<A> {
        let handle = self.register(actor);
        handle.schedule_timeout(delay);
        handle
    }

    /// Whether `id` is still registered with its alive flag set.
    ///
    /// Only a hint: the actor may die right after the call returns.
    #[must_use]
    pub fn is_alive(&self, id: ActorId) -> bool {
        self.shared
            .registry
            .lock()
            .get(&id.0)
            .is_some_and(|cell| cell.alive.load(Ordering::Acquire))
    }

    /// Resizes the dispatch pool. Safe at any time.
    pub fn set_workers(&self, n: usize) {
        self.shared.pool.set_workers(n);
    }

    /// Stops the timer thread and the dispatch pool, joining all of them.
    ///
    /// Undelivered messages and unexpired deadlines are dropped; actors
    /// still registered are dropped with the runtime.
    pub fn shutdown(mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown();
        }
        self.shared.pool.stop();
        info!("actor runtime stopped");
    }
}

impl Drop for ActorRuntime {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown();
        }
        self.shared.pool.stop();
    }
}

/// Worker callback for one `(id, thunk)` pair.
///
/// Lock order: registry, then actor body, then the registry lock is
/// released before user code runs. Removal happens here and only here,
/// at the visit that observes the dead flag.
fn dispatch(registry: &Registry, envelope: Envelope) {
    let mut actors = registry.lock();
    let Some(cell) = actors.get(&envelope.id).map(Arc::clone) else {
        // Already fully removed: best-effort delivery, not an error.
        debug!(actor = envelope.id, "message for unknown actor dropped");
        return;
    };
    let mut body = cell.body.lock().unwrap_or_else(PoisonError::into_inner);
    if cell.alive.load(Ordering::Acquire) {
        drop(actors);
        if let Some(thunk) = envelope.thunk {
            thunk(&mut **body);
        }
    } else {
        actors.remove(&envelope.id);
        drop(actors);
        debug!(actor = envelope.id, "dead actor removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn runtime(workers: usize) -> ActorRuntime {
        ActorRuntime::new(ActorRuntimeConfig {
            workers,
            name: "test".to_owned(),
        })
    }

    fn settle() {
        thread::sleep(Duration::from_millis(100));
    }

    struct Counter {
        count: usize,
        timeouts: Arc<AtomicUsize>,
    }

    impl Actor for Counter {
        type Message = usize;

        fn treat(&mut self, msg: usize) {
            self.count += msg;
        }

        fn timeout(&mut self) {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn messages_reach_the_actor() {
        let runtime = runtime(2);
        let done = Arc::new(AtomicUsize::new(0));

        struct Echo(Arc<AtomicUsize>);
        impl Actor for Echo {
            type Message = usize;
            fn treat(&mut self, msg: usize) {
                self.0.fetch_add(msg, Ordering::Relaxed);
            }
        }

        let handle = runtime.register(Echo(Arc::clone(&done)));
        for _ in 0..50 {
            handle.post(1);
        }
        settle();
        assert_eq!(done.load(Ordering::Relaxed), 50);
        runtime.shutdown();
    }

    #[test]
    fn same_actor_never_runs_concurrently() {
        let runtime = runtime(4);
        let busy = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let handled = Arc::new(AtomicUsize::new(0));

        struct Serial {
            busy: Arc<AtomicBool>,
            overlaps: Arc<AtomicUsize>,
            handled: Arc<AtomicUsize>,
        }
        impl Actor for Serial {
            type Message = ();
            fn treat(&mut self, (): ()) {
                if self.busy.swap(true, Ordering::SeqCst) {
                    self.overlaps.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(1));
                self.busy.store(false, Ordering::SeqCst);
                self.handled.fetch_add(1, Ordering::SeqCst);
            }
        }

        let handle = runtime.register(Serial {
            busy: Arc::clone(&busy),
            overlaps: Arc::clone(&overlaps),
            handled: Arc::clone(&handled),
        });
        for _ in 0..60 {
            handle.post(());
        }
        while handled.load(Ordering::SeqCst) < 60 {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        runtime.shutdown();
    }

    #[test]
    fn distinct_actors_run_in_parallel() {
        let runtime = runtime(2);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        struct Parallel {
            in_flight: Arc<AtomicUsize>,
            peak: Arc<AtomicUsize>,
        }
        impl Actor for Parallel {
            type Message = ();
            fn treat(&mut self, (): ()) {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        }

        for _ in 0..2 {
            let handle = runtime.register(Parallel {
                in_flight: Arc::clone(&in_flight),
                peak: Arc::clone(&peak),
            });
            handle.post(());
        }
        settle();
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        runtime.shutdown();
    }

    #[test]
    fn kill_removes_exactly_once() {
        let runtime = runtime(2);
        let drops = Arc::new(AtomicUsize::new(0));

        struct DropProbe(Arc<AtomicUsize>);
        impl Actor for DropProbe {
            type Message = ();
            fn treat(&mut self, (): ()) {}
        }
        impl Drop for DropProbe {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let handle = runtime.register(DropProbe(Arc::clone(&drops)));
        let id = handle.id();
        handle.post(());
        handle.kill();
        handle.kill();
        settle();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(!runtime.is_alive(id));

        // Messages for the removed id are silently dropped.
        handle.post(());
        settle();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        runtime.shutdown();
    }

    #[test]
    fn no_user_code_after_kill_settles() {
        let runtime = runtime(2);
        let handled = Arc::new(AtomicUsize::new(0));

        struct Tally(Arc<AtomicUsize>);
        impl Actor for Tally {
            type Message = ();
            fn treat(&mut self, (): ()) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let handle = runtime.register(Tally(Arc::clone(&handled)));
        handle.kill();
        settle();
        let after_kill = handled.load(Ordering::SeqCst);
        for _ in 0..10 {
            handle.post(());
        }
        settle();
        assert_eq!(handled.load(Ordering::SeqCst), after_kill);
        runtime.shutdown();
    }

    #[test]
    fn initial_timeout_fires() {
        let runtime = runtime(2);
        let timeouts = Arc::new(AtomicUsize::new(0));
        let handle = runtime.register_with_timeout(
            Counter {
                count: 0,
                timeouts: Arc::clone(&timeouts),
            },
            Duration::from_millis(20),
        );
        settle();
        assert_eq!(timeouts.load(Ordering::Relaxed), 1);
        handle.post(3);
        runtime.shutdown();
    }

    #[test]
    fn post_after_delays_delivery() {
        let runtime = runtime(2);
        let done = Arc::new(AtomicUsize::new(0));

        struct Echo(Arc<AtomicUsize>);
        impl Actor for Echo {
            type Message = usize;
            fn treat(&mut self, msg: usize) {
                self.0.store(msg, Ordering::SeqCst);
            }
        }

        let handle = runtime.register(Echo(Arc::clone(&done)));
        handle.post_after(Duration::from_millis(50), 9);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(done.load(Ordering::SeqCst), 0);
        thread::sleep(Duration::from_millis(120));
        assert_eq!(done.load(Ordering::SeqCst), 9);
        runtime.shutdown();
    }
}
