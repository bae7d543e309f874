//! Readiness multiplexer: wait on many descriptors, read on a pool.
//!
//! A [`Multiplexer`] owns a registry of [`Reader`]s, a poll thread and a
//! worker pool. The poll thread rebuilds the descriptor set from every
//! alive, not-currently-queued reader, waits for readiness with a short
//! bounded interval (so registrations and removals are picked up promptly
//! rather than parking in an unbounded wait), and posts each ready reader
//! id to the pool. A reader marked `in_queue` is excluded from the set
//! until its in-flight `read()` returns, which is what guarantees a
//! single reader is never entered by two workers at once, while distinct
//! readers proceed in parallel across the pool.
//!
//! A reader leaves the registry when its descriptor disappears, when its
//! `read()` returns `false`, or when [`Multiplexer::kill`] is called.

use std::collections::HashMap;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rustix::event::{PollFd, PollFlags};

use crate::net::{Endpoint, UdpSocket};
use crate::runtime::pool::WorkerPool;
use crate::trace::{debug, error, info, warn};

/// Entity that can be multiplexed: a pollable descriptor plus a one-shot
/// drain operation.
///
/// `read` is never re-entered: the multiplexer dispatches a reader again
/// only after the previous call returned.
pub trait Reader: Send + Sync + 'static {
    /// The descriptor to wait on, or `None` once the reader is closed.
    fn descriptor(&self) -> Option<RawFd>;

    /// Drains readable data once. Returning `false` tears the reader
    /// down.
    fn read(&self) -> bool;

    /// Marks the reader closed; its descriptor must stop being offered.
    fn close(&self);
}

/// Identifier assigned by [`Multiplexer::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReaderId(u64);

impl std::fmt::Display for ReaderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

struct ReaderEntry {
    reader: Arc<dyn Reader>,
    /// Cleared by kill; a dead entry is skipped until swept.
    alive: bool,
    /// Set while the reader sits in the pool queue or inside `read()`.
    in_queue: bool,
}

struct Registry {
    readers: Mutex<HashMap<u64, ReaderEntry>>,
    next_id: AtomicU64,
    name: String,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, ReaderEntry>> {
        self.readers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks a reader dead, closes it and drops the entry.
    fn kill(&self, id: u64) {
        let mut readers = self.lock();
        if let Some(mut entry) = readers.remove(&id) {
            entry.alive = false;
            drop(readers);
            entry.reader.close();
            debug!(select = %self.name, reader = id, "reader killed");
        }
    }
}

/// Configuration for [`Multiplexer::new`].
pub struct MultiplexerConfig {
    /// Worker pool size for `read()` fan-out.
    pub workers: usize,
    /// Upper bound on one readiness wait; also how quickly added or
    /// removed readers take effect.
    pub poll_interval: Duration,
    /// Prefix for the poll and worker thread names.
    pub name: String,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_millis(10),
            name: "select".to_owned(),
        }
    }
}

/// Registry of pollable readers fanned out to a worker pool.
pub struct Multiplexer {
    registry: Arc<Registry>,
    pool: Arc<WorkerPool<ReaderId>>,
    running: Arc<AtomicBool>,
    poll_thread: Option<JoinHandle<()>>,
}

impl Multiplexer {
    /// Starts the poll thread (named `<name>-select`) and the worker
    /// pool.
    ///
    /// # Panics
    ///
    /// Panics if a thread cannot be spawned.
    #[must_use]
    pub fn new(config: MultiplexerConfig) -> Self {
        let registry = Arc::new(Registry {
            readers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            name: config.name.clone(),
        });
        let pool = {
            let registry = Arc::clone(&registry);
            Arc::new(WorkerPool::new(
                config.workers,
                &config.name,
                move |id: ReaderId| drain_reader(&registry, id),
            ))
        };
        let running = Arc::new(AtomicBool::new(true));
        let poll_thread = {
            let registry = Arc::clone(&registry);
            let pool = Arc::clone(&pool);
            let running = Arc::clone(&running);
            let interval = config.poll_interval;
            thread::Builder::new()
                .name(format!("{}-select", config.name))
                .spawn(move || poll_main(&registry, &pool, &running, interval))
                .expect("failed to spawn select thread")
        };
        info!(select = %config.name, workers = config.workers, "multiplexer started");
        Self {
            registry,
            pool,
            running,
            poll_thread: Some(poll_thread),
        }
    }

    /// Registers a reader; it becomes eligible on the next poll cycle.
    pub fn add(&self, reader: Arc<dyn Reader>) -> ReaderId {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.lock().insert(
            id,
            ReaderEntry {
                reader,
                alive: true,
                in_queue: false,
            },
        );
        debug!(select = %self.registry.name, reader = id, "reader added");
        ReaderId(id)
    }

    /// Closes a reader and removes it from the registry.
    ///
    /// An in-flight `read()` finishes undisturbed; the reader is simply
    /// never dispatched again.
    pub fn kill(&self, id: ReaderId) {
        self.registry.kill(id.0);
    }

    /// Number of registered readers.
    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Resizes the read worker pool. Safe at any time.
    pub fn set_workers(&self, n: usize) {
        self.pool.set_workers(n);
    }

    /// Stops the poll thread and the pool, then closes every remaining
    /// reader.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.poll_thread.take() {
            let _ = thread.join();
        }
        self.pool.stop();
        let readers = std::mem::take(&mut *self.registry.lock());
        for entry in readers.values() {
            entry.reader.close();
        }
        info!(select = %self.registry.name, "multiplexer stopped");
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker callback: one dispatched reader id.
fn drain_reader(registry: &Registry, id: ReaderId) {
    let reader = {
        let readers = registry.lock();
        match readers.get(&id.0) {
            Some(entry) if entry.alive => Arc::clone(&entry.reader),
            _ => return,
        }
    };

    if !reader.read() {
        registry.kill(id.0);
        return;
    }

    // Eligible again for the next poll cycle.
    if let Some(entry) = registry.lock().get_mut(&id.0) {
        entry.in_queue = false;
    }
}

fn poll_main(
    registry: &Registry,
    pool: &WorkerPool<ReaderId>,
    running: &AtomicBool,
    interval: Duration,
) {
    let interval_ms = i32::try_from(interval.as_millis()).unwrap_or(10).max(1);

    while running.load(Ordering::Acquire) {
        // Snapshot the waitable readers. Holding the Arc keeps each
        // reader (and thus its descriptor) alive across the poll call.
        let snapshot: Vec<(u64, Arc<dyn Reader>)> = registry
            .lock()
            .iter()
            .filter(|(_, entry)| entry.alive && !entry.in_queue)
            .map(|(id, entry)| (*id, Arc::clone(&entry.reader)))
            .collect();

        let mut closed: Vec<u64> = Vec::new();
        let mut ids: Vec<u64> = Vec::with_capacity(snapshot.len());
        let mut fds: Vec<PollFd<'_>> = Vec::with_capacity(snapshot.len());
        for (id, reader) in &snapshot {
            match reader.descriptor() {
                Some(fd) => {
                    ids.push(*id);
                    // SAFETY: the snapshot's Arc keeps the reader alive for
                    // the whole poll call; a descriptor invalidated behind
                    // our back surfaces as POLLNVAL below.
                    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
                    fds.push(PollFd::from_borrowed_fd(fd, PollFlags::IN));
                }
                None => closed.push(*id),
            }
        }

        if fds.is_empty() {
            // Nothing to wait on; sleep one interval so new readers are
            // still picked up promptly.
            thread::sleep(interval);
        } else {
            match rustix::event::poll(&mut fds, interval_ms) {
                Ok(0) => {}
                Ok(_) => {
                    for (fd, id) in fds.iter().zip(&ids) {
                        let revents = fd.revents();
                        if revents.contains(PollFlags::NVAL) {
                            closed.push(*id);
                            continue;
                        }
                        // ERR/HUP dispatch too: the read observes the
                        // failure and tears the reader down.
                        if revents.intersects(PollFlags::IN | PollFlags::ERR | PollFlags::HUP) {
                            let mut should_post = false;
                            {
                                let mut readers = registry.lock();
                                if let Some(entry) = readers.get_mut(id)
                                    && entry.alive
                                    && !entry.in_queue
                                {
                                    entry.in_queue = true;
                                    should_post = true;
                                }
                            }
                            if should_post {
                                pool.post(ReaderId(*id));
                            }
                        }
                    }
                }
                Err(e) if e == rustix::io::Errno::INTR => {}
                Err(_e) => {
                    error!(select = %registry.name, error = %_e, "poll failed");
                    thread::sleep(interval);
                }
            }
        }

        for id in closed {
            warn!(select = %registry.name, reader = id, "descriptor gone, removing reader");
            registry.kill(id);
        }
    }
}

/// Ready-made [`Reader`] gluing a [`UdpSocket`] to a byte-eating
/// callback.
///
/// The callback receives each drained datagram and its origin; returning
/// `false` tears the reader down (e.g. on an unrecoverable parse state).
pub struct SocketReader<F> {
    socket: UdpSocket,
    closed: AtomicBool,
    eat: F,
}

/// One drain per dispatch, matching the transport MTU with headroom.
const READ_BUF_SIZE: usize = 4096;

impl<F> SocketReader<F>
where
    F: Fn(&[u8], Endpoint) -> bool + Send + Sync + 'static,
{
    /// Wraps a bound socket and a datagram callback.
    pub fn new(socket: UdpSocket, eat: F) -> Self {
        Self {
            socket,
            closed: AtomicBool::new(false),
            eat,
        }
    }

    /// The wrapped socket's local address, if still retrievable.
    pub fn local_addr(&self) -> std::io::Result<Endpoint> {
        self.socket.local_addr()
    }
}

impl<F> Reader for SocketReader<F>
where
    F: Fn(&[u8], Endpoint) -> bool + Send + Sync + 'static,
{
    fn descriptor(&self) -> Option<RawFd> {
        if self.closed.load(Ordering::Acquire) {
            None
        } else {
            Some(std::os::fd::AsRawFd::as_raw_fd(&self.socket))
        }
    }

    fn read(&self) -> bool {
        let mut buf = [0u8; READ_BUF_SIZE];
        match self.socket.try_recv_from(&mut buf) {
            Ok(Some((n, from))) => (self.eat)(&buf[..n], from),
            // Raced with another wake or spurious readiness; keep going.
            Ok(None) => true,
            Err(_e) => {
                warn!(error = %_e, "socket read failed, tearing down reader");
                false
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
