//! Actor-style concurrency runtime.
//!
//! - `pool`: elastic worker pool draining a shared queue.
//! - `scheduler`: dedicated timer thread dispatching deadline-ordered items.
//! - `actor`: addressable actors with per-actor serialized dispatch, built
//!   on the pool and the scheduler.

pub mod actor;
pub mod pool;
pub mod scheduler;
