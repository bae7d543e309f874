//! Runtime and protocol core for peer-to-peer exchange of time-sensitive
//! media fragments over an unreliable transport.
//!
//! The crate is a library layer: the application supplies sockets, actor
//! implementations and a frame consumer, and wires them together from four
//! cooperating pieces:
//!
//! - [`runtime`]: an actor-style concurrency runtime: per-actor serialized
//!   message dispatch over a resizable [`runtime::pool::WorkerPool`], plus a
//!   [`runtime::scheduler::DeadlineScheduler`] for timed messages.
//! - [`net`]: a readiness [`net::select::Multiplexer`] fanning out readable
//!   descriptors to a worker pool without ever re-entering one reader
//!   concurrently.
//! - [`proto`]: a streaming text-envelope parser framing several
//!   sub-protocols over one wire format.
//! - [`media`]: MTU-sized fragmentation and order-tolerant reassembly of
//!   oversized frames.
//!
//! Data path: socket bytes → multiplexer → parser → typed packet → fragment
//! reassembly → completed frame. Control traffic flows through the actor
//! runtime independently of that pipeline. All concurrency is OS-thread
//! based; there are no async tasks anywhere.

pub mod media;
pub mod net;
pub mod proto;
pub mod runtime;
pub mod sync;

mod trace;

pub use trace::init_tracing;
