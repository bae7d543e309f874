//! Synchronization primitives for in-process communication.
//!
//! This module provides the thread-safe queue used to pass owned work
//! items between threads within the same process.

pub mod queue;
