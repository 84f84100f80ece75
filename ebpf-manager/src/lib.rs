//! # eBPF manager
//!
//! This crate manages the lifecycle of kernel BPF objects: maps, programs
//! and the ring buffers (perf event arrays or BPF ring buffers) used to
//! stream events out of the kernel. All of them are resources going through
//! the same state machine, driven by a [`Manager`].
//!
//! Each started ring buffer reader owns one consumption thread, which hands
//! the records to user provided handlers and keeps per-lane statistics.
//! Stopping the manager closes the readers and waits for all the
//! consumption threads to exit.

pub mod backend;
pub mod core;
pub use crate::core::*;

pub(crate) mod helpers;

pub mod manager;
pub use manager::*;
pub mod map;
pub use map::*;
pub mod probe;
pub use probe::*;
pub mod ringbuf;
pub use ringbuf::*;
