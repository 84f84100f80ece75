//! # Ring buffers
//!
//! Ring buffer readers stream records produced by BPF programs to user
//! provided handlers, from a dedicated consumption thread per reader.

pub mod options;
pub use options::*;

pub mod reader;
pub use reader::*;

pub mod stats;
pub use stats::*;
