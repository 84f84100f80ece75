//! # Backend
//!
//! The backend is the kernel object library the manager sits on: it creates
//! maps and opens the readers consuming records out of ring buffer maps. The
//! manager only relies on the traits below, which allows running the whole
//! lifecycle on top of libbpf or fully in memory.
use std::{any::Any, os::fd::RawFd, path::Path};

use anyhow::{anyhow, Result};

use crate::map::{MapCleanupType, MapOptions, MapOrigin, MapSpec};

pub mod libbpf;
pub use libbpf::LibbpfBackend;

pub mod memory;
pub use memory::{MemoryBackend, MemoryFailure, MemoryRing};

/// Kernel object library abstraction.
pub trait Backend: Send + Sync {
    /// Create (or reuse) a map described by `spec`.
    fn load_map(&self, spec: &MapSpec, options: &MapOptions) -> Result<Box<dyn MapObject>>;
    /// Open a new reader on a ring buffer map. Each call returns a fresh
    /// reader, exclusively owned by the caller.
    fn open_reader(
        &self,
        map: &dyn MapObject,
        config: &ReaderConfig,
    ) -> Result<Box<dyn RecordReader>>;
}

/// A map object created by a backend.
pub trait MapObject: Send + Sync {
    fn spec(&self) -> &MapSpec;
    /// Was the map created by us or reused from an existing pin?
    fn origin(&self) -> MapOrigin;
    fn pin_path(&self) -> Option<&Path>;
    /// File descriptor of the map, if it is backed by a kernel object. Useful
    /// for sharing maps with programs.
    fn fd(&self) -> Option<RawFd>;
    /// Release the map, removing its pin if the cleanup policy covers it.
    fn close(self: Box<Self>, cleanup: MapCleanupType) -> Result<()>;
    fn as_any(&self) -> &dyn Any;
}

/// A record read out of a ring buffer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    /// Lane (CPU) the record was produced on.
    pub lane: u32,
    /// Raw sample. Empty for lost records.
    pub data: Vec<u8>,
    /// Number of samples the producer dropped; a non-zero value marks a lost
    /// record.
    pub lost: u64,
}

impl Record {
    pub fn sample(lane: u32, data: &[u8]) -> Record {
        Record {
            lane,
            data: data.to_vec(),
            lost: 0,
        }
    }

    pub fn lost(lane: u32, count: u64) -> Record {
        Record {
            lane,
            data: Vec::new(),
            lost: count,
        }
    }
}

/// Error returned by `RecordReader::read()`.
#[derive(thiserror::Error, Debug)]
pub enum ReadError {
    /// The reader was closed. This is the only way for a blocked read to
    /// return for good and is not an error condition for the consumer.
    #[error("Reader is closed")]
    Closed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Reader on a ring buffer map. All methods can be called concurrently: the
/// consumption loop blocks in `read()` while `pause()`, `resume()` and
/// `close()` are issued by the owner of the reader.
pub trait RecordReader: Send + Sync {
    /// Block until the next record is available.
    fn read(&self) -> Result<Record, ReadError>;
    /// Stop delivering records, without closing the reader.
    fn pause(&self) -> Result<()>;
    /// Re-arm record delivery after a pause.
    fn resume(&self) -> Result<()>;
    /// Close the reader. Pending and future reads return
    /// `ReadError::Closed`.
    fn close(&self) -> Result<()>;
}

/// Configuration used to open a reader.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ReaderConfig {
    /// Size of the per-lane buffer, in bytes.
    pub size: usize,
    /// Number of bytes to accumulate before waking up the reader.
    pub watermark: usize,
}

/// Size of a memory page on the running system.
pub fn page_size() -> Result<usize> {
    let size = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)?
        .ok_or_else(|| anyhow!("Could not retrieve the page size"))?;
    Ok(usize::try_from(size)?)
}

/// Convert a buffer size in bytes to a power-of-two number of pages, as
/// required by perf buffers.
pub(crate) fn size_to_pages(size: usize, page_size: usize) -> usize {
    size.div_ceil(page_size).max(1).next_power_of_two()
}
