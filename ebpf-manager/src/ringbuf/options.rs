//! Ring buffer reader options and user callbacks.
use std::{
    fmt,
    sync::{mpsc, Arc},
};

use super::{RingBufferReader, StatsHandle};
use crate::manager::Manager;

/// Called for every sample read out of the ring buffer, with the lane it
/// was produced on. Runs on the consumption thread: slow handlers throttle
/// the reader and may lead the producer to drop samples.
pub type DataHandler = Arc<dyn Fn(u32, &[u8], &RingBufferReader, &Manager) + Send + Sync>;

/// Called when the producer reported lost samples on a lane.
pub type LostHandler = Arc<dyn Fn(u32, u64, &RingBufferReader, &Manager) + Send + Sync>;

/// Called by `Manager::dump()`, returns a human readable state.
pub type DumpHandler = Arc<dyn Fn(&RingBufferReader, &Manager) -> String + Send + Sync>;

/// Ring buffer specific options. They can't be changed once the reader is
/// initialized.
#[derive(Clone, Default)]
pub struct RingBufferOptions {
    /// Size in bytes of the per-lane buffer. Defaults to the manager value
    /// if 0.
    pub ring_buffer_size: usize,
    /// Bytes to accumulate before the reader is woken up. Defaults to the
    /// manager value if 0.
    pub watermark: usize,
    /// Read errors are forwarded here, if set. The channel capacity is up to
    /// the caller: a full channel blocks the consumption thread.
    pub error_channel: Option<mpsc::SyncSender<anyhow::Error>>,
    /// Mandatory.
    pub data_handler: Option<DataHandler>,
    pub lost_handler: Option<LostHandler>,
    pub dump_handler: Option<DumpHandler>,
    /// Accounting is enabled when set.
    pub stats: Option<StatsHandle>,
}

impl RingBufferOptions {
    pub fn new() -> RingBufferOptions {
        Self::default()
    }

    pub fn with_data_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, &[u8], &RingBufferReader, &Manager) + Send + Sync + 'static,
    {
        self.data_handler = Some(Arc::new(f));
        self
    }

    pub fn with_lost_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, u64, &RingBufferReader, &Manager) + Send + Sync + 'static,
    {
        self.lost_handler = Some(Arc::new(f));
        self
    }

    pub fn with_dump_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&RingBufferReader, &Manager) -> String + Send + Sync + 'static,
    {
        self.dump_handler = Some(Arc::new(f));
        self
    }

    pub fn with_error_channel(mut self, tx: mpsc::SyncSender<anyhow::Error>) -> Self {
        self.error_channel = Some(tx);
        self
    }

    pub fn with_stats(mut self, stats: StatsHandle) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn with_ring_buffer_size(mut self, size: usize) -> Self {
        self.ring_buffer_size = size;
        self
    }

    pub fn with_watermark(mut self, watermark: usize) -> Self {
        self.watermark = watermark;
        self
    }
}

impl fmt::Debug for RingBufferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBufferOptions")
            .field("ring_buffer_size", &self.ring_buffer_size)
            .field("watermark", &self.watermark)
            .field("error_channel", &self.error_channel.is_some())
            .field("data_handler", &self.data_handler.is_some())
            .field("lost_handler", &self.lost_handler.is_some())
            .field("dump_handler", &self.dump_handler.is_some())
            .field("stats", &self.stats.is_some())
            .finish()
    }
}
