//! Ring buffer read statistics, per lane.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// Read statistics of a ring buffer: bytes read and samples lost per lane,
/// and the number of read errors.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RingBufferStats {
    pub read_errors: u64,
    /// Bytes of raw samples read, per lane.
    pub raw_samples: HashMap<u32, u64>,
    /// Samples the producer dropped, per lane.
    pub lost_samples: HashMap<u32, u64>,
}

impl RingBufferStats {
    pub fn new() -> RingBufferStats {
        Self::default()
    }

    /// Difference between two snapshots, `new - old`, lane by lane. Lanes
    /// missing in `old` count as zero; lanes only present in `old` are
    /// ignored. Values are not clamped: snapshots must be given in order.
    ///
    /// Returns `None` if either snapshot is missing.
    pub fn diff(new: Option<&Self>, old: Option<&Self>) -> Option<RingBufferStats> {
        let (new, old) = (new?, old?);

        let sub = |new: &HashMap<u32, u64>, old: &HashMap<u32, u64>| {
            new.iter()
                .map(|(lane, val)| {
                    (
                        *lane,
                        val.wrapping_sub(old.get(lane).copied().unwrap_or(0)),
                    )
                })
                .collect()
        };

        Some(RingBufferStats {
            read_errors: new.read_errors.wrapping_sub(old.read_errors),
            raw_samples: sub(&new.raw_samples, &old.raw_samples),
            lost_samples: sub(&new.lost_samples, &old.lost_samples),
        })
    }

    /// Bytes read on all lanes.
    pub fn total_raw(&self) -> u64 {
        self.raw_samples.values().sum()
    }

    /// Samples lost on all lanes.
    pub fn total_lost(&self) -> u64 {
        self.lost_samples.values().sum()
    }

    pub(crate) fn add_raw(&mut self, lane: u32, bytes: u64) {
        *self.raw_samples.entry(lane).or_insert(0) += bytes;
    }

    pub(crate) fn add_lost(&mut self, lane: u32, count: u64) {
        *self.lost_samples.entry(lane).or_insert(0) += count;
    }
}

/// Live statistics of a ring buffer reader. Created by the user before
/// init to enable accounting; the consumption thread updates it and
/// `snapshot()` copies it under the same lock.
#[derive(Clone, Default)]
pub struct StatsHandle {
    inner: Arc<Mutex<RingBufferStats>>,
}

impl StatsHandle {
    pub fn new() -> StatsHandle {
        Self::default()
    }

    pub fn snapshot(&self) -> RingBufferStats {
        self.inner.lock().unwrap().clone()
    }

    /// Reset all counters, returning their last values.
    pub fn reset(&self) -> RingBufferStats {
        std::mem::take(&mut *self.inner.lock().unwrap())
    }

    pub(crate) fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut RingBufferStats),
    {
        f(&mut self.inner.lock().unwrap())
    }
}
