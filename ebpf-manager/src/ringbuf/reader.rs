//! Ring buffer reader resource.
//!
//! A reader wraps a ring buffer map. Starting it opens a new backend reader
//! and spawns exactly one consumption thread, which blocks on the backend
//! reader and dispatches records to the user handlers. The thread only exits
//! once the backend reader is closed, which is what stopping the resource
//! does.
use std::{
    sync::{Arc, RwLock},
    thread::{self, ThreadId},
};

use anyhow::{anyhow, Result};
use log::{debug, warn};

use super::{RingBufferOptions, RingBufferStats};
use crate::{
    backend::{ReadError, ReaderConfig, Record, RecordReader},
    core::{CompositeError, Resource, ResourceError, ResourceState},
    helpers::WaitGroupGuard,
    manager::{Manager, WeakManager},
    map::{Map, MapCleanupType, MapOptions, MapSpec},
};

/// Ring buffer reader. Handles are cheap to clone and share the same
/// underlying reader.
#[derive(Clone)]
pub struct RingBufferReader {
    inner: Arc<ReaderInner>,
}

struct ReaderInner {
    map: Map,
    /// Defaults are filled at init time, read-only afterwards.
    options: RwLock<RingBufferOptions>,
    slot: RwLock<ReaderSlot>,
}

#[derive(Default)]
struct ReaderSlot {
    state: ResourceState,
    /// Backend reader, exclusively owned between start and stop.
    reader: Option<Arc<dyn RecordReader>>,
    manager: WeakManager,
    consumer: Option<ThreadId>,
}

impl RingBufferReader {
    pub fn new(spec: MapSpec, map_options: MapOptions, options: RingBufferOptions) -> Self {
        RingBufferReader {
            inner: Arc::new(ReaderInner {
                map: Map::new(spec, map_options),
                options: RwLock::new(options),
                slot: RwLock::new(ReaderSlot::default()),
            }),
        }
    }

    /// The map backing the ring buffer.
    pub fn map(&self) -> &Map {
        &self.inner.map
    }

    pub fn options(&self) -> RingBufferOptions {
        self.inner.options.read().unwrap().clone()
    }

    /// Snapshot of the reader statistics, if accounting is enabled.
    pub fn stats(&self) -> Option<RingBufferStats> {
        self.inner
            .options
            .read()
            .unwrap()
            .stats
            .as_ref()
            .map(|s| s.snapshot())
    }

    /// Id of the thread consuming records, while the reader is started.
    pub fn consumer_thread(&self) -> Option<ThreadId> {
        self.inner.slot.read().unwrap().consumer
    }

    /// Human readable state, as returned by the dump handler.
    pub fn dump(&self, manager: &Manager) -> Option<String> {
        let handler = self.inner.options.read().unwrap().dump_handler.clone();
        handler.map(|h| h(self, manager))
    }

    /// Open a new backend reader and spawn its consumption thread.
    fn spawn_consumer(&self, slot: &mut ReaderSlot) -> Result<()> {
        let manager = slot
            .manager
            .upgrade()
            .ok_or_else(|| anyhow!("Manager of {} is gone", self.name()))?;
        let options = self.options();
        let config = ReaderConfig {
            size: options.ring_buffer_size,
            watermark: options.watermark,
        };

        let reader: Arc<dyn RecordReader> = self
            .inner
            .map
            .with_object(|map| manager.backend().open_reader(map, &config))
            .ok_or_else(|| anyhow!("Map {} is not initialized", self.name()))??
            .into();

        let consumer = Consumer {
            ringbuf: self.clone(),
            reader: Arc::clone(&reader),
            options,
            manager: slot.manager.clone(),
            orphaned: false,
        };
        // Register the consumer before it starts, so a concurrent stop of the
        // manager always waits for it.
        let guard = manager.wait_group().guard();

        match thread::Builder::new()
            .name(format!("rb-{}", self.name()))
            .spawn(move || consumer.run(guard))
        {
            Ok(handle) => slot.consumer = Some(handle.thread().id()),
            Err(e) => {
                let _ = reader.close();
                return Err(anyhow!("Could not spawn consumer for {}: {e}", self.name()));
            }
        }

        slot.reader = Some(reader);
        Ok(())
    }
}

impl Resource for RingBufferReader {
    fn name(&self) -> &str {
        self.inner.map.spec().name.as_str()
    }

    fn state(&self) -> ResourceState {
        self.inner.slot.read().unwrap().state
    }

    fn init(&self, manager: &Manager) -> Result<()> {
        let mut slot = self.inner.slot.write().unwrap();
        if !slot.state.check_init() {
            return Ok(());
        }

        let mut options = self.inner.options.write().unwrap();
        if options.data_handler.is_none() {
            return Err(ResourceError::MissingDataHandler(self.name().to_string()).into());
        }

        self.inner.map.init(manager)?;

        if options.ring_buffer_size == 0 {
            options.ring_buffer_size = manager.options().default_ring_buffer_size;
        }
        if options.watermark == 0 {
            options.watermark = manager.options().default_watermark;
        }

        slot.manager = manager.downgrade();
        slot.state = ResourceState::Initialized;
        debug!(
            "Ring buffer {} initialized (size: {}, watermark: {})",
            self.name(),
            options.ring_buffer_size,
            options.watermark
        );
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let mut slot = self.inner.slot.write().unwrap();
        if !slot.state.check_start(self.name())? {
            return Ok(());
        }

        match slot.state {
            // The reader and its consumer are still there, re-arm them.
            ResourceState::Paused => {
                if let Some(reader) = &slot.reader {
                    reader.resume()?;
                }
            }
            _ => self.spawn_consumer(&mut slot)?,
        }

        slot.state = ResourceState::Running;
        debug!("Ring buffer {} started", self.name());
        Ok(())
    }

    fn stop(&self, cleanup: MapCleanupType) -> Result<()> {
        let mut slot = self.inner.slot.write().unwrap();
        if !slot.state.check_stop() {
            return Ok(());
        }

        let mut errors = Vec::new();
        // Closing the reader is what makes the consumer exit.
        if let Some(reader) = slot.reader.take() {
            if let Err(e) = reader.close() {
                errors.push(e.context(format!("closing reader {}", self.name())));
            }
        }
        if let Err(e) = self.inner.map.close(cleanup) {
            errors.push(e.context(format!("closing map {}", self.name())));
        }

        slot.consumer = None;
        slot.state = ResourceState::Closed;
        debug!("Ring buffer {} stopped", self.name());

        match CompositeError::combine(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn release(&self, cleanup: MapCleanupType) -> Result<()> {
        let mut slot = self.inner.slot.write().unwrap();
        if slot.state != ResourceState::Initialized {
            return Ok(());
        }

        // No reader was opened yet, only the map holds kernel objects.
        slot.state = ResourceState::Closed;
        debug!("Ring buffer {} released", self.name());
        self.inner
            .map
            .close(cleanup)
            .map_err(|e| e.context(format!("closing map {}", self.name())))
    }

    fn pause(&self) -> Result<()> {
        let mut slot = self.inner.slot.write().unwrap();
        slot.state.check_pause(self.name())?;

        if let Some(reader) = &slot.reader {
            reader.pause()?;
        }
        slot.state = ResourceState::Paused;
        debug!("Ring buffer {} paused", self.name());
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        let mut slot = self.inner.slot.write().unwrap();
        slot.state.check_resume(self.name())?;

        if let Some(reader) = &slot.reader {
            reader.resume()?;
        }
        slot.state = ResourceState::Running;
        debug!("Ring buffer {} resumed", self.name());
        Ok(())
    }
}

/// Consumption loop of a reader, running in its own thread.
struct Consumer {
    ringbuf: RingBufferReader,
    reader: Arc<dyn RecordReader>,
    options: RingBufferOptions,
    manager: WeakManager,
    /// Set once the manager is found gone.
    orphaned: bool,
}

impl Consumer {
    /// Consume records until the reader is closed. The guard deregisters the
    /// thread from the manager wait group when dropped, i.e. when we return.
    fn run(mut self, _guard: WaitGroupGuard) {
        let name = self.ringbuf.name().to_string();
        debug!("{name}: consumer started");

        loop {
            match self.reader.read() {
                Ok(record) if record.lost > 0 => self.lost(record),
                Ok(record) => self.sample(record),
                Err(ReadError::Closed) => break,
                Err(ReadError::Other(e)) => self.read_error(e),
            }
        }

        debug!("{name}: consumer exited");
    }

    /// Manager to hand to the handlers. Records can't be dispatched once it
    /// is dropped; this is reported once.
    fn manager(&mut self) -> Option<Manager> {
        let manager = self.manager.upgrade();
        if manager.is_none() && !self.orphaned {
            warn!(
                "{}: manager is gone, records are no longer dispatched to handlers",
                self.ringbuf.name()
            );
            self.orphaned = true;
        }
        manager
    }

    fn sample(&mut self, record: Record) {
        if let Some(stats) = &self.options.stats {
            stats.update(|s| s.add_raw(record.lane, record.data.len() as u64));
        }

        let Some(handler) = self.options.data_handler.clone() else {
            return;
        };
        if let Some(manager) = self.manager() {
            handler(record.lane, &record.data, &self.ringbuf, &manager);
        }
    }

    fn lost(&mut self, record: Record) {
        if let Some(stats) = &self.options.stats {
            stats.update(|s| s.add_lost(record.lane, record.lost));
        }

        let Some(handler) = self.options.lost_handler.clone() else {
            return;
        };
        if let Some(manager) = self.manager() {
            handler(record.lane, record.lost, &self.ringbuf, &manager);
        }
    }

    fn read_error(&self, e: anyhow::Error) {
        if let Some(stats) = &self.options.stats {
            stats.update(|s| s.read_errors += 1);
        }

        match &self.options.error_channel {
            Some(tx) => {
                if tx.send(e).is_err() {
                    warn!("{}: error channel is closed", self.ringbuf.name());
                }
            }
            None => debug!("{}: read error: {e}", self.ringbuf.name()),
        }
    }
}
