//! In-memory backend.
//!
//! Maps and ring buffers live in user space, which allows driving the full
//! manager lifecycle without any privilege: records are injected through
//! `MemoryRing` and consumed by the readers exactly like kernel records
//! would be. Failures can be injected per resource name.
use std::{
    any::Any,
    collections::{HashMap, HashSet, VecDeque},
    os::fd::RawFd,
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex},
};

use anyhow::{anyhow, bail, Result};

use super::*;
use crate::map::{MapCleanupType, MapOptions, MapOrigin, MapSpec};

/// Operations which can be forced to fail.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MemoryFailure {
    LoadMap,
    CloseMap,
    OpenReader,
    CloseReader,
    PauseReader,
    ResumeReader,
}

#[derive(Default)]
struct MemoryState {
    rings: HashMap<String, Arc<MemoryRing>>,
    pins: HashSet<PathBuf>,
    failures: HashSet<(String, MemoryFailure)>,
}

/// Backend keeping maps and ring buffers in memory.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> MemoryBackend {
        Self::default()
    }

    /// Ring buffer backing the map `name`. It is created if needed and
    /// outlives the readers opened on it.
    pub fn ring(&self, name: &str) -> Arc<MemoryRing> {
        Arc::clone(
            self.state
                .lock()
                .unwrap()
                .rings
                .entry(name.to_string())
                .or_default(),
        )
    }

    pub fn is_pinned<P: AsRef<Path>>(&self, path: P) -> bool {
        self.state.lock().unwrap().pins.contains(path.as_ref())
    }

    /// Make `op` fail for the resource `name` from now on.
    pub fn inject_failure(&self, name: &str, op: MemoryFailure) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert((name.to_string(), op));
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    fn check(&self, name: &str, op: MemoryFailure) -> Result<()> {
        if self
            .state
            .lock()
            .unwrap()
            .failures
            .contains(&(name.to_string(), op))
        {
            bail!("{name}: injected {op:?} failure");
        }
        Ok(())
    }
}

impl Backend for MemoryBackend {
    fn load_map(&self, spec: &MapSpec, options: &MapOptions) -> Result<Box<dyn MapObject>> {
        self.check(&spec.name, MemoryFailure::LoadMap)?;

        let mut origin = MapOrigin::Internal;
        if let Some(path) = &options.pin_path {
            let mut state = self.state.lock().unwrap();
            if options.reuse_pinned && state.pins.contains(path) {
                origin = MapOrigin::External;
            } else if !state.pins.insert(path.clone()) {
                bail!("Failed to pin map {}: {} exists", spec.name, path.display());
            }
        }

        Ok(Box::new(MemoryMap {
            spec: spec.clone(),
            origin,
            pin_path: options.pin_path.clone(),
            backend: self.clone(),
        }))
    }

    fn open_reader(
        &self,
        map: &dyn MapObject,
        _: &ReaderConfig,
    ) -> Result<Box<dyn RecordReader>> {
        let name = &map.spec().name;
        if !map.spec().kind.is_ring_buffer() {
            bail!(
                "Map {} of type {:?} can't be used as a ring buffer",
                name,
                map.spec().kind
            );
        }
        self.check(name, MemoryFailure::OpenReader)?;

        let ring = self.ring(name);
        let generation = ring.open();
        Ok(Box::new(MemoryReader {
            name: name.clone(),
            ring,
            generation,
            backend: self.clone(),
        }))
    }
}

struct MemoryMap {
    spec: MapSpec,
    origin: MapOrigin,
    pin_path: Option<PathBuf>,
    backend: MemoryBackend,
}

impl MapObject for MemoryMap {
    fn spec(&self) -> &MapSpec {
        &self.spec
    }

    fn origin(&self) -> MapOrigin {
        self.origin
    }

    fn pin_path(&self) -> Option<&Path> {
        self.pin_path.as_deref()
    }

    fn fd(&self) -> Option<RawFd> {
        None
    }

    fn close(self: Box<Self>, cleanup: MapCleanupType) -> Result<()> {
        self.backend.check(&self.spec.name, MemoryFailure::CloseMap)?;

        if let Some(path) = &self.pin_path {
            if cleanup.covers(self.origin) {
                self.backend.state.lock().unwrap().pins.remove(path);
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
struct RingState {
    queue: VecDeque<Result<Record, String>>,
    open: bool,
    paused: bool,
    /// Incremented each time a reader is opened, so a stale reader can't
    /// act on the ring once a new one took over.
    generation: u64,
}

/// In-memory ring buffer, shared by all lanes.
#[derive(Default)]
pub struct MemoryRing {
    state: Mutex<RingState>,
    cond: Condvar,
}

impl MemoryRing {
    /// Queue a data record.
    pub fn push(&self, lane: u32, data: &[u8]) {
        self.enqueue(Ok(Record::sample(lane, data)));
    }

    /// Queue a record reporting `count` lost samples.
    pub fn push_lost(&self, lane: u32, count: u64) {
        self.enqueue(Ok(Record::lost(lane, count)));
    }

    /// Make the next read fail with `msg`.
    pub fn push_error(&self, msg: &str) {
        self.enqueue(Err(msg.to_string()));
    }

    /// Number of entries not consumed yet.
    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Is a reader currently open on the ring?
    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().unwrap().paused
    }

    /// Number of readers opened on the ring so far.
    pub fn readers_opened(&self) -> u64 {
        self.state.lock().unwrap().generation
    }

    fn enqueue(&self, entry: Result<Record, String>) {
        self.state.lock().unwrap().queue.push_back(entry);
        self.cond.notify_all();
    }

    fn open(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.generation += 1;
        state.open = true;
        state.paused = false;
        self.cond.notify_all();
        state.generation
    }

    /// Apply `f` to the ring state if `generation` is still the current
    /// reader.
    fn update<F>(&self, generation: u64, f: F)
    where
        F: FnOnce(&mut RingState),
    {
        let mut state = self.state.lock().unwrap();
        if state.generation == generation {
            f(&mut state);
            self.cond.notify_all();
        }
    }
}

struct MemoryReader {
    name: String,
    ring: Arc<MemoryRing>,
    generation: u64,
    backend: MemoryBackend,
}

impl RecordReader for MemoryReader {
    fn read(&self) -> Result<Record, ReadError> {
        let mut state = self.ring.state.lock().unwrap();
        loop {
            if !state.open || state.generation != self.generation {
                return Err(ReadError::Closed);
            }
            if !state.paused {
                if let Some(entry) = state.queue.pop_front() {
                    return entry.map_err(|e| ReadError::Other(anyhow!(e)));
                }
            }
            state = self.ring.cond.wait(state).unwrap();
        }
    }

    fn pause(&self) -> Result<()> {
        self.backend.check(&self.name, MemoryFailure::PauseReader)?;
        self.ring.update(self.generation, |s| s.paused = true);
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        self.backend.check(&self.name, MemoryFailure::ResumeReader)?;
        self.ring.update(self.generation, |s| s.paused = false);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        // Like close(2), the reader is released even if an error is
        // reported.
        self.ring.update(self.generation, |s| s.open = false);
        self.backend.check(&self.name, MemoryFailure::CloseReader)
    }
}
