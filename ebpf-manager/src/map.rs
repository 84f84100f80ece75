//! # Map
//!
//! Generic map resource. The map object itself is created by the manager
//! backend at init time and released at stop time, following a cleanup
//! policy for pinned maps.
use std::{
    os::fd::RawFd,
    path::PathBuf,
    sync::{Arc, RwLock},
};

use anyhow::Result;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    backend::MapObject,
    core::{Resource, ResourceState},
    manager::Manager,
};

/// Supported map types.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MapKind {
    Hash,
    Array,
    PercpuHash,
    PercpuArray,
    LruHash,
    PerfEventArray,
    RingBuf,
}

impl MapKind {
    /// Can records be streamed out of this map?
    pub fn is_ring_buffer(self) -> bool {
        matches!(self, MapKind::PerfEventArray | MapKind::RingBuf)
    }
}

impl From<MapKind> for libbpf_rs::MapType {
    fn from(kind: MapKind) -> Self {
        use libbpf_rs::MapType;
        match kind {
            MapKind::Hash => MapType::Hash,
            MapKind::Array => MapType::Array,
            MapKind::PercpuHash => MapType::PercpuHash,
            MapKind::PercpuArray => MapType::PercpuArray,
            MapKind::LruHash => MapType::LruHash,
            MapKind::PerfEventArray => MapType::PerfEventArray,
            MapKind::RingBuf => MapType::RingBuf,
        }
    }
}

/// Description of a map.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct MapSpec {
    pub name: String,
    pub kind: MapKind,
    #[serde(default)]
    pub key_size: u32,
    #[serde(default)]
    pub value_size: u32,
    /// Maximum number of entries. For perf event arrays, 0 means one entry
    /// per possible CPU; for BPF ring buffers this is the buffer size in
    /// bytes.
    #[serde(default)]
    pub max_entries: u32,
}

impl MapSpec {
    pub fn new(name: &str, kind: MapKind) -> MapSpec {
        MapSpec {
            name: name.to_string(),
            kind,
            key_size: 0,
            value_size: 0,
            max_entries: 0,
        }
    }

    /// Perf event array with one entry per possible CPU.
    pub fn perf_event_array(name: &str) -> MapSpec {
        MapSpec {
            key_size: 4,
            value_size: 4,
            ..Self::new(name, MapKind::PerfEventArray)
        }
    }

    /// BPF ring buffer of `size` bytes (must be a power-of-two multiple of
    /// the page size).
    pub fn ring_buf(name: &str, size: u32) -> MapSpec {
        MapSpec {
            max_entries: size,
            ..Self::new(name, MapKind::RingBuf)
        }
    }
}

/// Generic map options.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct MapOptions {
    /// Pin the map at this path in the BPF file system.
    pub pin_path: Option<PathBuf>,
    /// If the pin path already exists, reuse the pinned map instead of
    /// creating a new one.
    pub reuse_pinned: bool,
}

/// Where a map object comes from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MapOrigin {
    /// Created by the manager.
    Internal,
    /// Reused from an existing pin.
    External,
}

/// What to do with pinned maps when they are closed. Maps which are not
/// pinned are always released.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MapCleanupType {
    /// Leave all pins in place.
    KeepPinned,
    /// Remove the pins of maps created by the manager.
    #[default]
    CleanInternal,
    /// Remove the pins of maps reused from an existing pin.
    CleanExternal,
    /// Remove all pins.
    CleanAll,
}

impl MapCleanupType {
    /// Should the pin of a map of this origin be removed?
    pub fn covers(self, origin: MapOrigin) -> bool {
        match self {
            MapCleanupType::KeepPinned => false,
            MapCleanupType::CleanInternal => origin == MapOrigin::Internal,
            MapCleanupType::CleanExternal => origin == MapOrigin::External,
            MapCleanupType::CleanAll => true,
        }
    }
}

/// Map resource.
#[derive(Clone)]
pub struct Map {
    inner: Arc<MapInner>,
}

struct MapInner {
    spec: MapSpec,
    options: MapOptions,
    slot: RwLock<MapSlot>,
}

#[derive(Default)]
struct MapSlot {
    state: ResourceState,
    object: Option<Box<dyn MapObject>>,
}

impl Map {
    pub fn new(spec: MapSpec, options: MapOptions) -> Map {
        Map {
            inner: Arc::new(MapInner {
                spec,
                options,
                slot: RwLock::new(MapSlot::default()),
            }),
        }
    }

    pub fn spec(&self) -> &MapSpec {
        &self.inner.spec
    }

    pub fn options(&self) -> &MapOptions {
        &self.inner.options
    }

    /// File descriptor of the underlying map, once initialized.
    pub fn fd(&self) -> Option<RawFd> {
        self.with_object(|o| o.fd()).flatten()
    }

    /// Run `f` on the underlying map object, if the map was initialized and
    /// not closed.
    pub fn with_object<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&dyn MapObject) -> R,
    {
        let slot = self.inner.slot.read().unwrap();
        slot.object.as_deref().map(f)
    }

    /// Release the map object, whatever the state of the resource, and mark
    /// it as closed. Used by resources embedding a map.
    pub(crate) fn close(&self, cleanup: MapCleanupType) -> Result<()> {
        let mut slot = self.inner.slot.write().unwrap();
        self.release_object(&mut slot, cleanup)
    }

    fn release_object(&self, slot: &mut MapSlot, cleanup: MapCleanupType) -> Result<()> {
        slot.state = ResourceState::Closed;

        match slot.object.take() {
            Some(object) => {
                debug!("Closing map {}", self.inner.spec.name);
                object.close(cleanup)
            }
            None => Ok(()),
        }
    }
}

impl Resource for Map {
    fn name(&self) -> &str {
        &self.inner.spec.name
    }

    fn state(&self) -> ResourceState {
        self.inner.slot.read().unwrap().state
    }

    fn init(&self, manager: &Manager) -> Result<()> {
        let mut slot = self.inner.slot.write().unwrap();
        if !slot.state.check_init() {
            return Ok(());
        }

        slot.object = Some(
            manager
                .backend()
                .load_map(&self.inner.spec, &self.inner.options)?,
        );
        slot.state = ResourceState::Initialized;
        debug!("Map {} initialized", self.inner.spec.name);
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let mut slot = self.inner.slot.write().unwrap();
        if slot.state.check_start(self.name())? {
            slot.state = ResourceState::Running;
        }
        Ok(())
    }

    fn stop(&self, cleanup: MapCleanupType) -> Result<()> {
        let mut slot = self.inner.slot.write().unwrap();
        if !slot.state.check_stop() {
            return Ok(());
        }
        self.release_object(&mut slot, cleanup)
    }

    fn release(&self, cleanup: MapCleanupType) -> Result<()> {
        let mut slot = self.inner.slot.write().unwrap();
        if slot.state != ResourceState::Initialized {
            return Ok(());
        }
        self.release_object(&mut slot, cleanup)
    }

    fn pause(&self) -> Result<()> {
        let mut slot = self.inner.slot.write().unwrap();
        slot.state.check_pause(self.name())?;
        slot.state = ResourceState::Paused;
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        let mut slot = self.inner.slot.write().unwrap();
        slot.state.check_resume(self.name())?;
        slot.state = ResourceState::Running;
        Ok(())
    }
}
