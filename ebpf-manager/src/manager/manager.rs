//! # Manager
//!
//! The manager owns a closed set of resources: maps, ring buffer readers,
//! probes and any user defined resource. Resources are registered on a
//! [`ManagerBuilder`]; once built, the set can't change and the
//! [`Manager`] drives all of them through their lifecycle, in dependency
//! order.
//!
//! The manager also owns the wait group every ring buffer consumption
//! thread registers on. `Manager::stop()` only returns once all of them
//! exited.
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Weak},
    time::Duration,
};

use anyhow::{anyhow, Result};
use log::{debug, info, warn};

use super::ManagerOptions;
use crate::{
    backend::{Backend, LibbpfBackend},
    core::{CompositeError, Resource, ResourceError, ResourceState},
    helpers::WaitGroup,
    map::{Map, MapCleanupType, MapOptions, MapSpec},
    probe::{Probe, ProgramHook},
    ringbuf::{RingBufferOptions, RingBufferReader, RingBufferStats},
};

/// Builder state of the manager: resources are registered here for later
/// use, then the runtime manager is built.
pub struct ManagerBuilder {
    options: ManagerOptions,
    backend: Option<Arc<dyn Backend>>,
    names: HashSet<String>,
    maps: Vec<Map>,
    ring_buffers: Vec<RingBufferReader>,
    probes: Vec<Probe>,
    resources: Vec<Box<dyn Resource>>,
}

impl ManagerBuilder {
    fn new(options: ManagerOptions) -> ManagerBuilder {
        ManagerBuilder {
            options,
            backend: None,
            names: HashSet::new(),
            maps: Vec::new(),
            ring_buffers: Vec::new(),
            probes: Vec::new(),
            resources: Vec::new(),
        }
    }

    /// Use a specific backend for creating kernel objects. Defaults to
    /// [`LibbpfBackend`].
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    fn register(&mut self, name: &str) -> Result<()> {
        if !self.names.insert(name.to_string()) {
            return Err(ResourceError::DuplicateResource(name.to_string()).into());
        }
        Ok(())
    }

    /// Register a map. The returned handle shares its state with the one
    /// owned by the manager.
    pub fn add_map(&mut self, spec: MapSpec, options: MapOptions) -> Result<Map> {
        self.register(&spec.name)?;
        let map = Map::new(spec, options);
        self.maps.push(map.clone());
        Ok(map)
    }

    /// Register a ring buffer reader, backed by a map described by `spec`.
    pub fn add_ring_buffer(
        &mut self,
        spec: MapSpec,
        map_options: MapOptions,
        options: RingBufferOptions,
    ) -> Result<RingBufferReader> {
        self.register(&spec.name)?;
        let ringbuf = RingBufferReader::new(spec, map_options, options);
        self.ring_buffers.push(ringbuf.clone());
        Ok(ringbuf)
    }

    /// Register a probe; `hook` attaches and detaches the program.
    pub fn add_probe<H>(&mut self, name: &str, hook: H) -> Result<Probe>
    where
        H: ProgramHook + 'static,
    {
        self.register(name)?;
        let probe = Probe::new(name, hook);
        self.probes.push(probe.clone());
        Ok(probe)
    }

    /// Register any other resource. Those are started after the probes and
    /// stopped before them.
    pub fn add_resource<R>(&mut self, resource: R) -> Result<()>
    where
        R: Resource + 'static,
    {
        self.register(resource.name())?;
        self.resources.push(Box::new(resource));
        Ok(())
    }

    pub fn build(self) -> Manager {
        Manager {
            inner: Arc::new(ManagerInner {
                options: self.options,
                backend: self.backend.unwrap_or_else(|| Arc::new(LibbpfBackend)),
                wg: WaitGroup::new(),
                maps: self.maps,
                ring_buffers: self.ring_buffers,
                probes: self.probes,
                resources: self.resources,
            }),
        }
    }
}

struct ManagerInner {
    options: ManagerOptions,
    backend: Arc<dyn Backend>,
    /// One completion per running consumption thread.
    wg: WaitGroup,
    maps: Vec<Map>,
    ring_buffers: Vec<RingBufferReader>,
    probes: Vec<Probe>,
    resources: Vec<Box<dyn Resource>>,
}

/// Runtime manager. Handles are cheap to clone and share the same set of
/// resources.
///
/// Handlers run on the consumption threads and are given the manager:
/// they must not call `Manager::stop()`, which waits for those threads.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

/// Non-owning reference to a manager, kept by resources.
#[derive(Clone, Default)]
pub(crate) struct WeakManager {
    inner: Weak<ManagerInner>,
}

impl WeakManager {
    pub(crate) fn upgrade(&self) -> Option<Manager> {
        self.inner.upgrade().map(|inner| Manager { inner })
    }
}

impl Manager {
    pub fn builder(options: ManagerOptions) -> ManagerBuilder {
        ManagerBuilder::new(options)
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    pub(crate) fn backend(&self) -> &dyn Backend {
        self.inner.backend.as_ref()
    }

    pub(crate) fn wait_group(&self) -> &WaitGroup {
        &self.inner.wg
    }

    pub(crate) fn downgrade(&self) -> WeakManager {
        WeakManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// All resources, in dependency order.
    fn resources(&self) -> Vec<&dyn Resource> {
        let inner = &self.inner;
        inner
            .maps
            .iter()
            .map(|r| r as &dyn Resource)
            .chain(inner.ring_buffers.iter().map(|r| r as &dyn Resource))
            .chain(inner.probes.iter().map(|r| r as &dyn Resource))
            .chain(inner.resources.iter().map(|r| r.as_ref() as &dyn Resource))
            .collect()
    }

    /// Initialize all resources not initialized yet. Stops at the first
    /// error, in which case the resources initialized by this call are
    /// released again.
    pub fn init(&self) -> Result<()> {
        let mut initialized = Vec::new();
        for resource in self.resources() {
            if resource.state() != ResourceState::Uninitialized {
                continue;
            }

            if let Err(e) = resource.init(self) {
                warn!(
                    "Failed to initialize {}, releasing {} resource(s)",
                    resource.name(),
                    initialized.len()
                );
                self.release(initialized);
                return Err(e);
            }
            initialized.push(resource);
        }
        Ok(())
    }

    /// Initialize, then start, all resources. If a resource fails to start,
    /// the ones started by this call are stopped again, in reverse order, the
    /// ones left initialized are released and the original error is
    /// returned.
    pub fn start(&self) -> Result<()> {
        self.init()?;

        let mut started = Vec::new();
        for resource in self.resources() {
            if resource.state() == ResourceState::Running {
                continue;
            }

            if let Err(e) = resource.start() {
                warn!(
                    "Failed to start {}, rolling back {} resource(s)",
                    resource.name(),
                    started.len()
                );
                self.rollback(started);
                self.release(
                    self.resources()
                        .into_iter()
                        .filter(|r| r.state() == ResourceState::Initialized)
                        .collect(),
                );
                return Err(e);
            }
            started.push(resource);
        }

        info!(
            "Manager started ({} resource(s), {} ring buffer reader(s))",
            self.resources().len(),
            self.active_readers()
        );
        Ok(())
    }

    fn rollback(&self, started: Vec<&dyn Resource>) {
        let cleanup = self.inner.options.default_cleanup;
        for resource in started.into_iter().rev() {
            if let Err(e) = resource.stop(cleanup) {
                warn!("Could not stop {} during rollback: {e}", resource.name());
            }
        }
    }

    /// Release initialized but never started resources, in reverse order.
    fn release(&self, initialized: Vec<&dyn Resource>) {
        let cleanup = self.inner.options.default_cleanup;
        for resource in initialized.into_iter().rev() {
            if let Err(e) = resource.release(cleanup) {
                warn!("Could not release {}: {e}", resource.name());
            }
        }
    }

    /// Stop all resources, in reverse dependency order, then wait for all
    /// consumption threads to exit. Every resource is stopped even if some
    /// fail; the errors are combined.
    pub fn stop(&self, cleanup: MapCleanupType) -> Result<()> {
        let mut errors = Vec::new();
        for resource in self.resources().into_iter().rev() {
            if let Err(e) = resource.stop(cleanup) {
                errors.push(e.context(format!("stopping {}", resource.name())));
            }
        }

        match self.inner.options.stop_timeout() {
            Some(timeout) => {
                if !self.wait_readers(timeout) {
                    errors.push(anyhow!(
                        "Timed out waiting for {} ring buffer reader(s) to exit",
                        self.active_readers()
                    ));
                }
            }
            None => self.inner.wg.wait(),
        }

        info!("Manager stopped ({} error(s))", errors.len());
        match CompositeError::combine(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Pause all running resources, probes first so no more events are
    /// produced while the readers are paused.
    pub fn pause(&self) -> Result<()> {
        let mut errors = Vec::new();
        for resource in self.resources().into_iter().rev() {
            if resource.state() != ResourceState::Running {
                continue;
            }
            if let Err(e) = resource.pause() {
                errors.push(e.context(format!("pausing {}", resource.name())));
            }
        }

        debug!("Manager paused");
        match CompositeError::combine(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Resume all paused resources, readers first.
    pub fn resume(&self) -> Result<()> {
        let mut errors = Vec::new();
        for resource in self.resources() {
            if resource.state() != ResourceState::Paused {
                continue;
            }
            if let Err(e) = resource.resume() {
                errors.push(e.context(format!("resuming {}", resource.name())));
            }
        }

        debug!("Manager resumed");
        match CompositeError::combine(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn map(&self, name: &str) -> Result<Map> {
        self.inner
            .maps
            .iter()
            .find(|m| m.name() == name)
            .or_else(|| {
                self.inner
                    .ring_buffers
                    .iter()
                    .map(|r| r.map())
                    .find(|m| m.name() == name)
            })
            .cloned()
            .ok_or_else(|| ResourceError::UnknownResource(name.to_string()).into())
    }

    pub fn ring_buffer(&self, name: &str) -> Result<RingBufferReader> {
        self.inner
            .ring_buffers
            .iter()
            .find(|r| r.name() == name)
            .cloned()
            .ok_or_else(|| ResourceError::UnknownResource(name.to_string()).into())
    }

    pub fn probe(&self, name: &str) -> Result<Probe> {
        self.inner
            .probes
            .iter()
            .find(|p| p.name() == name)
            .cloned()
            .ok_or_else(|| ResourceError::UnknownResource(name.to_string()).into())
    }

    /// State of a resource, whatever its kind.
    pub fn state(&self, name: &str) -> Result<ResourceState> {
        self.resources()
            .into_iter()
            .find(|r| r.name() == name)
            .map(|r| r.state())
            .ok_or_else(|| ResourceError::UnknownResource(name.to_string()).into())
    }

    /// Number of consumption threads still running.
    pub fn active_readers(&self) -> usize {
        self.inner.wg.count()
    }

    /// Wait for all consumption threads to exit. Returns false if some are
    /// still running after `timeout`.
    pub fn wait_readers(&self, timeout: Duration) -> bool {
        self.inner.wg.wait_timeout(timeout)
    }

    /// Human readable state of all ring buffer readers having a dump
    /// handler.
    pub fn dump(&self) -> String {
        self.inner
            .ring_buffers
            .iter()
            .filter_map(|r| r.dump(self).map(|out| format!("{}:\n{out}\n", r.name())))
            .collect()
    }

    /// Statistics snapshots of the ring buffer readers having accounting
    /// enabled.
    pub fn stats(&self) -> HashMap<String, RingBufferStats> {
        self.inner
            .ring_buffers
            .iter()
            .filter_map(|r| r.stats().map(|s| (r.name().to_string(), s)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        sync::{mpsc, Mutex},
        thread,
    };

    use super::*;
    use crate::{
        backend::{MemoryBackend, MemoryFailure},
        map::MapKind,
        probe::tests::FakeHook,
        ringbuf::StatsHandle,
    };

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn builder(backend: &MemoryBackend) -> ManagerBuilder {
        Manager::builder(ManagerOptions::default()).backend(Arc::new(backend.clone()))
    }

    /// Ring buffer options forwarding (lane, len) of every sample.
    fn forwarding() -> (RingBufferOptions, mpsc::Receiver<(u32, usize)>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        (
            RingBufferOptions::new().with_data_handler(move |lane, data, _, _| {
                let _ = tx.lock().unwrap().send((lane, data.len()));
            }),
            rx,
        )
    }

    fn resource_error(e: anyhow::Error) -> Option<ResourceError> {
        e.downcast_ref::<ResourceError>().cloned()
    }

    #[test]
    fn duplicates() {
        let backend = MemoryBackend::new();
        let mut builder = builder(&backend);

        builder
            .add_map(MapSpec::new("counters", MapKind::Hash), MapOptions::default())
            .unwrap();
        let (options, _) = forwarding();
        let err = builder
            .add_ring_buffer(
                MapSpec::perf_event_array("counters"),
                MapOptions::default(),
                options,
            )
            .err().unwrap();
        assert_eq!(
            resource_error(err),
            Some(ResourceError::DuplicateResource("counters".to_string()))
        );
        assert!(builder.add_probe("counters", FakeHook::default()).is_err());
    }

    #[test]
    fn lookups() {
        let backend = MemoryBackend::new();
        let mut builder = builder(&backend);
        builder
            .add_map(MapSpec::new("counters", MapKind::Array), MapOptions::default())
            .unwrap();
        let (options, _) = forwarding();
        builder
            .add_ring_buffer(
                MapSpec::perf_event_array("events"),
                MapOptions::default(),
                options,
            )
            .unwrap();
        builder.add_probe("probe", FakeHook::default()).unwrap();
        let mgr = builder.build();

        assert_eq!(mgr.map("counters").unwrap().name(), "counters");
        assert_eq!(mgr.map("events").unwrap().spec().kind, MapKind::PerfEventArray);
        assert_eq!(mgr.ring_buffer("events").unwrap().name(), "events");
        assert_eq!(mgr.probe("probe").unwrap().name(), "probe");
        assert_eq!(mgr.state("probe").unwrap(), ResourceState::Uninitialized);

        assert_eq!(
            resource_error(mgr.ring_buffer("counters").err().unwrap()),
            Some(ResourceError::UnknownResource("counters".to_string()))
        );
        assert!(mgr.probe("events").is_err());
        assert!(mgr.state("missing").is_err());
    }

    #[test]
    fn lifecycle() {
        let backend = MemoryBackend::new();
        let mut builder = builder(&backend);
        let map = builder
            .add_map(MapSpec::new("counters", MapKind::Hash), MapOptions::default())
            .unwrap();
        let (options, rx) = forwarding();
        let stats = StatsHandle::new();
        let rb = builder
            .add_ring_buffer(
                MapSpec::perf_event_array("events"),
                MapOptions::default(),
                options.with_stats(stats.clone()),
            )
            .unwrap();
        let hook = FakeHook::default();
        let probe = builder.add_probe("probe", hook.clone()).unwrap();
        let mgr = builder.build();

        mgr.start().unwrap();
        for r in [&map as &dyn Resource, &rb, &probe] {
            assert_eq!(r.state(), ResourceState::Running);
        }
        assert_eq!(mgr.active_readers(), 1);
        // Already running, nothing happens.
        mgr.start().unwrap();
        assert_eq!(backend.ring("events").readers_opened(), 1);

        let ring = backend.ring("events");
        ring.push(0, &[0; 10]);
        ring.push(0, &[0; 20]);
        ring.push(0, &[0; 30]);
        for len in [10, 20, 30] {
            assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (0, len));
        }

        mgr.pause().unwrap();
        assert_eq!(rb.state(), ResourceState::Paused);
        assert_eq!(probe.state(), ResourceState::Paused);
        mgr.resume().unwrap();
        assert_eq!(rb.state(), ResourceState::Running);

        mgr.stop(MapCleanupType::CleanAll).unwrap();
        assert_eq!(mgr.active_readers(), 0);
        for r in [&map as &dyn Resource, &rb, &probe] {
            assert_eq!(r.state(), ResourceState::Closed);
        }
        assert_eq!(hook.calls(), vec!["attach", "detach", "attach", "detach"]);
        assert_eq!(mgr.stats()["events"].raw_samples.get(&0), Some(&60));
    }

    #[test]
    fn stop_waits_for_readers() {
        let backend = MemoryBackend::new();
        let mut builder = builder(&backend);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let (entered_tx, entered_rx) = mpsc::channel();
        let entered_tx = Mutex::new(entered_tx);

        // The handler blocks until told otherwise, keeping the consumer busy
        // while the manager is stopped.
        builder
            .add_ring_buffer(
                MapSpec::perf_event_array("events"),
                MapOptions::default(),
                RingBufferOptions::new().with_data_handler(move |_, _, _, _| {
                    let _ = entered_tx.lock().unwrap().send(());
                    let _ = release_rx.lock().unwrap().recv();
                }),
            )
            .unwrap();
        let mgr = builder.build();

        mgr.start().unwrap();
        backend.ring("events").push(0, &[1]);
        entered_rx.recv_timeout(TIMEOUT).unwrap();

        let stopper = {
            let mgr = mgr.clone();
            thread::spawn(move || mgr.stop(MapCleanupType::CleanAll))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!stopper.is_finished());
        assert_eq!(mgr.active_readers(), 1);

        release_tx.send(()).unwrap();
        stopper.join().unwrap().unwrap();
        assert_eq!(mgr.active_readers(), 0);
    }

    #[test]
    fn stop_timeout() {
        let backend = MemoryBackend::new();
        let mut builder = Manager::builder(ManagerOptions {
            stop_timeout_ms: Some(20),
            ..Default::default()
        })
        .backend(Arc::new(backend.clone()));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let (entered_tx, entered_rx) = mpsc::channel();
        let entered_tx = Mutex::new(entered_tx);

        builder
            .add_ring_buffer(
                MapSpec::perf_event_array("events"),
                MapOptions::default(),
                RingBufferOptions::new().with_data_handler(move |_, _, _, _| {
                    let _ = entered_tx.lock().unwrap().send(());
                    let _ = release_rx.lock().unwrap().recv();
                }),
            )
            .unwrap();
        let mgr = builder.build();

        mgr.start().unwrap();
        backend.ring("events").push(0, &[1]);
        entered_rx.recv_timeout(TIMEOUT).unwrap();

        let err = mgr.stop(MapCleanupType::CleanAll).unwrap_err();
        assert!(err.to_string().contains("Timed out"));

        release_tx.send(()).unwrap();
        assert!(mgr.wait_readers(TIMEOUT));
    }

    #[test]
    fn start_rollback() {
        let backend = MemoryBackend::new();
        let mut builder = builder(&backend);
        let (options, _rx) = forwarding();
        let rb = builder
            .add_ring_buffer(
                MapSpec::perf_event_array("events"),
                MapOptions::default(),
                options,
            )
            .unwrap();
        let good = FakeHook::default();
        builder.add_probe("good", good.clone()).unwrap();
        builder
            .add_probe(
                "bad",
                FakeHook {
                    fail_attach: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let mgr = builder.build();

        assert!(mgr.start().is_err());
        assert_eq!(rb.state(), ResourceState::Closed);
        assert_eq!(mgr.state("good").unwrap(), ResourceState::Closed);
        assert_eq!(mgr.state("bad").unwrap(), ResourceState::Initialized);
        assert_eq!(good.calls(), vec!["attach", "detach"]);
        assert!(mgr.wait_readers(TIMEOUT));
    }

    #[test]
    fn init_errors() {
        let backend = MemoryBackend::new();
        let mut builder = builder(&backend);
        builder
            .add_ring_buffer(
                MapSpec::perf_event_array("events"),
                MapOptions::default(),
                RingBufferOptions::new(),
            )
            .unwrap();
        let mgr = builder.build();

        assert_eq!(
            resource_error(mgr.start().unwrap_err()),
            Some(ResourceError::MissingDataHandler("events".to_string()))
        );
        assert_eq!(mgr.state("events").unwrap(), ResourceState::Uninitialized);
        // Nothing was started.
        mgr.stop(MapCleanupType::default()).unwrap();
    }

    #[test]
    fn init_error_releases_pinned_maps() {
        let backend = MemoryBackend::new();
        let mut builder = builder(&backend);
        let map = builder
            .add_map(
                MapSpec::new("counters", MapKind::Hash),
                MapOptions {
                    pin_path: Some(PathBuf::from("/sys/fs/bpf/counters")),
                    reuse_pinned: false,
                },
            )
            .unwrap();
        let (options, _) = forwarding();
        let events = builder
            .add_ring_buffer(
                MapSpec::perf_event_array("events"),
                MapOptions {
                    pin_path: Some(PathBuf::from("/sys/fs/bpf/events")),
                    reuse_pinned: false,
                },
                options,
            )
            .unwrap();
        builder
            .add_ring_buffer(
                MapSpec::perf_event_array("orphan"),
                MapOptions::default(),
                RingBufferOptions::new(),
            )
            .unwrap();
        let mgr = builder.build();

        assert_eq!(
            resource_error(mgr.start().unwrap_err()),
            Some(ResourceError::MissingDataHandler("orphan".to_string()))
        );
        assert!(!backend.is_pinned("/sys/fs/bpf/counters"));
        assert!(!backend.is_pinned("/sys/fs/bpf/events"));
        assert_eq!(map.state(), ResourceState::Closed);
        assert_eq!(events.state(), ResourceState::Closed);
        assert_eq!(events.map().state(), ResourceState::Closed);
        assert_eq!(mgr.state("orphan").unwrap(), ResourceState::Uninitialized);
        mgr.stop(MapCleanupType::CleanAll).unwrap();
    }

    #[test]
    fn start_error_releases_initialized_resources() {
        let backend = MemoryBackend::new();
        backend.inject_failure("first", MemoryFailure::OpenReader);
        let mut builder = builder(&backend);
        for name in ["first", "second"] {
            let (options, _) = forwarding();
            builder
                .add_ring_buffer(
                    MapSpec::perf_event_array(name),
                    MapOptions {
                        pin_path: Some(PathBuf::from(format!("/sys/fs/bpf/{name}"))),
                        reuse_pinned: false,
                    },
                    options,
                )
                .unwrap();
        }
        let mgr = builder.build();

        assert!(mgr.start().is_err());
        // Neither reader was started, both maps are gone.
        assert!(!backend.is_pinned("/sys/fs/bpf/first"));
        assert!(!backend.is_pinned("/sys/fs/bpf/second"));
        assert_eq!(mgr.state("first").unwrap(), ResourceState::Closed);
        assert_eq!(mgr.state("second").unwrap(), ResourceState::Closed);
        assert_eq!(mgr.active_readers(), 0);
    }

    #[test]
    fn stop_combines_errors() {
        let backend = MemoryBackend::new();
        let mut builder = builder(&backend);
        for name in ["a", "b"] {
            let (options, _) = forwarding();
            builder
                .add_ring_buffer(
                    MapSpec::perf_event_array(name),
                    MapOptions::default(),
                    options,
                )
                .unwrap();
        }
        let mgr = builder.build();

        mgr.start().unwrap();
        backend.inject_failure("a", MemoryFailure::CloseMap);
        backend.inject_failure("b", MemoryFailure::CloseReader);

        let err = mgr.stop(MapCleanupType::default()).unwrap_err();
        let composite = err.downcast_ref::<CompositeError>().unwrap();
        assert_eq!(composite.errors().len(), 2);
        // Reverse order.
        assert!(composite.errors()[0].to_string().contains("stopping b"));
        assert!(composite.errors()[1].to_string().contains("stopping a"));
        assert_eq!(mgr.active_readers(), 0);
    }

    #[test]
    fn pinned_maps() {
        let backend = MemoryBackend::new();
        let pin = PathBuf::from("/sys/fs/bpf/counters");
        let options = MapOptions {
            pin_path: Some(pin.clone()),
            reuse_pinned: true,
        };

        let mut builder = builder(&backend);
        builder
            .add_map(MapSpec::new("counters", MapKind::Hash), options.clone())
            .unwrap();
        let first = builder.build();
        first.start().unwrap();
        first.stop(MapCleanupType::KeepPinned).unwrap();
        assert!(backend.is_pinned(&pin));

        // The pin is reused, and is external to the second manager.
        let mut builder = self::builder(&backend);
        builder
            .add_map(MapSpec::new("counters", MapKind::Hash), options)
            .unwrap();
        let second = builder.build();
        second.start().unwrap();
        second.stop(MapCleanupType::CleanInternal).unwrap();
        assert!(backend.is_pinned(&pin));

        let mut builder = self::builder(&backend);
        builder
            .add_map(
                MapSpec::new("counters", MapKind::Hash),
                MapOptions {
                    pin_path: Some(pin.clone()),
                    reuse_pinned: true,
                },
            )
            .unwrap();
        let third = builder.build();
        third.start().unwrap();
        third.stop(MapCleanupType::CleanExternal).unwrap();
        assert!(!backend.is_pinned(&pin));
    }

    #[test]
    fn dump() {
        let backend = MemoryBackend::new();
        let mut builder = builder(&backend);
        let (options, _) = forwarding();
        builder
            .add_ring_buffer(
                MapSpec::perf_event_array("events"),
                MapOptions::default(),
                options.with_dump_handler(|rb, mgr| {
                    format!("{} readers, {}", mgr.active_readers(), rb.state())
                }),
            )
            .unwrap();
        let (options, _) = forwarding();
        builder
            .add_ring_buffer(
                MapSpec::perf_event_array("quiet"),
                MapOptions::default(),
                options,
            )
            .unwrap();
        let mgr = builder.build();

        mgr.start().unwrap();
        assert_eq!(mgr.dump(), "events:\n1 readers, running\n");
        mgr.stop(MapCleanupType::default()).unwrap();
    }

    #[test]
    fn handlers_get_the_manager() {
        let backend = MemoryBackend::new();
        let mut builder = builder(&backend);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        builder
            .add_ring_buffer(
                MapSpec::perf_event_array("events"),
                MapOptions::default(),
                RingBufferOptions::new().with_data_handler(move |_, _, rb, mgr| {
                    let _ = tx.lock().unwrap().send((
                        rb.name().to_string(),
                        mgr.ring_buffer(rb.name()).is_ok(),
                    ));
                }),
            )
            .unwrap();
        let mgr = builder.build();

        mgr.start().unwrap();
        backend.ring("events").push(3, &[1]);
        assert_eq!(
            rx.recv_timeout(TIMEOUT).unwrap(),
            ("events".to_string(), true)
        );
        mgr.stop(MapCleanupType::default()).unwrap();
    }
}
