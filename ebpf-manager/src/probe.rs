//! # Probe
//!
//! Program resource. Loading a program and building its attach point is
//! left to the caller, which hands over a [`ProgramHook`]; the probe only
//! drives it through the resource lifecycle.
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use log::debug;

use crate::{
    core::{Resource, ResourceState},
    manager::Manager,
    map::MapCleanupType,
};

/// Attach point of a program.
pub trait ProgramHook: Send {
    /// Attach the program. Called on start and resume.
    fn attach(&mut self) -> Result<()>;
    /// Detach the program. Called on pause and stop, only when attached.
    fn detach(&mut self) -> Result<()>;
}

/// Program resource.
#[derive(Clone)]
pub struct Probe {
    inner: Arc<ProbeInner>,
}

struct ProbeInner {
    name: String,
    hook: Mutex<Box<dyn ProgramHook>>,
    state: RwLock<ResourceState>,
}

impl Probe {
    pub fn new<H>(name: &str, hook: H) -> Probe
    where
        H: ProgramHook + 'static,
    {
        Probe {
            inner: Arc::new(ProbeInner {
                name: name.to_string(),
                hook: Mutex::new(Box::new(hook)),
                state: RwLock::new(ResourceState::default()),
            }),
        }
    }

    fn attach(&self) -> Result<()> {
        self.inner.hook.lock().unwrap().attach()
    }

    fn detach(&self) -> Result<()> {
        self.inner.hook.lock().unwrap().detach()
    }
}

impl Resource for Probe {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn state(&self) -> ResourceState {
        *self.inner.state.read().unwrap()
    }

    fn init(&self, _: &Manager) -> Result<()> {
        let mut state = self.inner.state.write().unwrap();
        if state.check_init() {
            *state = ResourceState::Initialized;
        }
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let mut state = self.inner.state.write().unwrap();
        if !state.check_start(self.name())? {
            return Ok(());
        }

        self.attach()?;
        *state = ResourceState::Running;
        debug!("Probe {} attached", self.name());
        Ok(())
    }

    fn stop(&self, _: MapCleanupType) -> Result<()> {
        let mut state = self.inner.state.write().unwrap();
        if !state.check_stop() {
            return Ok(());
        }

        let attached = *state == ResourceState::Running;
        *state = ResourceState::Closed;
        if attached {
            self.detach()?;
            debug!("Probe {} detached", self.name());
        }
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        let mut state = self.inner.state.write().unwrap();
        state.check_pause(self.name())?;

        self.detach()?;
        *state = ResourceState::Paused;
        debug!("Probe {} paused", self.name());
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        let mut state = self.inner.state.write().unwrap();
        state.check_resume(self.name())?;
        if *state == ResourceState::Running {
            return Ok(());
        }

        self.attach()?;
        *state = ResourceState::Running;
        debug!("Probe {} resumed", self.name());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{backend::MemoryBackend, core::ResourceError, manager::ManagerOptions};

    /// Hook recording its calls, optionally failing to attach.
    #[derive(Clone, Default)]
    pub(crate) struct FakeHook {
        pub(crate) calls: Arc<Mutex<Vec<&'static str>>>,
        pub(crate) fail_attach: bool,
    }

    impl FakeHook {
        pub(crate) fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ProgramHook for FakeHook {
        fn attach(&mut self) -> Result<()> {
            if self.fail_attach {
                anyhow::bail!("attach failed");
            }
            self.calls.lock().unwrap().push("attach");
            Ok(())
        }

        fn detach(&mut self) -> Result<()> {
            self.calls.lock().unwrap().push("detach");
            Ok(())
        }
    }

    fn manager() -> Manager {
        Manager::builder(ManagerOptions::default())
            .backend(Arc::new(MemoryBackend::new()))
            .build()
    }

    #[test]
    fn lifecycle() {
        let hook = FakeHook::default();
        let probe = Probe::new("kprobe/tcp_sendmsg", hook.clone());

        assert!(probe.start().is_err());
        probe.init(&manager()).unwrap();
        assert_eq!(probe.state(), ResourceState::Initialized);
        assert!(hook.calls().is_empty());

        probe.start().unwrap();
        probe.start().unwrap();
        probe.pause().unwrap();
        probe.resume().unwrap();
        probe.stop(MapCleanupType::default()).unwrap();
        probe.stop(MapCleanupType::default()).unwrap();

        assert_eq!(probe.state(), ResourceState::Closed);
        assert_eq!(hook.calls(), vec!["attach", "detach", "attach", "detach"]);
        assert_eq!(
            probe
                .start()
                .unwrap_err()
                .downcast_ref::<ResourceError>()
                .cloned(),
            Some(ResourceError::Closed("kprobe/tcp_sendmsg".to_string()))
        );
    }

    #[test]
    fn stop_while_paused() {
        let hook = FakeHook::default();
        let probe = Probe::new("probe", hook.clone());

        probe.init(&manager()).unwrap();
        probe.start().unwrap();
        probe.pause().unwrap();
        probe.stop(MapCleanupType::default()).unwrap();

        // Already detached by pause.
        assert_eq!(hook.calls(), vec!["attach", "detach"]);
        assert_eq!(probe.state(), ResourceState::Closed);
    }

    #[test]
    fn attach_failure() {
        let hook = FakeHook {
            fail_attach: true,
            ..Default::default()
        };
        let probe = Probe::new("probe", hook);

        probe.init(&manager()).unwrap();
        assert!(probe.start().is_err());
        assert_eq!(probe.state(), ResourceState::Initialized);
        // Never started, nothing to stop.
        probe.stop(MapCleanupType::default()).unwrap();
        assert_eq!(probe.state(), ResourceState::Initialized);
    }
}
