//! # Resource
//!
//! Every kernel backed object handled by the manager (maps, ring buffer
//! readers, programs) goes through the same state machine:
//!
//! ```text
//! uninitialized -> initialized -> running <-> paused -> closed
//! ```
//!
//! The checks below are the single place where the legality of a transition
//! is decided; resources call them while holding the write side of their
//! state lock.
use std::fmt;

use anyhow::Result;

use super::error::ResourceError;
use crate::{manager::Manager, map::MapCleanupType};

/// State of a resource. The derived ordering matches the lifecycle,
/// `Closed` being terminal and handled explicitly by the checks.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ResourceState {
    #[default]
    Uninitialized,
    Initialized,
    Paused,
    Running,
    Closed,
}

impl ResourceState {
    pub fn to_str(self) -> &'static str {
        use ResourceState::*;
        match self {
            Uninitialized => "uninitialized",
            Initialized => "initialized",
            Paused => "paused",
            Running => "running",
            Closed => "closed",
        }
    }

    /// Init is only legal on a fresh resource. Returns false when the
    /// resource already went through init.
    pub fn check_init(self) -> bool {
        self == ResourceState::Uninitialized
    }

    /// Returns `Ok(false)` if the resource is already running, in which case
    /// start must be a no-op, and `Ok(true)` if the resource can be started.
    pub fn check_start(self, name: &str) -> Result<bool> {
        match self {
            ResourceState::Running => Ok(false),
            ResourceState::Closed => Err(ResourceError::Closed(name.to_string()).into()),
            s if s < ResourceState::Initialized => {
                Err(ResourceError::NotInitialized(name.to_string()).into())
            }
            _ => Ok(true),
        }
    }

    pub fn check_pause(self, name: &str) -> Result<()> {
        match self {
            ResourceState::Running => Ok(()),
            ResourceState::Closed => Err(ResourceError::Closed(name.to_string()).into()),
            _ => Err(ResourceError::NotRunning(name.to_string()).into()),
        }
    }

    pub fn check_resume(self, name: &str) -> Result<()> {
        match self {
            ResourceState::Closed => Err(ResourceError::Closed(name.to_string()).into()),
            s if s < ResourceState::Paused => {
                Err(ResourceError::NotRunning(name.to_string()).into())
            }
            _ => Ok(()),
        }
    }

    /// Returns true if stop has something to tear down, i.e. the resource
    /// was started and is not closed yet.
    pub fn check_stop(self) -> bool {
        matches!(self, ResourceState::Paused | ResourceState::Running)
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

/// Generic trait representing a resource handled by the manager. All
/// resources are manipulated through this trait by the manager; their
/// handles are cheap to clone and every method takes `&self`, the state
/// being protected internally.
pub trait Resource: Send + Sync {
    /// Unique name of the resource within a manager.
    fn name(&self) -> &str;
    /// Current state of the resource.
    fn state(&self) -> ResourceState;
    /// Initialize the resource. The manager is only used to read shared
    /// configuration and is not owned by the resource.
    fn init(&self, manager: &Manager) -> Result<()>;
    /// Start the resource. No-op if already running.
    fn start(&self) -> Result<()>;
    /// Stop the resource, releasing its kernel objects according to the
    /// cleanup policy. No-op if it was never started.
    fn stop(&self, cleanup: MapCleanupType) -> Result<()>;
    /// Pause a running resource.
    fn pause(&self) -> Result<()>;
    /// Resume a paused resource.
    fn resume(&self) -> Result<()>;
    /// Release what init acquired on a resource which was initialized but
    /// never started, leaving it closed. No-op in any other state. Used by
    /// the manager when bringing up its resources fails halfway.
    fn release(&self, _cleanup: MapCleanupType) -> Result<()> {
        Ok(())
    }
}
