//! # WaitGroup
//!
//! Completion counter shared between the manager and the ring buffer
//! consumption threads. Each started thread registers itself and
//! deregisters exactly once when it exits, which lets the manager wait for
//! all threads to be really gone.
use std::{
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

#[derive(Clone, Default)]
pub(crate) struct WaitGroup {
    inner: Arc<WaitGroupInner>,
}

#[derive(Default)]
struct WaitGroupInner {
    count: Mutex<usize>,
    cond: Condvar,
}

impl WaitGroup {
    pub(crate) fn new() -> WaitGroup {
        Self::default()
    }

    pub(crate) fn add(&self, n: usize) {
        *self.inner.count.lock().unwrap() += n;
    }

    pub(crate) fn done(&self) {
        let mut count = self.inner.count.lock().unwrap();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.inner.cond.notify_all();
        }
    }

    pub(crate) fn count(&self) -> usize {
        *self.inner.count.lock().unwrap()
    }

    /// Block until the counter reaches zero.
    pub(crate) fn wait(&self) {
        let mut count = self.inner.count.lock().unwrap();
        while *count > 0 {
            count = self.inner.cond.wait(count).unwrap();
        }
    }

    /// Block until the counter reaches zero or the timeout expires. Returns
    /// true if the counter reached zero.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.inner.count.lock().unwrap();
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            count = self.inner.cond.wait_timeout(count, deadline - now).unwrap().0;
        }
        true
    }

    /// Register one completion and return a guard deregistering it on drop.
    pub(crate) fn guard(&self) -> WaitGroupGuard {
        self.add(1);
        WaitGroupGuard { wg: self.clone() }
    }
}

/// Calls `WaitGroup::done()` once, when dropped.
pub(crate) struct WaitGroupGuard {
    wg: WaitGroup,
}

impl Drop for WaitGroupGuard {
    fn drop(&mut self) {
        self.wg.done();
    }
}
