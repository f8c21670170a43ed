//! Session lease: a deadline that authenticated requests push forward, and
//! the watcher task that tears the session down once it passes.

use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    Active(Instant),
    Expired,
}

#[derive(Debug)]
struct LeaseState {
    deadline: Instant,
    expired: bool,
}

impl LeaseState {
    /// Latch the expired flag once the deadline has passed.
    fn check(&mut self, now: Instant) -> LeaseStatus {
        if !self.expired && now >= self.deadline {
            self.expired = true;
        }
        if self.expired {
            LeaseStatus::Expired
        } else {
            LeaseStatus::Active(self.deadline)
        }
    }
}

#[derive(Debug)]
pub struct Lease {
    state: Mutex<LeaseState>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Lease {
    pub fn new(window: Duration) -> Self {
        Self {
            state: Mutex::new(LeaseState {
                deadline: Instant::now() + window,
                expired: false,
            }),
            watcher: Mutex::new(None),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LeaseState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move the deadline to `now + window`. Fails once the lease has fired,
    /// even if the watcher has not run yet.
    pub fn renew(&self, window: Duration) -> bool {
        let now = Instant::now();
        let mut state = self.state();
        match state.check(now) {
            LeaseStatus::Expired => false,
            LeaseStatus::Active(_) => {
                state.deadline = now + window;
                true
            }
        }
    }

    pub fn poll(&self, now: Instant) -> LeaseStatus {
        self.state().check(now)
    }

    pub fn is_expired(&self) -> bool {
        self.poll(Instant::now()) == LeaseStatus::Expired
    }

    /// Mark the lease fired and stop its watcher.
    pub fn revoke(&self) {
        self.state().expired = true;
        if let Some(watcher) = self
            .watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            watcher.abort();
        }
    }

    pub fn attach_watcher(&self, watcher: JoinHandle<()>) {
        let mut slot = self
            .watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = slot.replace(watcher) {
            previous.abort();
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(watcher) = self
            .watcher
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            watcher.abort();
        }
    }
}
