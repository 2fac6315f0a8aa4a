//! Coalescing synchronizer: one producer, many waiting consumers.
//!
//! A synchronizer stands for one outstanding fetch. Every caller that arrives
//! while the fetch is in flight waits on the same instance, so exactly one
//! outbound request serves all of them. Each synchronizer is tagged with the
//! generation of the reference it was created for.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use locus_core::ResolveError;

/// Why a wait ended without a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WaitError {
    /// The fetch failed terminally.
    Failed(ResolveError),
    /// The fetch was dropped by an invalidation; the caller should start over.
    Abandoned,
    /// No completion arrived within the wait bound.
    TimedOut,
}

#[derive(Debug)]
enum Slot<T> {
    Pending,
    Ready(Result<T, ResolveError>),
    Abandoned,
}

/// Bounded wait policy: `attempts` waits of `interval` each.
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl WaitPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }
}

impl From<&locus_core::config::ResolutionConfig> for WaitPolicy {
    fn from(config: &locus_core::config::ResolutionConfig) -> Self {
        Self::new(config.wait_attempts, config.wait_interval())
    }
}

/// Shared result of one in-flight fetch.
#[derive(Debug)]
pub(crate) struct Synchronizer<T> {
    generation: u64,
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T: Clone> Synchronizer<T> {
    pub(crate) fn new(generation: u64) -> Self {
        Self {
            generation,
            slot: Mutex::new(Slot::Pending),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Settle with a result and wake every waiter. Later calls are ignored.
    pub(crate) fn complete(&self, result: Result<T, ResolveError>) {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Pending) {
            *slot = Slot::Ready(result);
            self.ready.notify_all();
        }
    }

    /// Release waiters without a result; they retry from the top.
    pub(crate) fn abandon(&self) {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Pending) {
            *slot = Slot::Abandoned;
            self.ready.notify_all();
        }
    }

    /// Block until settled or until the policy's bound runs out.
    pub(crate) fn wait(&self, policy: WaitPolicy) -> Result<T, WaitError> {
        let mut slot = self.slot.lock();
        let mut attempts = 0;
        loop {
            match &*slot {
                Slot::Ready(Ok(value)) => return Ok(value.clone()),
                Slot::Ready(Err(e)) => return Err(WaitError::Failed(e.clone())),
                Slot::Abandoned => return Err(WaitError::Abandoned),
                Slot::Pending => {}
            }
            if attempts >= policy.attempts {
                return Err(WaitError::TimedOut);
            }
            attempts += 1;
            if self.ready.wait_for(&mut slot, policy.interval).timed_out() {
                tracing::trace!(
                    attempt = attempts,
                    generation = self.generation,
                    "still waiting on coalesced fetch"
                );
            }
        }
    }
}
