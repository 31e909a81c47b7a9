//! Provisioning lock
//!
//! Process-wide guard that keeps at most one provisioning attempt in flight.
//! Acquisition is a single non-suspending critical section, and release
//! happens when the returned guard is dropped, whichever way the attempt
//! ends.
//!
//! A lock held longer than the staleness timeout is taken over. Every
//! acquisition gets a fresh generation number, so a guard from a taken-over
//! generation dropping late cannot release its successor.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Holder {
    generation: u64,
    since: Instant,
}

#[derive(Debug, Default)]
struct LockState {
    holder: Option<Holder>,
    next_generation: u64,
}

/// Outcome of [`ProvisioningLock::try_acquire`]
#[derive(Debug)]
pub enum LockAttempt {
    /// The lock was free
    Acquired(ProvisioningGuard),
    /// The previous holder exceeded the staleness timeout and was evicted
    Stolen {
        guard: ProvisioningGuard,
        held_for: Duration,
    },
    /// Another attempt holds a fresh lock
    Busy { held_for: Duration },
}

/// Single-holder lock with stale takeover
#[derive(Debug, Clone)]
pub struct ProvisioningLock {
    state: Arc<Mutex<LockState>>,
    stale_after: Duration,
}

impl ProvisioningLock {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(LockState::default())),
            stale_after,
        }
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn try_acquire(&self) -> LockAttempt {
        let mut state = self.state();
        let now = Instant::now();

        let stale_for = match state.holder {
            Some(holder) => {
                let held_for = now.saturating_duration_since(holder.since);
                if held_for < self.stale_after {
                    return LockAttempt::Busy { held_for };
                }
                Some(held_for)
            }
            None => None,
        };

        let generation = state.next_generation;
        state.next_generation += 1;
        state.holder = Some(Holder {
            generation,
            since: now,
        });

        let guard = ProvisioningGuard {
            state: Arc::clone(&self.state),
            generation,
        };

        match stale_for {
            Some(held_for) => LockAttempt::Stolen { guard, held_for },
            None => LockAttempt::Acquired(guard),
        }
    }

    pub fn is_held(&self) -> bool {
        self.state().holder.is_some()
    }

    /// How long the current holder has had the lock
    pub fn held_for(&self) -> Option<Duration> {
        self.state()
            .holder
            .map(|holder| Instant::now().saturating_duration_since(holder.since))
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }
}

/// Releases the provisioning lock on drop
#[derive(Debug)]
pub struct ProvisioningGuard {
    state: Arc<Mutex<LockState>>,
    generation: u64,
}

impl ProvisioningGuard {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for ProvisioningGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.holder.map(|h| h.generation) == Some(self.generation) {
            state.holder = None;
        }
    }
}
