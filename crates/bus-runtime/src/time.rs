//! Time sources used by the sweeper, the request coordinator and the outbox.
//!
//! Every component that compares against "now" takes a [`TimeProvider`] so
//! expiry and lease logic can be driven deterministically in tests.

use crate::message::Timestamp;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Source of the current time
pub trait TimeProvider: Send + Sync {
    /// Get the current UTC time
    fn now(&self) -> Timestamp;
}

/// Wall-clock time provider
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually advanced time provider for tests and simulations
#[derive(Debug)]
pub struct ManualTimeProvider {
    now: Mutex<Timestamp>,
}

impl ManualTimeProvider {
    /// Create provider frozen at `start`
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = now.add(duration);
    }

    /// Set the clock to an absolute instant
    pub fn set(&self, timestamp: Timestamp) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = timestamp;
    }
}

impl Default for ManualTimeProvider {
    fn default() -> Self {
        Self::new(Timestamp::now())
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now(&self) -> Timestamp {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
