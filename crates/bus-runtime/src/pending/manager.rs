//! Periodic sweeper expiring and cancelling pending requests.
//!
//! A single long-lived task ticks at a fixed interval. Each tick runs one
//! sweep unless a sweep is already in progress, in which case the tick is
//! dropped rather than queued.

use super::state::{CancelReason, RequestOutcome};
use super::store::PendingRequestStore;
use crate::message::{MessageValue, RequestId};
use crate::time::TimeProvider;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default interval between sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(3);

/// Callback invoked with the original request when a request is expired or cancelled
pub type TimeoutCallback = Arc<dyn Fn(&MessageValue) + Send + Sync>;

#[derive(Debug, Default)]
struct SweepState {
    in_progress: bool,
    disposed: bool,
}

struct ManagerInner {
    store: Arc<dyn PendingRequestStore>,
    time_provider: Arc<dyn TimeProvider>,
    on_timeout: Option<TimeoutCallback>,
    state: Mutex<SweepState>,
}

/// Resets the in-progress flag when a sweep ends, including by panic
struct SweepGuard<'a> {
    state: &'a Mutex<SweepState>,
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_progress = false;
    }
}

impl ManagerInner {
    fn tick(&self) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.disposed || state.in_progress {
                return false;
            }
            state.in_progress = true;
        }
        let _guard = SweepGuard { state: &self.state };

        self.clean_pending_requests();
        true
    }

    fn clean_pending_requests(&self) {
        let now = self.time_provider.now();
        let due = self.store.find_all_to_cancel(now);
        if due.is_empty() {
            return;
        }

        let mut processed: Vec<RequestId> = Vec::with_capacity(due.len());
        for request in due {
            let reason = if request.cancellation.is_cancelled() {
                CancelReason::Cancelled
            } else {
                CancelReason::TimedOut
            };

            if request.try_resolve(RequestOutcome::Cancelled(reason)) {
                debug!(
                    request_id = %request.id,
                    request_type = %request.request_type.short_name(),
                    reason = ?reason,
                    expires = %request.expires,
                    "Pending request cancelled"
                );

                if let Some(callback) = &self.on_timeout {
                    callback(&request.request);
                }
            }

            processed.push(request.id.clone());
        }

        self.store.remove_all(&processed);
    }
}

/// Owns the sweep task for a pending request store
pub struct PendingRequestManager {
    inner: Arc<ManagerInner>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PendingRequestManager {
    /// Create a manager; the sweep task is not running until [`Self::start`].
    ///
    /// `on_timeout` is invoked with the original request for every request a
    /// sweep expires or cancels.
    pub fn new(
        store: Arc<dyn PendingRequestStore>,
        time_provider: Arc<dyn TimeProvider>,
        interval: Duration,
        on_timeout: Option<TimeoutCallback>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store,
                time_provider,
                on_timeout,
                state: Mutex::new(SweepState::default()),
            }),
            interval,
            task: Mutex::new(None),
        }
    }

    /// The store this manager sweeps
    pub fn store(&self) -> &Arc<dyn PendingRequestStore> {
        &self.inner.store
    }

    /// Start the periodic sweep task.
    ///
    /// Does nothing if the task is already running, the manager is disposed,
    /// or no tokio runtime is available.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() || self.is_disposed() {
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No tokio runtime available, pending request sweeping not started");
                return;
            }
        };

        let inner = Arc::clone(&self.inner);
        let period = self.interval;
        *task = Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                inner.tick();
            }
        }));

        info!(interval_ms = period.as_millis() as u64, "Pending request sweeping started");
    }

    /// Run one guarded sweep. Returns `false` if skipped because a sweep is
    /// already running or the manager is disposed.
    pub fn tick(&self) -> bool {
        self.inner.tick()
    }

    /// Run one sweep immediately, bypassing the reentrancy guard
    pub fn clean_pending_requests(&self) {
        self.inner.clean_pending_requests();
    }

    /// Stop sweeping. No sweep starts after this returns.
    pub fn dispose(&self) {
        {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if state.disposed {
                return;
            }
            state.disposed = true;
        }

        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        debug!("Pending request manager disposed");
    }

    /// Whether the periodic sweep task is alive
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Check whether [`Self::dispose`] has been called
    pub fn is_disposed(&self) -> bool {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .disposed
    }
}

impl Drop for PendingRequestManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for PendingRequestManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequestManager")
            .field("interval", &self.interval)
            .field("pending", &self.inner.store.count())
            .finish()
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
