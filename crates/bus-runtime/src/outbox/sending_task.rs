//! Background loop forwarding persisted outbox messages through the bus.
//!
//! One loop runs per process. It starts when the first bus using the outbox
//! starts and stops when the last one stops. Each iteration leases a batch of
//! rows for this instance, forwards them with the `SkipOutbox` header so the
//! publish interceptor lets them through, and marks them sent. Rows this
//! instance cannot deliver (no matching bus, undeclared type, unreadable
//! payload) are released so they do not hold up the rows behind them.
//! Iterations without work sleep and occasionally purge old sent rows.

use super::instance::InstanceIdProvider;
use super::message::{OutboxMessage, OutboxMessageId};
use super::repository::OutboxRepository;
use super::settings::OutboxSettings;
use crate::bus::MessageBus;
use crate::cancellation::CancellationToken;
use crate::error::BusError;
use crate::interceptor::{BusLifecycleEvent, BusLifecycleInterceptor};
use crate::message::{headers, Timestamp};
use crate::time::TimeProvider;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "sending_task_tests.rs"]
mod tests;

/// Rows handled by the current batch, pending confirmation in the store
struct BatchOutcome {
    sent: Vec<OutboxMessageId>,
    /// Rows this instance cannot deliver; released for others to pick up
    skipped: Vec<OutboxMessageId>,
}

impl BatchOutcome {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            sent: Vec::with_capacity(capacity),
            skipped: Vec::new(),
        }
    }
}

struct RunningLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// State shared between the task handle and the spawned loop
struct OutboxLoop {
    settings: OutboxSettings,
    repository: Arc<dyn OutboxRepository>,
    instance_id: Arc<dyn InstanceIdProvider>,
    time_provider: Arc<dyn TimeProvider>,
    /// Started buses keyed by name; the unnamed bus is keyed by `None`
    buses: RwLock<HashMap<Option<String>, Weak<MessageBus>>>,
    cleanup_next_run: Mutex<Option<Timestamp>>,
}

/// Outbox sending loop participating in bus lifecycle
pub struct OutboxSendingTask {
    core: Arc<OutboxLoop>,
    bus_start_count: AtomicUsize,
    running: Mutex<Option<RunningLoop>>,
}

impl OutboxSendingTask {
    pub fn new(
        settings: OutboxSettings,
        repository: Arc<dyn OutboxRepository>,
        instance_id: Arc<dyn InstanceIdProvider>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Result<Self, BusError> {
        settings.validate()?;
        Ok(Self {
            core: Arc::new(OutboxLoop {
                settings,
                repository,
                instance_id,
                time_provider,
                buses: RwLock::new(HashMap::new()),
                cleanup_next_run: Mutex::new(None),
            }),
            bus_start_count: AtomicUsize::new(0),
            running: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &OutboxSettings {
        &self.core.settings
    }

    pub fn instance_id(&self) -> &str {
        self.core.instance_id.instance_id()
    }

    /// Make a bus available for forwarding messages addressed to its name
    pub fn register_bus(&self, bus: &Arc<MessageBus>) {
        self.core
            .buses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(bus.name().map(str::to_string), Arc::downgrade(bus));
    }

    pub fn unregister_bus(&self, bus: &MessageBus) {
        self.core
            .buses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&bus.name().map(str::to_string));
    }

    /// Whether the loop task is alive
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Start the loop if it is not already running. Requires a tokio runtime.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return;
        }

        debug!("Outbox loop starting");
        let cancel = CancellationToken::new();
        let core = Arc::clone(&self.core);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { core.run(token).await });
        *running = Some(RunningLoop { cancel, handle });
    }

    /// Cancel the loop and wait for it to finish. Idempotent.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(running) = running {
            debug!("Outbox loop stopping");
            running.cancel.cancel();
            if let Err(e) = running.handle.await {
                error!(error = %e, "Outbox loop task failed");
            }
        }
    }
}

#[async_trait]
impl BusLifecycleInterceptor for OutboxSendingTask {
    async fn on_bus_lifecycle(
        &self,
        event: BusLifecycleEvent,
        bus: &Arc<MessageBus>,
    ) -> Result<(), BusError> {
        match event {
            BusLifecycleEvent::Started => {
                self.register_bus(bus);
                // The first started bus starts the loop
                if self.bus_start_count.fetch_add(1, Ordering::SeqCst) == 0 {
                    self.start();
                }
            }
            BusLifecycleEvent::Stopping => {
                self.unregister_bus(bus);
                let previous = self
                    .bus_start_count
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                        Some(count.saturating_sub(1))
                    })
                    .unwrap_or(0);
                // The last stopped bus stops the loop
                if previous == 1 {
                    self.stop().await;
                }
            }
        }
        Ok(())
    }
}

impl Drop for OutboxSendingTask {
    fn drop(&mut self) {
        let running = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            debug!("Outbox loop cancelled on drop");
            running.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for OutboxSendingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxSendingTask")
            .field("instance_id", &self.instance_id())
            .field("bus_start_count", &self.bus_start_count.load(Ordering::SeqCst))
            .field("running", &self.is_running())
            .finish()
    }
}

// ============================================================================
// Loop
// ============================================================================

impl OutboxLoop {
    async fn run(&self, cancel: CancellationToken) {
        info!(
            instance_id = self.instance_id.instance_id(),
            "Outbox loop started"
        );

        match self.run_until_cancelled(&cancel).await {
            Ok(()) | Err(BusError::Cancelled) => {}
            Err(e) => error!(error = %e, "Outbox loop has crashed"),
        }

        info!("Outbox loop stopped");
    }

    async fn run_until_cancelled(&self, cancel: &CancellationToken) -> Result<(), BusError> {
        self.repository.migrate(cancel).await?;

        // Ids survive a failed update so the next batch confirms them again
        let mut outcome = BatchOutcome::with_capacity(self.settings.poll_batch_size);

        while !cancel.is_cancelled() {
            let idle = match self.iteration(&mut outcome, cancel).await {
                Ok(idle) => idle,
                Err(BusError::Cancelled) => return Err(BusError::Cancelled),
                Err(e) => {
                    error!(error = %e, "Error while processing outbox messages");
                    true
                }
            };

            if idle {
                match self.cleanup_if_due(cancel).await {
                    Err(BusError::Cancelled) => return Err(BusError::Cancelled),
                    Err(e) => error!(error = %e, "Error while deleting sent outbox messages"),
                    Ok(_) => {}
                }

                tokio::select! {
                    _ = tokio::time::sleep(self.settings.poll_idle_sleep) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }

        Ok(())
    }

    /// Lease and forward one round of messages. Returns whether it was idle.
    async fn iteration(
        &self,
        outcome: &mut BatchOutcome,
        cancel: &CancellationToken,
    ) -> Result<bool, BusError> {
        let lock_expires_on = self
            .time_provider
            .now()
            .add(self.settings.lock_expiration);
        let locked = self
            .repository
            .try_to_lock(self.instance_id.instance_id(), lock_expires_on, cancel)
            .await?;

        if locked == 0 {
            return Ok(true);
        }
        self.send_messages(outcome, cancel).await
    }

    async fn send_messages(
        &self,
        outcome: &mut BatchOutcome,
        cancel: &CancellationToken,
    ) -> Result<bool, BusError> {
        let instance_id = self.instance_id.instance_id();
        let mut idle = true;
        let mut has_more = true;

        while has_more && !cancel.is_cancelled() {
            let batch = self.repository.find_next_to_send(instance_id, cancel).await?;
            if batch.is_empty() {
                break;
            }

            let forwarded = self.forward_batch(&batch, outcome, cancel).await;

            // Confirm whatever was forwarded, even if the batch failed part way
            if !outcome.sent.is_empty() {
                debug!(count = outcome.sent.len(), "Updating outbox messages as sent");
                self.repository.update_to_sent(&outcome.sent, cancel).await?;
                idle = false;
                outcome.sent.clear();
            }

            if !outcome.skipped.is_empty() {
                let retry_after = self
                    .time_provider
                    .now()
                    .add(self.settings.lock_expiration);
                debug!(count = outcome.skipped.len(), "Releasing undeliverable outbox messages");
                self.repository
                    .release(instance_id, &outcome.skipped, retry_after, cancel)
                    .await?;
                idle = false;
                outcome.skipped.clear();
            }

            has_more = forwarded?;
        }

        Ok(idle)
    }

    /// Forward one batch. Returns whether draining should continue.
    async fn forward_batch(
        &self,
        batch: &[OutboxMessage],
        outcome: &mut BatchOutcome,
        cancel: &CancellationToken,
    ) -> Result<bool, BusError> {
        for (index, message) in batch.iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(false);
            }

            let now = self.time_provider.now();
            let lease_too_short = message
                .lock_expires_on
                .map_or(true, |expires| now.add(self.settings.lock_expiration_buffer) > expires);
            if lease_too_short {
                debug!(
                    sent = index,
                    batch_size = batch.len(),
                    buffer_ms = self.settings.lock_expiration_buffer.as_millis() as u64,
                    "Stopping outbox processing because the message lock is close to expiration"
                );
                return Ok(false);
            }

            let Some(bus) = self.resolve_bus(message.bus_name.as_deref()) else {
                warn!(
                    outbox_message_id = %message.id,
                    message_type = %message.message_type.short_name(),
                    path = %message.path,
                    bus_name = message.bus_name.as_deref().unwrap_or_default(),
                    "No bus found for outbox message, releasing it"
                );
                outcome.skipped.push(message.id);
                continue;
            };

            debug!(
                outbox_message_id = %message.id,
                message_type = %message.message_type.short_name(),
                path = %message.path,
                "Sending outbox message"
            );

            match self.forward(&bus, message, cancel).await {
                Ok(()) => outcome.sent.push(message.id),
                Err(e) if e.is_transient() || e.is_cancellation() => return Err(e),
                Err(e) => {
                    warn!(
                        outbox_message_id = %message.id,
                        message_type = %message.message_type.short_name(),
                        error = %e,
                        "Outbox message cannot be forwarded, releasing it"
                    );
                    outcome.skipped.push(message.id);
                }
            }
        }

        Ok(true)
    }

    async fn forward(
        &self,
        bus: &MessageBus,
        message: &OutboxMessage,
        cancel: &CancellationToken,
    ) -> Result<(), BusError> {
        let value = bus
            .serializer()
            .deserialize(&message.message_type, &message.payload)?;
        let mut message_headers = message.headers.clone();
        message_headers.insert(headers::SKIP_OUTBOX.to_string(), String::new());

        bus.produce_publish(
            &message.message_type,
            &value,
            Some(&message.path),
            message_headers,
            cancel,
        )
        .await
    }

    fn resolve_bus(&self, bus_name: Option<&str>) -> Option<Arc<MessageBus>> {
        let buses = self.buses.read().unwrap_or_else(PoisonError::into_inner);
        match bus_name {
            Some(name) => buses.get(&Some(name.to_string())).and_then(Weak::upgrade),
            None => buses
                .get(&None)
                .and_then(Weak::upgrade)
                .or_else(|| match buses.len() {
                    1 => buses.values().next().and_then(Weak::upgrade),
                    _ => None,
                }),
        }
    }

    fn should_run_cleanup(&self, now: Timestamp) -> bool {
        let cleanup = &self.settings.message_cleanup;
        if !cleanup.enabled {
            return false;
        }

        let mut next_run = self
            .cleanup_next_run
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let trigger = next_run.map_or(true, |next| now > next);
        if trigger {
            *next_run = Some(now.add(cleanup.interval));
        }
        trigger
    }

    async fn cleanup_if_due(&self, cancel: &CancellationToken) -> Result<usize, BusError> {
        let now = self.time_provider.now();
        if !self.should_run_cleanup(now) {
            return Ok(0);
        }

        let older_than = now.sub(self.settings.message_cleanup.age);
        let deleted = self.repository.delete_sent(older_than, cancel).await?;
        debug!(deleted, older_than = %older_than, "Deleted sent outbox messages");
        Ok(deleted)
    }
}
