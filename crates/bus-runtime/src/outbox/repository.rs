//! Outbox storage contract and the in-memory reference store.
//!
//! The store is the only resource shared between process instances. It must
//! guarantee that at most one instance holds an unexpired lease on a row; the
//! sending loop relies on nothing else for cross-instance coordination.

use super::message::{OutboxMessage, OutboxMessageId};
use crate::cancellation::CancellationToken;
use crate::error::BusError;
use crate::message::Timestamp;
use crate::time::TimeProvider;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

#[cfg(test)]
#[path = "repository_tests.rs"]
mod tests;

/// Persistent store of outbox messages
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Persist a newly captured message
    async fn save(&self, message: OutboxMessage, cancel: &CancellationToken) -> Result<(), BusError>;

    /// Atomically lease up to one batch of unsent rows that are unlocked, have
    /// an expired lease, or are already leased to `instance_id`. Returns the
    /// number of rows leased.
    async fn try_to_lock(
        &self,
        instance_id: &str,
        lock_expires_on: Timestamp,
        cancel: &CancellationToken,
    ) -> Result<usize, BusError>;

    /// Unsent rows currently leased to `instance_id`, oldest first, up to one batch
    async fn find_next_to_send(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<OutboxMessage>, BusError>;

    /// Mark rows as sent. Idempotent.
    async fn update_to_sent(
        &self,
        ids: &[OutboxMessageId],
        cancel: &CancellationToken,
    ) -> Result<(), BusError>;

    /// Give back unsent rows leased to `instance_id` without marking them sent.
    /// Other instances may claim them at once; `instance_id` only after
    /// `retry_after`. Rows not leased to `instance_id` are left untouched.
    async fn release(
        &self,
        instance_id: &str,
        ids: &[OutboxMessageId],
        retry_after: Timestamp,
        cancel: &CancellationToken,
    ) -> Result<(), BusError>;

    /// Delete sent rows captured before `older_than`. Returns the number deleted.
    async fn delete_sent(
        &self,
        older_than: Timestamp,
        cancel: &CancellationToken,
    ) -> Result<usize, BusError>;

    /// One-time schema preparation
    async fn migrate(&self, cancel: &CancellationToken) -> Result<(), BusError>;
}

/// In-memory [`OutboxRepository`].
///
/// Rows are kept in capture order. Every lease is granted under one write
/// lock, so claiming is a single conditional update.
pub struct InMemoryOutboxRepository {
    rows: RwLock<Vec<OutboxMessage>>,
    batch_size: usize,
    time_provider: Arc<dyn TimeProvider>,
}

impl InMemoryOutboxRepository {
    pub fn new(batch_size: usize, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            batch_size: batch_size.max(1),
            time_provider,
        }
    }

    /// Snapshot of all rows, in capture order
    pub fn messages(&self) -> Vec<OutboxMessage> {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn unsent_count(&self) -> usize {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|row| !row.is_sent())
            .count()
    }
}

impl std::fmt::Debug for InMemoryOutboxRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryOutboxRepository")
            .field("batch_size", &self.batch_size)
            .field("unsent", &self.unsent_count())
            .finish()
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<(), BusError> {
    if cancel.is_cancelled() {
        return Err(BusError::Cancelled);
    }
    Ok(())
}

#[async_trait]
impl OutboxRepository for InMemoryOutboxRepository {
    async fn save(&self, message: OutboxMessage, cancel: &CancellationToken) -> Result<(), BusError> {
        ensure_not_cancelled(cancel)?;
        self.rows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        Ok(())
    }

    async fn try_to_lock(
        &self,
        instance_id: &str,
        lock_expires_on: Timestamp,
        cancel: &CancellationToken,
    ) -> Result<usize, BusError> {
        ensure_not_cancelled(cancel)?;
        let now = self.time_provider.now();

        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let mut locked = 0;
        for row in rows
            .iter_mut()
            .filter(|row| row.is_claimable_by(instance_id, now))
            .take(self.batch_size)
        {
            row.lock_instance_id = Some(instance_id.to_string());
            row.lock_expires_on = Some(lock_expires_on);
            row.released_by = None;
            locked += 1;
        }

        if locked > 0 {
            debug!(instance_id, locked, "Leased outbox messages");
        }
        Ok(locked)
    }

    async fn find_next_to_send(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<OutboxMessage>, BusError> {
        ensure_not_cancelled(cancel)?;
        let now = self.time_provider.now();

        Ok(self
            .rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|row| row.is_leased_to(instance_id, now))
            .take(self.batch_size)
            .cloned()
            .collect())
    }

    async fn update_to_sent(
        &self,
        ids: &[OutboxMessageId],
        cancel: &CancellationToken,
    ) -> Result<(), BusError> {
        ensure_not_cancelled(cancel)?;
        let now = self.time_provider.now();
        let ids: HashSet<&OutboxMessageId> = ids.iter().collect();

        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        for row in rows.iter_mut().filter(|row| ids.contains(&row.id)) {
            if row.delivered_on.is_none() {
                row.delivered_on = Some(now);
            }
        }
        Ok(())
    }

    async fn release(
        &self,
        instance_id: &str,
        ids: &[OutboxMessageId],
        retry_after: Timestamp,
        cancel: &CancellationToken,
    ) -> Result<(), BusError> {
        ensure_not_cancelled(cancel)?;
        let now = self.time_provider.now();
        let ids: HashSet<&OutboxMessageId> = ids.iter().collect();

        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let mut released = 0;
        for row in rows
            .iter_mut()
            .filter(|row| ids.contains(&row.id) && row.is_leased_to(instance_id, now))
        {
            row.lock_instance_id = None;
            row.lock_expires_on = Some(retry_after);
            row.released_by = Some(instance_id.to_string());
            released += 1;
        }

        if released > 0 {
            debug!(instance_id, released, "Released outbox messages");
        }
        Ok(())
    }

    async fn delete_sent(
        &self,
        older_than: Timestamp,
        cancel: &CancellationToken,
    ) -> Result<usize, BusError> {
        ensure_not_cancelled(cancel)?;

        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let before = rows.len();
        rows.retain(|row| !(row.is_sent() && row.timestamp < older_than));
        Ok(before - rows.len())
    }

    async fn migrate(&self, cancel: &CancellationToken) -> Result<(), BusError> {
        ensure_not_cancelled(cancel)
    }
}
