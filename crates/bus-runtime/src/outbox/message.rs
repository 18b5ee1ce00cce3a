//! Persisted outbound message.

use crate::message::{Headers, MessageType, Timestamp};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of an outbox row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutboxMessageId(Uuid);

impl OutboxMessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OutboxMessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for OutboxMessageId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for OutboxMessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound message captured for later delivery.
///
/// A row is pending while unlocked or its lease has expired, locked while an
/// instance holds an unexpired lease, and sent once `delivered_on` is set.
/// A row released by an instance that could not deliver it stays pending for
/// every other instance, but not for the releasing one until `lock_expires_on`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: OutboxMessageId,
    /// Bus to deliver through; `None` targets the default bus
    pub bus_name: Option<String>,
    pub path: String,
    pub message_type: MessageType,
    pub payload: Bytes,
    pub headers: Headers,
    pub lock_instance_id: Option<String>,
    pub lock_expires_on: Option<Timestamp>,
    /// Instance that last gave the row back without delivering it
    #[serde(default)]
    pub released_by: Option<String>,
    pub delivered_on: Option<Timestamp>,
    /// When the message was captured
    pub timestamp: Timestamp,
}

impl OutboxMessage {
    pub fn new(
        bus_name: Option<String>,
        path: impl Into<String>,
        message_type: MessageType,
        payload: Bytes,
        headers: Headers,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: OutboxMessageId::new(),
            bus_name,
            path: path.into(),
            message_type,
            payload,
            headers,
            lock_instance_id: None,
            lock_expires_on: None,
            released_by: None,
            delivered_on: None,
            timestamp,
        }
    }

    pub fn is_sent(&self) -> bool {
        self.delivered_on.is_some()
    }

    /// Whether `instance_id` may claim the row at `now`
    pub fn is_claimable_by(&self, instance_id: &str, now: Timestamp) -> bool {
        if self.is_sent() {
            return false;
        }
        match (&self.lock_instance_id, self.lock_expires_on) {
            (Some(owner), _) if owner == instance_id => true,
            (Some(_), Some(expires)) => expires < now,
            (None, Some(retry_after)) if self.released_by.as_deref() == Some(instance_id) => {
                retry_after < now
            }
            _ => true,
        }
    }

    /// Whether the row is leased to `instance_id` with an unexpired lease at `now`
    pub fn is_leased_to(&self, instance_id: &str, now: Timestamp) -> bool {
        !self.is_sent()
            && self.lock_instance_id.as_deref() == Some(instance_id)
            && self.lock_expires_on.is_some_and(|expires| expires > now)
    }
}
