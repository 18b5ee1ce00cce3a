//! Outbox polling, leasing and cleanup settings.

use crate::error::{BusError, ConfigurationError};
use crate::settings::duration_ms;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for the outbox sending loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxSettings {
    /// Maximum rows leased and read per batch
    pub poll_batch_size: usize,

    /// Sleep after an iteration that found no work
    #[serde(rename = "poll_idle_sleep_ms", with = "duration_ms")]
    pub poll_idle_sleep: Duration,

    /// Lease duration granted on each lock
    #[serde(rename = "lock_expiration_ms", with = "duration_ms")]
    pub lock_expiration: Duration,

    /// Messages whose lease has less than this remaining are not sent
    #[serde(rename = "lock_expiration_buffer_ms", with = "duration_ms")]
    pub lock_expiration_buffer: Duration,

    pub message_cleanup: MessageCleanupSettings,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            poll_batch_size: 50,
            poll_idle_sleep: Duration::from_secs(1),
            lock_expiration: Duration::from_secs(10),
            lock_expiration_buffer: Duration::from_secs(3),
            message_cleanup: MessageCleanupSettings::default(),
        }
    }
}

impl OutboxSettings {
    pub fn validate(&self) -> Result<(), BusError> {
        if self.poll_batch_size == 0 {
            return Err(invalid("outbox.poll_batch_size must be greater than zero"));
        }
        if self.lock_expiration.is_zero() {
            return Err(invalid("outbox.lock_expiration_ms must be greater than zero"));
        }
        if self.lock_expiration_buffer >= self.lock_expiration {
            return Err(invalid(
                "outbox.lock_expiration_buffer_ms must be less than outbox.lock_expiration_ms",
            ));
        }
        if self.message_cleanup.enabled && self.message_cleanup.interval.is_zero() {
            return Err(invalid(
                "outbox.message_cleanup.interval_ms must be greater than zero",
            ));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> BusError {
    ConfigurationError::Invalid {
        message: message.to_string(),
    }
    .into()
}

/// Purging of sent outbox rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageCleanupSettings {
    pub enabled: bool,

    /// Minimum time between two cleanups
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,

    /// Sent rows older than this are deleted
    #[serde(rename = "age_ms", with = "duration_ms")]
    pub age: Duration,
}

impl Default for MessageCleanupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60 * 60),
            age: Duration::from_secs(60 * 60),
        }
    }
}
