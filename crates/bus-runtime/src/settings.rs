//! Producer and request/response settings for a message bus.

use crate::error::{BusError, ConfigurationError};
use crate::message::MessageType;
use crate::pending::DEFAULT_SWEEP_INTERVAL;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Serde helper storing a [`Duration`] as whole milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

// ============================================================================
// Producer Settings
// ============================================================================

/// Declaration of a message type the bus produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerSettings {
    pub message_type: MessageType,
    pub default_path: Option<String>,
    /// Request timeout overriding the bus-wide default for this request type
    pub timeout: Option<Duration>,
}

impl ProducerSettings {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            default_path: None,
            timeout: None,
        }
    }

    /// Declare the Rust type `T` as produced
    pub fn of<T: ?Sized>() -> Self {
        Self::new(MessageType::of::<T>())
    }

    pub fn default_path(mut self, path: impl Into<String>) -> Self {
        self.default_path = Some(path.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ============================================================================
// Request/Response Settings
// ============================================================================

/// Settings enabling request/response on a bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestResponseSettings {
    /// Path this bus receives responses on, sent as the `ReplyTo` header
    pub path: String,

    /// Default time a request waits for its response
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for RequestResponseSettings {
    fn default() -> Self {
        Self {
            path: "responses".to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

impl RequestResponseSettings {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), BusError> {
        if self.path.trim().is_empty() {
            return Err(ConfigurationError::Invalid {
                message: "request_response.path must not be empty".to_string(),
            }
            .into());
        }
        if self.timeout.is_zero() {
            return Err(ConfigurationError::Invalid {
                message: "request_response.timeout_ms must be greater than zero".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Settings for the pending request sweeper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PendingRequestSettings {
    #[serde(rename = "sweep_interval_ms", with = "duration_ms")]
    pub sweep_interval: Duration,
}

impl Default for PendingRequestSettings {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl PendingRequestSettings {
    pub fn validate(&self) -> Result<(), BusError> {
        if self.sweep_interval.is_zero() {
            return Err(ConfigurationError::Invalid {
                message: "pending_requests.sweep_interval_ms must be greater than zero"
                    .to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "settings_tests.rs"]
mod tests;
