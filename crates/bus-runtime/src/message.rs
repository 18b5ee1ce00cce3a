//! Message types for bus operations including core domain identifiers.

use crate::error::{SerializationError, ValidationError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Untyped message object exchanged between the bus and its serializer.
pub type MessageValue = serde_json::Value;

/// Transport headers attached to a produced or consumed message.
pub type Headers = HashMap<String, String>;

/// Header keys reserved by the bus runtime (case-sensitive).
pub mod headers {
    /// Identifier correlating a response with its pending request
    pub const REQUEST_ID: &str = "RequestId";
    /// RFC 3339 instant after which the request is considered expired
    pub const EXPIRES: &str = "Expires";
    /// Path the responder must produce the response to
    pub const REPLY_TO: &str = "ReplyTo";
    /// Error reported by a remote request handler
    pub const ERROR: &str = "Error";
    /// Marks a message already forwarded by the outbox so it is not captured again
    pub const SKIP_OUTBOX: &str = "SkipOutbox";
}

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Unique identifier of a request awaiting its response
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    /// Generate new random request ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Get request ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "request_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Descriptor naming the type of a message on the bus
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageType(String);

impl MessageType {
    /// Create a descriptor from an explicit type name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Create the descriptor for a Rust type.
    ///
    /// The name comes from [`std::any::type_name`], whose output may differ
    /// between compiler versions. Messages persisted in an outbox can outlive
    /// the binary that wrote them, so prefer [`MessageType::new`] with a fixed
    /// name for types that are captured there.
    pub fn of<T: ?Sized>() -> Self {
        Self(std::any::type_name::<T>().to_string())
    }

    /// Get the type name
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment of the type name, for log output
    pub fn short_name(&self) -> &str {
        self.0.rsplit("::").next().unwrap_or(&self.0)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Timestamp `duration` later, saturating at the maximum representable instant
    pub fn add(&self, duration: Duration) -> Self {
        let delta = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
        Self(
            self.0
                .checked_add_signed(delta)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    }

    /// Timestamp `duration` earlier, saturating at the minimum representable instant
    pub fn sub(&self, duration: Duration) -> Self {
        let delta = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
        Self(
            self.0
                .checked_sub_signed(delta)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        )
    }

    /// Time elapsed since `earlier`, or zero if `earlier` is in the future
    pub fn duration_since(&self, earlier: &Timestamp) -> Duration {
        (self.0 - earlier.0).to_std().unwrap_or(Duration::ZERO)
    }

    /// RFC 3339 representation used in headers
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = s.parse::<DateTime<Utc>>()?;
        Ok(Self::from_datetime(dt))
    }
}

// ============================================================================
// Message Envelope
// ============================================================================

/// Payload wrapped together with its headers, for transports that cannot
/// carry headers natively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MessageWithHeaders {
    pub headers: Headers,
    #[serde(with = "bytes_serde")]
    pub payload: Bytes,
}

/// Custom serialization for Bytes
mod bytes_serde {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = general_purpose::STANDARD.encode(bytes);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

impl MessageWithHeaders {
    /// Create new envelope around a payload
    pub fn new(payload: Bytes) -> Self {
        Self {
            headers: Headers::new(),
            payload,
        }
    }

    /// Create envelope with existing headers
    pub fn with_headers(payload: Bytes, headers: Headers) -> Self {
        Self { headers, payload }
    }

    /// Set a header value, replacing any previous value
    pub fn set_header(&mut self, key: &str, value: impl Into<String>) {
        self.headers.insert(key.to_string(), value.into());
    }

    /// Look up a header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Look up and parse the expiry header
    pub fn expires(&self) -> Result<Option<Timestamp>, SerializationError> {
        match self.header(headers::EXPIRES) {
            None => Ok(None),
            Some(value) => value
                .parse::<Timestamp>()
                .map(Some)
                .map_err(|_| SerializationError::InvalidHeader {
                    key: headers::EXPIRES.to_string(),
                }),
        }
    }

    /// Encode the envelope for the wire
    pub fn to_bytes(&self) -> Result<Bytes, SerializationError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode an envelope received from the wire
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SerializationError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
