//! Error types for bus operations.

use thiserror::Error;

/// Comprehensive error type for all bus operations
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Request '{request_id}' is already registered as pending")]
    DuplicateRequest { request_id: String },

    #[error("Failed to produce message of type {message_type} to '{path}': {message}")]
    ProduceFailed {
        path: String,
        message_type: String,
        message: String,
    },

    #[error("Request handler faulted: {message}")]
    RequestFaulted { message: String },

    #[error("Request '{request_id}' timed out")]
    RequestTimeout { request_id: String },

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Message processing failed: {message}")]
    ProcessingFailed { message: String },

    #[error("Outbox repository error: {message}")]
    Repository { message: String },

    #[error("Serialization failed: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),
}

impl BusError {
    /// Check if error is transient and the operation may be attempted again
    pub fn is_transient(&self) -> bool {
        match self {
            Self::DuplicateRequest { .. } => false,
            Self::ProduceFailed { .. } => true,
            Self::RequestFaulted { .. } => false,
            Self::RequestTimeout { .. } => true,
            Self::Cancelled => false,
            Self::ProcessingFailed { .. } => true,
            Self::Repository { .. } => true,
            Self::SerializationError(_) => false,
            Self::ConfigurationError(_) => false,
            Self::ValidationError(_) => false,
        }
    }

    /// Check if error is a cancellation rather than a fault
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Wrap an arbitrary handler error as a processing failure
    pub fn processing(error: impl std::fmt::Display) -> Self {
        Self::ProcessingFailed {
            message: error.to_string(),
        }
    }
}

impl From<anyhow::Error> for BusError {
    fn from(error: anyhow::Error) -> Self {
        Self::ProcessingFailed {
            message: format!("{:#}", error),
        }
    }
}

/// Errors during message serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Payload for message type {message_type} is empty")]
    EmptyPayload { message_type: String },

    #[error("Header '{key}' has invalid value")]
    InvalidHeader { key: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },

    #[error("The produced message type '{message_type}' was declared more than once")]
    DuplicateProducer { message_type: String },

    #[error("Message type '{message_type}' was not declared as a produced message on this bus")]
    UnknownProducer { message_type: String },

    #[error("No path given for message type '{message_type}' and no default path is configured")]
    MissingDefaultPath { message_type: String },

    #[error("Request/response is not configured for this bus")]
    RequestResponseNotConfigured,

    #[error("The message bus is not active (disposing or disposed)")]
    BusNotActive,
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
