//! Message processing used by consumption loops.

pub mod concurrency;

use crate::cancellation::CancellationToken;
use crate::error::BusError;
use crate::message::Headers;
use async_trait::async_trait;

pub use concurrency::{ConcurrencyBoundedProcessor, FailedMessage, DEFAULT_WAIT_POLL_INTERVAL};

/// Result of handing one message to a [`MessageProcessor`]
#[derive(Debug, Default)]
pub struct ProcessResult {
    pub error: Option<BusError>,
    /// Consumer whose settings were in effect when the message was handled
    pub consumer: Option<String>,
}

impl ProcessResult {
    pub fn ok() -> Self {
        Self::default()
    }

    /// No failure observed yet; processing continues in the background
    pub fn pending() -> Self {
        Self::ok()
    }

    pub fn failed(error: BusError) -> Self {
        Self {
            error: Some(error),
            consumer: None,
        }
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = Some(consumer.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<(), BusError> {
        match self.error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

impl From<Result<(), BusError>> for ProcessResult {
    fn from(result: Result<(), BusError>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => Self::failed(e),
        }
    }
}

/// Handles messages taken from a transport by a consumption loop
#[async_trait]
pub trait MessageProcessor<M>: Send + Sync {
    async fn process_message(
        &self,
        message: M,
        headers: Headers,
        cancel: &CancellationToken,
    ) -> ProcessResult;
}
