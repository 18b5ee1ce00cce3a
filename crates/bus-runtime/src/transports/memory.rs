//! In-memory transport for testing and development.
//!
//! Every produced message is recorded in order. Handlers registered per path
//! receive a copy of each message produced to that path, which lets tests wire
//! a responder back into the bus without a broker.

use crate::cancellation::CancellationToken;
use crate::error::BusError;
use crate::transport::{Transport, TransportMessage};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::debug;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Callback receiving messages produced to a path
pub type PathHandler = Arc<dyn Fn(TransportMessage) + Send + Sync>;

/// Transport recording produced messages in memory
pub struct InMemoryTransport {
    produced: Mutex<Vec<TransportMessage>>,
    handlers: RwLock<HashMap<String, PathHandler>>,
    failing_paths: RwLock<HashSet<String>>,
    native_headers: bool,
}

impl InMemoryTransport {
    /// Create transport carrying headers natively
    pub fn new() -> Self {
        Self {
            produced: Mutex::new(Vec::new()),
            handlers: RwLock::new(HashMap::new()),
            failing_paths: RwLock::new(HashSet::new()),
            native_headers: true,
        }
    }

    /// Create transport that cannot carry headers, forcing envelope wrapping
    pub fn without_native_headers() -> Self {
        Self {
            native_headers: false,
            ..Self::new()
        }
    }

    /// Register the handler for a path, replacing any previous one
    pub fn on_path(&self, path: impl Into<String>, handler: PathHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into(), handler);
    }

    /// Make every produce to `path` fail until [`Self::clear_failures`]
    pub fn fail_path(&self, path: impl Into<String>) {
        self.failing_paths
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into());
    }

    pub fn clear_failures(&self) {
        self.failing_paths
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// All messages produced so far, in order
    pub fn produced(&self) -> Vec<TransportMessage> {
        self.produced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Messages produced to one path, in order
    pub fn produced_to(&self, path: &str) -> Vec<TransportMessage> {
        self.produced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|message| message.path == path)
            .cloned()
            .collect()
    }

    pub fn produced_count(&self) -> usize {
        self.produced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransport")
            .field("produced", &self.produced_count())
            .field("native_headers", &self.native_headers)
            .finish()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn produce_to_transport(
        &self,
        message: TransportMessage,
        cancel: &CancellationToken,
    ) -> Result<(), BusError> {
        if cancel.is_cancelled() {
            return Err(BusError::Cancelled);
        }

        let failing = self
            .failing_paths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&message.path);
        if failing {
            return Err(BusError::ProduceFailed {
                path: message.path.clone(),
                message_type: message.message_type.to_string(),
                message: "path is configured to fail".to_string(),
            });
        }

        debug!(
            path = %message.path,
            message_type = %message.message_type.short_name(),
            payload_size = message.payload.len(),
            "Message produced to in-memory transport"
        );

        self.produced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());

        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message.path)
            .cloned();
        if let Some(handler) = handler {
            handler(message);
        }

        Ok(())
    }

    fn supports_headers(&self) -> bool {
        self.native_headers
    }
}
