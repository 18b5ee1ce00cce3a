//! Decorator letting a sequential consumption loop process messages concurrently.
//!
//! The loop calls [`ConcurrencyBoundedProcessor::process_message`] one message
//! at a time. Each call waits for one of N permits and then hands the message
//! to a background task, so up to N messages are in flight. A failure in the
//! background is reported by the next call instead of processing that call's
//! message, which tells the loop to stop and let the transport redeliver.

use super::{MessageProcessor, ProcessResult};
use crate::cancellation::CancellationToken;
use crate::error::{BusError, ConfigurationError};
use crate::message::Headers;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "concurrency_tests.rs"]
mod tests;

/// Interval at which [`ConcurrencyBoundedProcessor::wait_all`] re-checks the pending count
pub const DEFAULT_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Message whose background processing failed
#[derive(Debug, Clone, PartialEq)]
pub struct FailedMessage<M> {
    pub message: M,
    pub headers: Headers,
    /// Consumer reported by the inner processor, if any
    pub consumer: Option<String>,
}

/// First unreported background failure.
///
/// A new failure is only recorded once both the error has been reported and
/// the failed message has been taken.
struct FailureSlot<M> {
    error: Option<(BusError, Option<String>)>,
    failed: Option<FailedMessage<M>>,
}

/// Decrements the pending counter when a background task ends, including by panic
struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs up to `concurrency` invocations of an inner processor at once
pub struct ConcurrencyBoundedProcessor<M> {
    inner: Arc<dyn MessageProcessor<M>>,
    concurrency: usize,
    semaphore: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
    failure: Arc<Mutex<FailureSlot<M>>>,
    poll_interval: Duration,
}

impl<M> ConcurrencyBoundedProcessor<M>
where
    M: Clone + Send + 'static,
{
    /// Wrap `inner`. Concurrency must be greater than one.
    pub fn new(inner: Arc<dyn MessageProcessor<M>>, concurrency: usize) -> Result<Self, BusError> {
        if concurrency <= 1 {
            return Err(ConfigurationError::Invalid {
                message: format!("concurrency must be greater than 1, got {}", concurrency),
            }
            .into());
        }

        Ok(Self {
            inner,
            concurrency,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            pending: Arc::new(AtomicUsize::new(0)),
            failure: Arc::new(Mutex::new(FailureSlot {
                error: None,
                failed: None,
            })),
            poll_interval: DEFAULT_WAIT_POLL_INTERVAL,
        })
    }

    /// Override the [`Self::wait_all`] polling interval
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Number of messages still being processed in the background
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Take the failed message with its headers and consumer context
    pub fn take_failure(&self) -> Option<FailedMessage<M>> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .failed
            .take()
    }

    /// Take the message whose processing failed, once its failure was reported
    pub fn take_failed_message(&self) -> Option<M> {
        self.take_failure().map(|failed| failed.message)
    }

    /// Wait until every background invocation has completed
    pub async fn wait_all(&self) {
        while self.pending_count() > 0 {
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn take_reported_failure(&self) -> Option<(BusError, Option<String>)> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .error
            .take()
    }

    fn dispatch(
        &self,
        permit: tokio::sync::OwnedSemaphorePermit,
        message: M,
        headers: Headers,
        cancel: CancellationToken,
    ) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let pending = PendingGuard(Arc::clone(&self.pending));
        let inner = Arc::clone(&self.inner);
        let failure = Arc::clone(&self.failure);

        tokio::spawn(async move {
            let _permit = permit;
            let _pending = pending;

            let failed_message = message.clone();
            let failed_headers = headers.clone();
            let outcome =
                tokio::spawn(async move { inner.process_message(message, headers, &cancel).await })
                    .await;

            let (error, consumer) = match outcome {
                Ok(result) => (result.error, result.consumer),
                Err(e) => (
                    Some(BusError::processing(format!(
                        "message processor panicked: {}",
                        e
                    ))),
                    None,
                ),
            };

            if let Some(error) = error {
                let mut slot = failure.lock().unwrap_or_else(PoisonError::into_inner);
                if slot.error.is_none() && slot.failed.is_none() {
                    warn!(
                        error = %error,
                        consumer = consumer.as_deref().unwrap_or_default(),
                        "Message processing failed, reporting on next call"
                    );
                    slot.error = Some((error, consumer.clone()));
                    slot.failed = Some(FailedMessage {
                        message: failed_message,
                        headers: failed_headers,
                        consumer,
                    });
                } else {
                    debug!(error = %error, "Dropping failure while an earlier failure is unreported");
                }
            }
        });
    }
}

#[async_trait]
impl<M> MessageProcessor<M> for ConcurrencyBoundedProcessor<M>
where
    M: Clone + Send + 'static,
{
    async fn process_message(
        &self,
        message: M,
        headers: Headers,
        cancel: &CancellationToken,
    ) -> ProcessResult {
        let permit = tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit,
            _ = cancel.cancelled() => return ProcessResult::failed(BusError::Cancelled),
        };
        let permit = match permit {
            Ok(permit) => permit,
            Err(_) => return ProcessResult::failed(BusError::Cancelled),
        };

        if let Some((error, consumer)) = self.take_reported_failure() {
            // The permit returns to the pool; this message is not processed.
            drop(permit);
            return ProcessResult {
                error: Some(error),
                consumer,
            };
        }

        self.dispatch(permit, message, headers, cancel.clone());
        debug!(pending = self.pending_count(), "Message dispatched for concurrent processing");
        ProcessResult::pending()
    }
}

impl<M> std::fmt::Debug for ConcurrencyBoundedProcessor<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyBoundedProcessor")
            .field("concurrency", &self.concurrency)
            .field("available_permits", &self.semaphore.available_permits())
            .field("pending", &self.pending.load(Ordering::SeqCst))
            .finish()
    }
}
