//! Message bus core: publish, request/response correlation and lifecycle.
//!
//! The bus owns no broker connection. It serializes messages, runs publish
//! interceptors and hands the result to a [`Transport`]. For request/response
//! every outgoing request is registered in the pending store before it is
//! produced; the transport binding reports replies through
//! [`MessageBus::on_response_arrived`], which resolves the waiting caller.

use crate::cancellation::CancellationToken;
use crate::error::{BusError, ConfigurationError, ValidationError};
use crate::interceptor::{
    BusLifecycleEvent, BusLifecycleInterceptor, PublishContext, PublishDecision,
    PublishInterceptor,
};
use crate::message::{
    headers, Headers, MessageType, MessageValue, MessageWithHeaders, RequestId,
};
use crate::pending::{
    CancelReason, InMemoryPendingRequestStore, PendingRequestManager, PendingRequestState,
    PendingRequestStore, RequestOutcome, TimeoutCallback,
};
use crate::serialization::{from_value, to_value, JsonMessageSerializer, MessageSerializer};
use crate::settings::{PendingRequestSettings, ProducerSettings, RequestResponseSettings};
use crate::time::{SystemTimeProvider, TimeProvider};
use crate::transport::{Transport, TransportMessage};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;

// ============================================================================
// Send Options
// ============================================================================

/// Per-call overrides for [`MessageBus::send`]
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Destination path; defaults to the producer's default path
    pub path: Option<String>,
    /// Response timeout; defaults to the producer timeout, then the bus-wide timeout
    pub timeout: Option<Duration>,
    /// Additional headers sent with the request
    pub headers: Headers,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`MessageBus`]
pub struct MessageBusBuilder {
    name: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    serializer: Arc<dyn MessageSerializer>,
    producers: Vec<ProducerSettings>,
    request_response: Option<RequestResponseSettings>,
    pending_requests: PendingRequestSettings,
    pending_store: Option<Arc<dyn PendingRequestStore>>,
    time_provider: Arc<dyn TimeProvider>,
    publish_interceptors: Vec<Arc<dyn PublishInterceptor>>,
    lifecycle_interceptors: Vec<Arc<dyn BusLifecycleInterceptor>>,
    on_request_timeout: Option<TimeoutCallback>,
}

impl MessageBusBuilder {
    pub fn new() -> Self {
        Self {
            name: None,
            transport: None,
            serializer: Arc::new(JsonMessageSerializer),
            producers: Vec::new(),
            request_response: None,
            pending_requests: PendingRequestSettings::default(),
            pending_store: None,
            time_provider: Arc::new(SystemTimeProvider),
            publish_interceptors: Vec::new(),
            lifecycle_interceptors: Vec::new(),
            on_request_timeout: None,
        }
    }

    /// Name used to address this bus as a child of a composite bus
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn MessageSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Declare a produced message type
    pub fn produce(mut self, producer: ProducerSettings) -> Self {
        self.producers.push(producer);
        self
    }

    /// Enable request/response
    pub fn request_response(mut self, settings: RequestResponseSettings) -> Self {
        self.request_response = Some(settings);
        self
    }

    pub fn pending_requests(mut self, settings: PendingRequestSettings) -> Self {
        self.pending_requests = settings;
        self
    }

    /// Replace the default in-memory pending request store
    pub fn pending_store(mut self, store: Arc<dyn PendingRequestStore>) -> Self {
        self.pending_store = Some(store);
        self
    }

    pub fn time_provider(mut self, time_provider: Arc<dyn TimeProvider>) -> Self {
        self.time_provider = time_provider;
        self
    }

    pub fn publish_interceptor(mut self, interceptor: Arc<dyn PublishInterceptor>) -> Self {
        self.publish_interceptors.push(interceptor);
        self
    }

    pub fn lifecycle_interceptor(mut self, interceptor: Arc<dyn BusLifecycleInterceptor>) -> Self {
        self.lifecycle_interceptors.push(interceptor);
        self
    }

    /// Callback invoked with the original request when a request expires or is cancelled
    pub fn on_request_timeout(mut self, callback: TimeoutCallback) -> Self {
        self.on_request_timeout = Some(callback);
        self
    }

    /// Validate the configuration and create the bus.
    ///
    /// When request/response is enabled and a tokio runtime is available, the
    /// pending request sweeper starts immediately.
    pub fn build(self) -> Result<Arc<MessageBus>, BusError> {
        let transport = self.transport.ok_or_else(|| ConfigurationError::Missing {
            key: "transport".to_string(),
        })?;

        let mut producers = HashMap::with_capacity(self.producers.len());
        for producer in self.producers {
            let message_type = producer.message_type.clone();
            if producers.insert(message_type.clone(), producer).is_some() {
                return Err(ConfigurationError::DuplicateProducer {
                    message_type: message_type.to_string(),
                }
                .into());
            }
        }

        if let Some(settings) = &self.request_response {
            settings.validate()?;
        }
        self.pending_requests.validate()?;

        let store = self.pending_store.unwrap_or_else(|| {
            Arc::new(InMemoryPendingRequestStore::new()) as Arc<dyn PendingRequestStore>
        });
        let pending = PendingRequestManager::new(
            store,
            Arc::clone(&self.time_provider),
            self.pending_requests.sweep_interval,
            self.on_request_timeout,
        );
        if self.request_response.is_some() {
            pending.start();
        }

        Ok(Arc::new(MessageBus {
            name: self.name,
            transport,
            serializer: self.serializer,
            producers,
            request_response: self.request_response,
            time_provider: self.time_provider,
            pending,
            publish_interceptors: self.publish_interceptors,
            lifecycle_interceptors: self.lifecycle_interceptors,
            started: AtomicBool::new(false),
            disposing: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }))
    }
}

impl Default for MessageBusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Message Bus
// ============================================================================

/// Transport-agnostic message bus
pub struct MessageBus {
    name: Option<String>,
    transport: Arc<dyn Transport>,
    serializer: Arc<dyn MessageSerializer>,
    producers: HashMap<MessageType, ProducerSettings>,
    request_response: Option<RequestResponseSettings>,
    time_provider: Arc<dyn TimeProvider>,
    pending: PendingRequestManager,
    publish_interceptors: Vec<Arc<dyn PublishInterceptor>>,
    lifecycle_interceptors: Vec<Arc<dyn BusLifecycleInterceptor>>,
    started: AtomicBool,
    disposing: AtomicBool,
    disposed: AtomicBool,
}

impl MessageBus {
    pub fn builder() -> MessageBusBuilder {
        MessageBusBuilder::new()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Request/response settings, `None` when `send` is not enabled
    pub fn request_response(&self) -> Option<&RequestResponseSettings> {
        self.request_response.as_ref()
    }

    pub fn serializer(&self) -> &Arc<dyn MessageSerializer> {
        &self.serializer
    }

    /// Check whether the message type was declared as produced on this bus
    pub fn declares_producer(&self, message_type: &MessageType) -> bool {
        self.producers.contains_key(message_type)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// The pending request sweeper, for driving sweeps directly
    pub fn pending_requests(&self) -> &PendingRequestManager {
        &self.pending
    }

    /// Number of requests awaiting a response
    pub fn pending_count(&self) -> usize {
        self.pending.store().count()
    }

    fn assert_active(&self) -> Result<(), BusError> {
        if self.disposing.load(Ordering::SeqCst) || self.disposed.load(Ordering::SeqCst) {
            return Err(ConfigurationError::BusNotActive.into());
        }
        Ok(())
    }

    fn producer_settings(&self, message_type: &MessageType) -> Result<&ProducerSettings, BusError> {
        self.producers.get(message_type).ok_or_else(|| {
            ConfigurationError::UnknownProducer {
                message_type: message_type.to_string(),
            }
            .into()
        })
    }

    fn resolve_path(
        producer: &ProducerSettings,
        explicit: Option<&str>,
    ) -> Result<String, BusError> {
        explicit
            .map(str::to_string)
            .or_else(|| producer.default_path.clone())
            .ok_or_else(|| {
                ConfigurationError::MissingDefaultPath {
                    message_type: producer.message_type.to_string(),
                }
                .into()
            })
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Start the bus and notify lifecycle interceptors. Idempotent.
    pub async fn start(self: &Arc<Self>) -> Result<(), BusError> {
        self.assert_active()?;
        if self.request_response.is_some() {
            self.pending.start();
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for interceptor in &self.lifecycle_interceptors {
            interceptor
                .on_bus_lifecycle(BusLifecycleEvent::Started, self)
                .await?;
        }

        info!(bus = self.name().unwrap_or_default(), "Message bus started");
        Ok(())
    }

    /// Stop the bus and notify lifecycle interceptors. Idempotent.
    pub async fn stop(self: &Arc<Self>) -> Result<(), BusError> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        for interceptor in &self.lifecycle_interceptors {
            interceptor
                .on_bus_lifecycle(BusLifecycleEvent::Stopping, self)
                .await?;
        }

        info!(bus = self.name().unwrap_or_default(), "Message bus stopped");
        Ok(())
    }

    /// Stop the bus and the pending request sweeper. Further operations are rejected.
    pub async fn dispose(self: &Arc<Self>) {
        if self.disposing.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.stop().await {
            error!(
                bus = self.name().unwrap_or_default(),
                error = %e,
                "Error while stopping message bus during disposal"
            );
        }

        self.pending.dispose();
        self.disposed.store(true, Ordering::SeqCst);
        debug!(bus = self.name().unwrap_or_default(), "Message bus disposed");
    }

    // ------------------------------------------------------------------------
    // Produce
    // ------------------------------------------------------------------------

    /// Publish a message of a declared type
    pub async fn publish<T>(
        &self,
        message: &T,
        path: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), BusError>
    where
        T: Serialize + ?Sized,
    {
        let message_type = MessageType::of::<T>();
        let value = to_value(message)?;
        self.produce_publish(&message_type, &value, path, Headers::new(), cancel)
            .await
    }

    /// Publish an untyped message through the interceptor chain and the transport
    pub async fn produce_publish(
        &self,
        message_type: &MessageType,
        message: &MessageValue,
        path: Option<&str>,
        headers: Headers,
        cancel: &CancellationToken,
    ) -> Result<(), BusError> {
        self.assert_active()?;
        if cancel.is_cancelled() {
            return Err(BusError::Cancelled);
        }

        let producer = self.producer_settings(message_type)?;
        let path = Self::resolve_path(producer, path)?;
        let payload = self.serializer.serialize(message_type, message)?;

        let mut context = PublishContext {
            bus_name: self.name.clone(),
            message_type: message_type.clone(),
            path,
            payload,
            headers,
        };

        for interceptor in &self.publish_interceptors {
            if interceptor.on_publish(&mut context, cancel).await? == PublishDecision::Handled {
                debug!(
                    message_type = %context.message_type.short_name(),
                    path = %context.path,
                    "Publish handled by interceptor"
                );
                return Ok(());
            }
        }

        self.produce_to_transport(
            context.message_type,
            context.path,
            context.payload,
            context.headers,
            cancel,
        )
        .await
    }

    async fn produce_to_transport(
        &self,
        message_type: MessageType,
        path: String,
        payload: Bytes,
        headers: Headers,
        cancel: &CancellationToken,
    ) -> Result<(), BusError> {
        let message = if self.transport.supports_headers() {
            TransportMessage {
                message_type,
                path,
                payload,
                headers,
            }
        } else {
            let envelope = MessageWithHeaders::with_headers(payload, headers);
            TransportMessage {
                message_type,
                path,
                payload: envelope.to_bytes()?,
                headers: Headers::new(),
            }
        };

        let (path, message_type) = (message.path.clone(), message.message_type.clone());
        self.transport
            .produce_to_transport(message, cancel)
            .await
            .map_err(|e| match e {
                BusError::Cancelled | BusError::ProduceFailed { .. } => e,
                other => BusError::ProduceFailed {
                    path,
                    message_type: message_type.to_string(),
                    message: other.to_string(),
                },
            })
    }

    // ------------------------------------------------------------------------
    // Request / Response
    // ------------------------------------------------------------------------

    /// Send a request and wait for its correlated response.
    ///
    /// Timeouts and cancellation are observed while waiting: an expired
    /// request fails with [`BusError::RequestTimeout`], a cancelled token with
    /// [`BusError::Cancelled`], and an error reported by the responder with
    /// [`BusError::RequestFaulted`].
    pub async fn send<Req, Resp>(
        &self,
        request: &Req,
        options: SendOptions,
        cancel: &CancellationToken,
    ) -> Result<Resp, BusError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.assert_active()?;
        let settings = self
            .request_response
            .as_ref()
            .ok_or(ConfigurationError::RequestResponseNotConfigured)?;

        if cancel.is_cancelled() {
            return Err(BusError::Cancelled);
        }

        // A bus built outside a runtime has no sweeper yet
        self.pending.start();

        let request_type = MessageType::of::<Req>();
        let response_type = MessageType::of::<Resp>();
        let producer = self.producer_settings(&request_type)?;
        let path = Self::resolve_path(producer, options.path.as_deref())?;
        let timeout = options
            .timeout
            .or(producer.timeout)
            .unwrap_or(settings.timeout);

        let created = self.time_provider.now();
        let expires = created.add(timeout);
        let request_id = RequestId::new();

        let mut request_headers = options.headers;
        request_headers.insert(headers::REQUEST_ID.to_string(), request_id.to_string());
        request_headers.insert(headers::EXPIRES.to_string(), expires.to_rfc3339());

        let value = to_value(request)?;
        let payload = self.serializer.serialize(&request_type, &value)?;

        let (state, mut receiver) = PendingRequestState::new(
            request_id.clone(),
            value,
            request_type.clone(),
            response_type,
            created,
            expires,
            cancel.clone(),
        );
        let state = Arc::new(state);
        let store = self.pending.store();
        store.add(Arc::clone(&state))?;

        debug!(
            request_id = %request_id,
            request_type = %request_type.short_name(),
            path = %path,
            expires = %expires,
            "Sending request"
        );

        if let Err(e) = self
            .produce_request(request_type, path, payload, request_headers, settings, cancel)
            .await
        {
            store.remove(&request_id);
            return Err(e);
        }

        let outcome = tokio::select! {
            biased;
            outcome = &mut receiver => Some(outcome),
            _ = cancel.cancelled() => None,
        };
        let outcome = match outcome {
            Some(outcome) => outcome,
            None => {
                state.try_resolve(RequestOutcome::Cancelled(CancelReason::Cancelled));
                store.remove(&request_id);
                receiver.await
            }
        };

        match outcome {
            Ok(RequestOutcome::Response(value)) => Ok(from_value(value)?),
            Ok(RequestOutcome::Fault(message)) => Err(BusError::RequestFaulted { message }),
            Ok(RequestOutcome::Cancelled(CancelReason::TimedOut)) => {
                Err(BusError::RequestTimeout {
                    request_id: request_id.to_string(),
                })
            }
            Ok(RequestOutcome::Cancelled(CancelReason::Cancelled)) | Err(_) => {
                Err(BusError::Cancelled)
            }
            Ok(RequestOutcome::Failed(e)) => Err(e),
        }
    }

    async fn produce_request(
        &self,
        request_type: MessageType,
        path: String,
        payload: Bytes,
        mut request_headers: Headers,
        settings: &RequestResponseSettings,
        cancel: &CancellationToken,
    ) -> Result<(), BusError> {
        request_headers.insert(headers::REPLY_TO.to_string(), settings.path.clone());
        self.produce_to_transport(request_type, path, payload, request_headers, cancel)
            .await
    }

    /// Produce the response for a received request to its `ReplyTo` path.
    ///
    /// `response` carries either the response message or the error message
    /// reported back to the requester.
    pub async fn produce_response(
        &self,
        request_headers: &Headers,
        response_type: &MessageType,
        response: Result<MessageValue, String>,
        cancel: &CancellationToken,
    ) -> Result<(), BusError> {
        self.assert_active()?;

        let request_id = request_headers
            .get(headers::REQUEST_ID)
            .ok_or_else(|| ValidationError::Required {
                field: headers::REQUEST_ID.to_string(),
            })?;
        let reply_to = request_headers
            .get(headers::REPLY_TO)
            .ok_or_else(|| ValidationError::Required {
                field: headers::REPLY_TO.to_string(),
            })?;

        let mut response_headers = Headers::new();
        response_headers.insert(headers::REQUEST_ID.to_string(), request_id.clone());

        let payload = match response {
            Ok(value) => self.serializer.serialize(response_type, &value)?,
            Err(message) => {
                response_headers.insert(headers::ERROR.to_string(), message);
                Bytes::new()
            }
        };

        self.produce_to_transport(
            response_type.clone(),
            reply_to.clone(),
            payload,
            response_headers,
            cancel,
        )
        .await
    }

    /// Resolve the pending request a response belongs to.
    ///
    /// Responses for requests that are no longer pending (expired, cancelled or
    /// already answered) are discarded.
    pub fn on_response_arrived(
        &self,
        payload: &[u8],
        path: &str,
        request_id: &RequestId,
        error_message: Option<&str>,
    ) {
        let store = self.pending.store();
        let Some(state) = store.get_by_id(request_id) else {
            debug!(
                request_id = %request_id,
                path = %path,
                "Response arrived for a request that is no longer pending, discarding"
            );
            return;
        };

        let outcome = match error_message {
            Some(message) => RequestOutcome::Fault(message.to_string()),
            None => match self.serializer.deserialize(&state.response_type, payload) {
                Ok(value) => RequestOutcome::Response(value),
                Err(e) => {
                    warn!(
                        request_id = %request_id,
                        response_type = %state.response_type.short_name(),
                        error = %e,
                        "Failed to deserialize response"
                    );
                    RequestOutcome::Failed(e.into())
                }
            },
        };

        if state.try_resolve(outcome) {
            debug!(request_id = %request_id, path = %path, "Response delivered");
        }
        store.remove(request_id);
    }

    /// Resolve a pending request from a response carrying native headers
    pub fn on_response_message_arrived(&self, payload: &[u8], path: &str, response_headers: &Headers) {
        let Some(request_id) = response_headers.get(headers::REQUEST_ID) else {
            error!(path = %path, "Response is missing the {} header", headers::REQUEST_ID);
            return;
        };

        match request_id.parse::<RequestId>() {
            Ok(request_id) => self.on_response_arrived(
                payload,
                path,
                &request_id,
                response_headers.get(headers::ERROR).map(String::as_str),
            ),
            Err(e) => error!(path = %path, error = %e, "Response has an invalid request id"),
        }
    }

    /// Resolve a pending request from a response wrapped in a [`MessageWithHeaders`] envelope
    pub fn on_response_envelope_arrived(&self, envelope: &[u8], path: &str) -> Result<(), BusError> {
        let envelope = MessageWithHeaders::from_bytes(envelope)?;
        self.on_response_message_arrived(&envelope.payload, path, &envelope.headers);
        Ok(())
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("name", &self.name)
            .field("producers", &self.producers.len())
            .field("request_response", &self.request_response)
            .field("started", &self.is_started())
            .finish()
    }
}
