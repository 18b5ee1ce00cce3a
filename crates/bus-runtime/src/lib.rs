//! # Bus Runtime
//!
//! Transport-agnostic message bus runtime. Broker bindings plug in through the
//! [`Transport`] trait; everything above the wire lives here.
//!
//! This library provides:
//! - Publishing of declared message types to default or explicit paths
//! - Request/response correlation with timeouts, cancellation and a background sweeper
//! - Bounded-concurrency message processing with first-failure reporting
//! - A transactional outbox with leased, multi-instance delivery
//! - Composite buses routing publishes to the child that declares the type
//!
//! ## Module Organization
//!
//! - [`bus`] - Message bus, builder and request/response coordination
//! - [`composite`] - Named child buses behind one facade
//! - [`pending`] - Pending request store and sweeper
//! - [`consumer`] - Message processors and the concurrency limiter
//! - [`outbox`] - Outbox capture, storage and the sending loop
//! - [`interceptor`] - Publish and lifecycle extension points
//! - [`transport`] / [`transports`] - Transport contract and the in-memory transport
//! - [`config`] / [`settings`] - Layered configuration and per-bus settings
//! - [`error`] - Error types for all bus operations

// Module declarations
pub mod bus;
pub mod cancellation;
pub mod composite;
pub mod config;
pub mod consumer;
pub mod error;
pub mod interceptor;
pub mod message;
pub mod outbox;
pub mod pending;
pub mod serialization;
pub mod settings;
pub mod time;
pub mod transport;
pub mod transports;

// Re-export commonly used types at crate root for convenience
pub use bus::{MessageBus, MessageBusBuilder, SendOptions};
pub use cancellation::CancellationToken;
pub use composite::CompositeMessageBus;
pub use config::RuntimeConfig;
pub use consumer::{ConcurrencyBoundedProcessor, FailedMessage, MessageProcessor, ProcessResult};
pub use error::{BusError, ConfigurationError, SerializationError, ValidationError};
pub use interceptor::{
    BusLifecycleEvent, BusLifecycleInterceptor, PublishContext, PublishDecision,
    PublishInterceptor,
};
pub use message::{
    headers, Headers, MessageType, MessageValue, MessageWithHeaders, RequestId, Timestamp,
};
pub use outbox::{
    InMemoryOutboxRepository, OutboxForwardingPublishInterceptor, OutboxRepository,
    OutboxSendingTask, OutboxSettings,
};
pub use pending::{InMemoryPendingRequestStore, PendingRequestManager, PendingRequestStore};
pub use serialization::{JsonMessageSerializer, MessageSerializer};
pub use settings::{PendingRequestSettings, ProducerSettings, RequestResponseSettings};
pub use time::{ManualTimeProvider, SystemTimeProvider, TimeProvider};
pub use transport::{Transport, TransportMessage};
pub use transports::InMemoryTransport;

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
