//! Transactional outbox.
//!
//! Publishes of captured message types are saved to an [`OutboxRepository`]
//! by the [`OutboxForwardingPublishInterceptor`] instead of reaching the
//! transport. The [`OutboxSendingTask`] later leases the saved rows and
//! forwards them through the bus that captured them.
//!
//! - [`message`] - persisted row and its lease state
//! - [`repository`] - storage contract and the in-memory store
//! - [`interceptor`] - capture on publish
//! - [`sending_task`] - leasing, forwarding and cleanup loop
//! - [`settings`] - polling, lease and cleanup tuning
//! - [`instance`] - lease owner identity

pub mod instance;
pub mod interceptor;
pub mod message;
pub mod repository;
pub mod sending_task;
pub mod settings;

pub use instance::{DefaultInstanceIdProvider, InstanceIdProvider};
pub use interceptor::OutboxForwardingPublishInterceptor;
pub use message::{OutboxMessage, OutboxMessageId};
pub use repository::{InMemoryOutboxRepository, OutboxRepository};
pub use sending_task::OutboxSendingTask;
pub use settings::{MessageCleanupSettings, OutboxSettings};
