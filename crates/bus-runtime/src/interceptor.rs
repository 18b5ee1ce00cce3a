//! Extension points invoked by the bus on publish and on lifecycle changes.

use crate::bus::MessageBus;
use crate::cancellation::CancellationToken;
use crate::error::BusError;
use crate::message::{Headers, MessageType};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Serialized publish passing through the interceptor chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishContext {
    /// Name of the publishing bus, if it has one
    pub bus_name: Option<String>,
    pub message_type: MessageType,
    pub path: String,
    pub payload: Bytes,
    pub headers: Headers,
}

/// What the bus should do after an interceptor ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishDecision {
    /// Continue with the next interceptor, then the transport
    Continue,
    /// The interceptor took ownership of the message; nothing is produced
    Handled,
}

/// Interceptor run for every publish before the message reaches the transport
#[async_trait]
pub trait PublishInterceptor: Send + Sync {
    async fn on_publish(
        &self,
        context: &mut PublishContext,
        cancel: &CancellationToken,
    ) -> Result<PublishDecision, BusError>;
}

/// Bus lifecycle transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusLifecycleEvent {
    Started,
    Stopping,
}

/// Interceptor notified when a bus starts or stops
#[async_trait]
pub trait BusLifecycleInterceptor: Send + Sync {
    async fn on_bus_lifecycle(
        &self,
        event: BusLifecycleEvent,
        bus: &Arc<MessageBus>,
    ) -> Result<(), BusError>;
}
