//! Transport contract implemented by broker bindings.

use crate::cancellation::CancellationToken;
use crate::error::BusError;
use crate::message::{Headers, MessageType};
use async_trait::async_trait;
use bytes::Bytes;

/// Serialized message handed to a transport for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub message_type: MessageType,
    pub path: String,
    pub payload: Bytes,
    pub headers: Headers,
}

/// Interface to a concrete broker binding.
///
/// Inbound responses are delivered back to the bus by the binding through
/// [`crate::MessageBus::on_response_arrived`] or one of its envelope variants.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a message to the broker
    async fn produce_to_transport(
        &self,
        message: TransportMessage,
        cancel: &CancellationToken,
    ) -> Result<(), BusError>;

    /// Whether headers travel natively alongside the payload.
    ///
    /// When `false` the bus wraps payload and headers into a
    /// [`crate::message::MessageWithHeaders`] envelope.
    fn supports_headers(&self) -> bool {
        true
    }
}
