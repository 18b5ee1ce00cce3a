//! Publish interceptor capturing outgoing messages into the outbox.

use super::message::OutboxMessage;
use super::repository::OutboxRepository;
use crate::cancellation::CancellationToken;
use crate::error::BusError;
use crate::interceptor::{PublishContext, PublishDecision, PublishInterceptor};
use crate::message::{headers, MessageType};
use crate::time::TimeProvider;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

#[cfg(test)]
#[path = "interceptor_tests.rs"]
mod tests;

/// Saves published messages to the outbox instead of producing them.
///
/// Messages carrying the `SkipOutbox` header are being forwarded by the
/// outbox loop; the header is removed and the publish continues.
pub struct OutboxForwardingPublishInterceptor {
    repository: Arc<dyn OutboxRepository>,
    time_provider: Arc<dyn TimeProvider>,
    /// `None` captures every message type
    message_types: Option<HashSet<MessageType>>,
}

impl OutboxForwardingPublishInterceptor {
    /// Capture every published message
    pub fn new(repository: Arc<dyn OutboxRepository>, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            repository,
            time_provider,
            message_types: None,
        }
    }

    /// Capture only the listed message types
    pub fn for_message_types(
        repository: Arc<dyn OutboxRepository>,
        time_provider: Arc<dyn TimeProvider>,
        message_types: impl IntoIterator<Item = MessageType>,
    ) -> Self {
        Self {
            repository,
            time_provider,
            message_types: Some(message_types.into_iter().collect()),
        }
    }

    fn captures(&self, message_type: &MessageType) -> bool {
        self.message_types
            .as_ref()
            .map_or(true, |types| types.contains(message_type))
    }
}

#[async_trait]
impl PublishInterceptor for OutboxForwardingPublishInterceptor {
    async fn on_publish(
        &self,
        context: &mut PublishContext,
        cancel: &CancellationToken,
    ) -> Result<PublishDecision, BusError> {
        if context.headers.remove(headers::SKIP_OUTBOX).is_some() {
            return Ok(PublishDecision::Continue);
        }
        if !self.captures(&context.message_type) {
            return Ok(PublishDecision::Continue);
        }

        let message = OutboxMessage::new(
            context.bus_name.clone(),
            context.path.clone(),
            context.message_type.clone(),
            context.payload.clone(),
            context.headers.clone(),
            self.time_provider.now(),
        );
        let id = message.id;
        self.repository.save(message, cancel).await?;

        debug!(
            outbox_message_id = %id,
            message_type = %context.message_type.short_name(),
            path = %context.path,
            "Message captured in outbox"
        );
        Ok(PublishDecision::Handled)
    }
}
