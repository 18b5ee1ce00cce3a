//! Composite bus grouping named child buses.

use crate::bus::MessageBus;
use crate::cancellation::CancellationToken;
use crate::error::{BusError, ConfigurationError};
use crate::message::MessageType;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Set of named child buses started and stopped together.
///
/// Publishing routes each message to the child that declares its type.
#[derive(Debug, Default)]
pub struct CompositeMessageBus {
    children: BTreeMap<String, Arc<MessageBus>>,
}

impl CompositeMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a child bus. The child must have a unique name.
    pub fn add_child(&mut self, bus: Arc<MessageBus>) -> Result<(), BusError> {
        let name = bus
            .name()
            .ok_or_else(|| ConfigurationError::Missing {
                key: "bus name".to_string(),
            })?
            .to_string();

        if self.children.contains_key(&name) {
            return Err(ConfigurationError::Invalid {
                message: format!("child bus '{}' was added more than once", name),
            }
            .into());
        }

        self.children.insert(name, bus);
        Ok(())
    }

    pub fn with_child(mut self, bus: Arc<MessageBus>) -> Result<Self, BusError> {
        self.add_child(bus)?;
        Ok(self)
    }

    pub fn get_child_bus(&self, name: &str) -> Option<&Arc<MessageBus>> {
        self.children.get(name)
    }

    pub fn children(&self) -> impl Iterator<Item = &Arc<MessageBus>> {
        self.children.values()
    }

    /// Child declaring the message type as produced
    pub fn find_producer_bus(&self, message_type: &MessageType) -> Option<&Arc<MessageBus>> {
        self.children
            .values()
            .find(|bus| bus.declares_producer(message_type))
    }

    pub async fn start(&self) -> Result<(), BusError> {
        for bus in self.children.values() {
            bus.start().await?;
        }
        info!(children = self.children.len(), "Composite message bus started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), BusError> {
        for bus in self.children.values() {
            bus.stop().await?;
        }
        info!(children = self.children.len(), "Composite message bus stopped");
        Ok(())
    }

    pub async fn dispose(&self) {
        for bus in self.children.values() {
            bus.dispose().await;
        }
    }

    /// Publish through the child that declares `T`
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
        let bus = self
            .find_producer_bus(&message_type)
            .ok_or_else(|| ConfigurationError::UnknownProducer {
                message_type: message_type.to_string(),
            })?;
        bus.publish(message, path, cancel).await
    }
}

#[cfg(test)]
#[path = "composite_tests.rs"]
mod tests;
