//! Message serializer contract and the JSON implementation.
//!
//! The bus hands untyped [`MessageValue`]s to the serializer together with the
//! declared [`MessageType`]; typed conversion happens at the API edge.

use crate::error::SerializationError;
use crate::message::{MessageType, MessageValue};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Converts messages to and from their wire payload
pub trait MessageSerializer: Send + Sync {
    /// Serialize a message of the given type
    fn serialize(
        &self,
        message_type: &MessageType,
        message: &MessageValue,
    ) -> Result<Bytes, SerializationError>;

    /// Deserialize a payload as the given type
    fn deserialize(
        &self,
        message_type: &MessageType,
        payload: &[u8],
    ) -> Result<MessageValue, SerializationError>;
}

/// JSON serializer backed by `serde_json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMessageSerializer;

impl MessageSerializer for JsonMessageSerializer {
    fn serialize(
        &self,
        _message_type: &MessageType,
        message: &MessageValue,
    ) -> Result<Bytes, SerializationError> {
        Ok(Bytes::from(serde_json::to_vec(message)?))
    }

    fn deserialize(
        &self,
        message_type: &MessageType,
        payload: &[u8],
    ) -> Result<MessageValue, SerializationError> {
        if payload.is_empty() {
            return Err(SerializationError::EmptyPayload {
                message_type: message_type.to_string(),
            });
        }
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Convert a typed message into its untyped representation
pub fn to_value<T: Serialize + ?Sized>(message: &T) -> Result<MessageValue, SerializationError> {
    Ok(serde_json::to_value(message)?)
}

/// Convert an untyped message into a typed one
pub fn from_value<T: DeserializeOwned>(value: MessageValue) -> Result<T, SerializationError> {
    Ok(serde_json::from_value(value)?)
}
