use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::message::{Message, MessageMetadata, UNVERSIONED_MAX};
use crate::Result;

/// Wire shape of a [`Message`].
#[derive(Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "Version", default, skip_serializing_if = "Option::is_none")]
    version: Option<i32>,
    #[serde(rename = "MessageType")]
    message_type: String,
    #[serde(rename = "Payload", default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
}

/// Converts between wire text, [`Message`] envelopes and typed payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataSerializer;

impl DataSerializer {
    pub fn new() -> Self {
        Self
    }

    /// A message with no payload.
    pub fn serialize_message(&self, message_type: &str) -> Result<String> {
        self.serialize(&Message::new(message_type, None, 0))
    }

    pub fn serialize_payload<T: Serialize + ?Sized>(
        &self,
        message_type: &str,
        payload: &T,
        version: i32,
    ) -> Result<String> {
        let payload = serde_json::to_value(payload)?;
        self.serialize(&Message::new(message_type, Some(payload), version))
    }

    pub fn serialize(&self, message: &Message) -> Result<String> {
        let wire = WireMessage {
            version: (message.version > UNVERSIONED_MAX).then_some(message.version),
            message_type: message.message_type.clone(),
            payload: message.payload.clone(),
        };
        Ok(serde_json::to_string(&wire)?)
    }

    pub fn deserialize_message(&self, raw: &str) -> Result<Message> {
        let wire: WireMessage = serde_json::from_str(raw)?;
        Ok(Message {
            message_type: wire.message_type,
            payload: wire.payload,
            version: wire.version.unwrap_or(0),
        })
    }

    /// A missing payload deserializes as JSON `null`.
    pub fn deserialize_payload<T: DeserializeOwned>(&self, message: &Message) -> Result<T> {
        let value = message.payload.clone().unwrap_or(Value::Null);
        Ok(serde_json::from_value(value)?)
    }

    pub fn deserialize_payload_with_metadata<T: DeserializeOwned>(
        &self,
        message: &Message,
    ) -> Result<(T, MessageMetadata)> {
        let payload = self.deserialize_payload(message)?;
        let metadata = MessageMetadata {
            version: Some(message.version),
            recipient: None,
            message_type: Some(message.message_type.clone()),
        };
        Ok((payload, metadata))
    }
}
