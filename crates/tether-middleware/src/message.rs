//! Message capability used by publishers and subscribers.
//!
//! Statically typed messages implement [`JsonMessage`] and get [`Message`]
//! for free. [`RawMessage`] carries bytes that are already serialized; its
//! type is only known when the topic is registered, so publishers and
//! subscribers of raw messages are handed a [`MessageType`] explicitly.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tether_types::{ImplKind, MessageIoError};

/// Name and representation of the messages on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageType {
    pub type_name: String,
    pub impl_kind: ImplKind,
}

impl MessageType {
    pub fn new(type_name: impl Into<String>, impl_kind: ImplKind) -> Self {
        Self {
            type_name: type_name.into(),
            impl_kind,
        }
    }
}

pub trait Message: Send + Sized + 'static {
    fn serialize(&self) -> Result<Vec<u8>, MessageIoError>;

    fn deserialize(bytes: &[u8]) -> Result<Self, MessageIoError>;

    /// Type descriptor known at compile time, `None` for dynamic messages.
    fn message_type() -> Option<MessageType>;
}

/// Serde messages encoded as JSON on the wire.
pub trait JsonMessage: Serialize + DeserializeOwned + Send + 'static {
    const TYPE_NAME: &'static str;
}

impl<T: JsonMessage> Message for T {
    fn serialize(&self) -> Result<Vec<u8>, MessageIoError> {
        serde_json::to_vec(self).map_err(|e| MessageIoError::Serialize(e.to_string()))
    }

    fn deserialize(bytes: &[u8]) -> Result<Self, MessageIoError> {
        serde_json::from_slice(bytes).map_err(|e| MessageIoError::Deserialize(e.to_string()))
    }

    fn message_type() -> Option<MessageType> {
        Some(MessageType::new(T::TYPE_NAME, ImplKind::Json))
    }
}

/// Opaque, already serialized message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawMessage(pub Vec<u8>);

impl Message for RawMessage {
    fn serialize(&self) -> Result<Vec<u8>, MessageIoError> {
        Ok(self.0.clone())
    }

    fn deserialize(bytes: &[u8]) -> Result<Self, MessageIoError> {
        Ok(RawMessage(bytes.to_vec()))
    }

    fn message_type() -> Option<MessageType> {
        None
    }
}


#[cfg(test)]
mod tests {
    use super::testing::SimpleMessage;
    use super::*;

    #[test]
    fn json_message_roundtrip_and_type() {
        let msg = SimpleMessage { data: 42, timestamp: 1_700_000_000_000 };
        let bytes = Message::serialize(&msg).unwrap();
        assert_eq!(SimpleMessage::deserialize(&bytes).unwrap(), msg);
        let ty = SimpleMessage::message_type().unwrap();
        assert_eq!(ty.type_name, "tether.test.SimpleMessage");
        assert_eq!(ty.impl_kind, ImplKind::Json);
    }

    #[test]
    fn garbage_fails_to_deserialize() {
        let err = SimpleMessage::deserialize(b"not json").unwrap_err();
        assert!(matches!(err, MessageIoError::Deserialize(_)));
    }

    #[test]
    fn raw_message_has_no_static_type() {
        assert!(RawMessage::message_type().is_none());
        let raw = RawMessage(vec![1, 2, 3]);
        assert_eq!(RawMessage::deserialize(&raw.serialize().unwrap()).unwrap(), raw);
    }
}
