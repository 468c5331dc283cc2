use crate::errors::MessagingError;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;

/// Channel-scoped handle of an inbound delivery that was not acknowledged yet.
///
/// `channel_serial` identifies the registry channel that received the delivery;
/// the broker's `tag` is only meaningful on that channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    pub channel_serial: u64,
    pub tag: u64,
}

/// Transport agnostic envelope used by every publish and consume operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    /// Queue the message targets, or the one it was consumed from.
    pub entity_name: String,
    pub payload: Box<[u8]>,
    pub metadata: HashMap<String, String>,
    /// Second precision, the wire timestamp carries no fraction.
    pub timestamp: Option<DateTime<Utc>>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub msg_type: Option<String>,
    pub content_type: Option<String>,
    pub priority: Option<u8>,
    pub group_id: Option<String>,
    pub deduplication_id: Option<String>,
    /// Overrides the configured delivery mode when set.
    pub persistent: Option<bool>,
    pub redelivered: bool,
    pub delivery: Option<DeliveryTag>,
}

impl Message {
    pub fn new<T>(entity_name: T, payload: &[u8]) -> Self
    where
        T: Into<String>,
    {
        Message {
            entity_name: entity_name.into(),
            payload: payload.into(),
            ..Message::default()
        }
    }

    pub fn json<T, V>(entity_name: T, value: &V) -> Result<Self, MessagingError>
    where
        T: Into<String>,
        V: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(value)
            .map_err(|err| MessagingError::SerializationError(err.to_string()))?;

        Ok(Message::new(entity_name, &payload).with_content_type("application/json"))
    }

    pub fn deserialize_payload<V>(&self) -> Result<V, MessagingError>
    where
        V: DeserializeOwned,
    {
        serde_json::from_slice(&self.payload)
            .map_err(|err| MessagingError::SerializationError(err.to_string()))
    }

    pub fn with_metadata<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = DateTime::<Utc>::from_timestamp(timestamp.timestamp(), 0);
        self
    }

    pub fn with_message_id<T: Into<String>>(mut self, id: T) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_correlation_id<T: Into<String>>(mut self, id: T) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_msg_type<T: Into<String>>(mut self, msg_type: T) -> Self {
        self.msg_type = Some(msg_type.into());
        self
    }

    pub fn with_content_type<T: Into<String>>(mut self, content_type: T) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_group_id<T: Into<String>>(mut self, group_id: T) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_deduplication_id<T: Into<String>>(mut self, id: T) -> Self {
        self.deduplication_id = Some(id.into());
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = Some(persistent);
        self
    }

    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Whether this message still holds the ownership token to ack or reject it.
    pub fn is_pending_ack(&self) -> bool {
        self.delivery.is_some()
    }
}
