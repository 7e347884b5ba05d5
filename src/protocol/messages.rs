//! Wire types shared by the broker side and the session side
//!
//! Every message exchanged with a downstream session is a JSON text frame.
//! Client requests decode into [`ClientMessage`]; everything the relay sends
//! back is a [`WireMessage`] envelope with a `type` tag and an ISO-8601
//! timestamp.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MQTT delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QosLevel {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QosLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QosLevel::AtMostOnce),
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(format!("invalid QoS level {other}, expected 0, 1 or 2")),
        }
    }
}

impl From<QosLevel> for u8 {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

/// Inbound broker message as handed to the classifier
///
/// Immutable once built; each pipeline stage takes it by value or by shared
/// reference.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
    pub qos: QosLevel,
}

impl MessageEnvelope {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QosLevel) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
            qos,
        }
    }

    /// Payload as UTF-8 text, if it is valid UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Publish options a client may attach to a publish request
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishOptions {
    #[serde(default)]
    pub qos: QosLevel,
    #[serde(default)]
    pub retain: bool,
}

/// Requests a downstream session can send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        topic: String,
        #[serde(default)]
        qos: QosLevel,
    },
    Unsubscribe {
        topic: String,
    },
    Publish {
        topic: String,
        message: Value,
        #[serde(default)]
        options: Option<PublishOptions>,
    },
    GetStatus,
    GetHistory {
        topic: String,
        #[serde(default)]
        count: Option<usize>,
    },
    /// Operator request to reconnect the broker link immediately
    Reconnect,
    Ping,
}

impl ClientMessage {
    /// Decode a client text frame
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Kinds of messages the relay sends to sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireMessageType {
    Welcome,
    Message,
    Status,
    History,
    Ack,
    Error,
    EmergencyStop,
    Health,
    BrokerEvent,
    Shutdown,
    Pong,
}

/// Envelope for every relay-to-session message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: WireMessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qos: Option<QosLevel>,
}

impl WireMessage {
    pub fn new(kind: WireMessageType) -> Self {
        Self {
            kind,
            topic: None,
            data: None,
            timestamp: Utc::now(),
            qos: None,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_qos(mut self, qos: QosLevel) -> Self {
        self.qos = Some(qos);
        self
    }

    /// Error reply with a human-readable message
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(WireMessageType::Error).with_data(serde_json::json!({
            "message": message.into(),
        }))
    }

    /// Acknowledge a client request
    pub fn ack(action: &str, topic: &str) -> Self {
        Self::new(WireMessageType::Ack)
            .with_topic(topic)
            .with_data(serde_json::json!({ "action": action }))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
