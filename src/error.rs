//! Relay error taxonomy
//!
//! Each layer keeps its own error enum; [`RelayError`] gathers them into the
//! categories the relay reports to sessions. Errors local to one message or one
//! session are turned into an `error` frame for that session and go no further.

use crate::config::ConfigError;
use crate::hub::HubError;
use crate::processing::decode::DecodeError;
use crate::processing::EmergencySignal;
use crate::protocol::{TopicError, WireMessage, WireMessageType};
use crate::transport::{BrokerError, ConnectError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Longest error message sent to a session
const MAX_ERROR_MESSAGE_LEN: usize = 500;

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("path pattern is valid")
});

/// Top-level error type for relay operations
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Malformed payload on {topic}: {source}")]
    MalformedPayload {
        topic: String,
        #[source]
        source: DecodeError,
    },

    #[error("Command rejected on {topic}: {reason}")]
    ValidationRejection { topic: String, reason: String },

    #[error("Session {session_id} I/O error: {message}")]
    SessionIo { session_id: Uuid, message: String },

    #[error("Emergency condition on {topic}: {keyword}")]
    EmergencyCondition { topic: String, keyword: String },

    #[error("Invalid topic: {0}")]
    Topic(#[from] TopicError),

    #[error("Session error: {0}")]
    Hub(#[from] HubError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl RelayError {
    /// Stable machine-readable code for the error frame
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Connection(_) => "connection_error",
            RelayError::Broker(BrokerError::NotConnected { .. }) => "not_connected",
            RelayError::Broker(_) => "broker_error",
            RelayError::MalformedPayload { .. } => "malformed_payload",
            RelayError::ValidationRejection { .. } => "validation_rejected",
            RelayError::SessionIo { .. } => "session_io",
            RelayError::EmergencyCondition { .. } => "emergency",
            RelayError::Topic(_) => "invalid_topic",
            RelayError::Hub(_) => "session_error",
            RelayError::Config(_) => "config_error",
            RelayError::InvalidRequest(_) => "invalid_request",
        }
    }

    /// Client-visible error frame with the message sanitized
    pub fn to_error_message(&self) -> WireMessage {
        WireMessage::new(WireMessageType::Error).with_data(json!({
            "code": self.code(),
            "message": sanitize_error_message(&self.to_string()),
        }))
    }

    pub fn malformed(topic: impl Into<String>, source: DecodeError) -> Self {
        Self::MalformedPayload {
            topic: topic.into(),
            source,
        }
    }

    pub fn rejected(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ValidationRejection {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    pub fn emergency(topic: impl Into<String>, signal: &EmergencySignal) -> Self {
        Self::EmergencyCondition {
            topic: topic.into(),
            keyword: signal.keyword.clone(),
        }
    }

    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest(message.into())
    }
}

/// Mask secrets and sensitive paths, cap the length
pub fn sanitize_error_message(message: &str) -> String {
    let masked = SECRET_PATTERN.replace_all(message, "${1}=***");
    let mut sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&masked, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_ERROR_MESSAGE_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(suffix);
    }

    sanitized
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
