//! Pure connection state management for the broker link
//!
//! This module contains the shared connection-state record, the transport
//! error types and the pure functions that build client options and classify
//! connection failures.

use crate::config::BrokerSection;
use crate::protocol::{QosLevel, TopicError};
use chrono::{DateTime, Utc};
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Largest packet accepted from the broker
const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Lifecycle phase of the broker link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionPhase {
    /// Not started, or cleanly shut down
    Idle,
    /// An attempt is in flight
    Connecting,
    /// ConnAck received
    Connected,
    /// Waiting before retry `attempt`
    Reconnecting { attempt: u32 },
    /// Retries exhausted; needs a restart
    Failed { reason: String },
}

impl ConnectionPhase {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionPhase::Connected)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectionPhase::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConnectionPhase::Idle => "idle",
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Connected => "connected",
            ConnectionPhase::Reconnecting { .. } => "reconnecting",
            ConnectionPhase::Failed { .. } => "failed",
        }
    }
}

/// Why a connection attempt failed
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum ConnectError {
    #[error("broker rejected credentials: {0}")]
    Auth(String),
    #[error("broker unreachable: {0}")]
    Network(String),
    #[error("TLS failure: {0}")]
    Tls(String),
}

/// Broker operation failures
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("not connected to broker (state: {phase})")]
    NotConnected { phase: String },
    #[error("subscribe to {pattern} failed: {reason}")]
    SubscribeFailed { pattern: String, reason: String },
    #[error("publish to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },
    #[error("invalid topic {topic}: {source}")]
    InvalidTopic {
        topic: String,
        #[source]
        source: TopicError,
    },
    #[error("serialization error")]
    Serialization(#[from] serde_json::Error),
    #[error("reconnect supervisor failed: {0}")]
    SupervisorFailed(String),
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// Shared connection-state record
///
/// Written by the broker event loop and the health monitor, read by every
/// other component through a `watch` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub connected: bool,
    pub phase: ConnectionPhase,
    /// Retry number of the current or next attempt; zero while connected
    pub attempt: u32,
    /// Consecutive failed attempts
    pub failures: u32,
    pub last_error: Option<ConnectError>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub connected_since: Option<DateTime<Utc>>,
    pub broker: String,
    /// Inbound publishes dropped because the processing queue was full
    #[serde(default)]
    pub inbound_dropped: u64,
}

impl ConnectionSnapshot {
    pub fn new(broker: impl Into<String>) -> Self {
        Self {
            connected: false,
            phase: ConnectionPhase::Idle,
            attempt: 0,
            failures: 0,
            last_error: None,
            last_heartbeat: None,
            connected_since: None,
            broker: broker.into(),
            inbound_dropped: 0,
        }
    }

    /// Apply a phase change, keeping `connected` consistent with it
    pub fn set_phase(&mut self, phase: ConnectionPhase) {
        let now_connected = phase.is_connected();
        if now_connected && !self.connected {
            self.connected_since = Some(Utc::now());
        } else if !now_connected {
            self.connected_since = None;
        }
        self.connected = now_connected;
        self.phase = phase;
    }
}

/// Events published by the broker link for observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BrokerEvent {
    Connected,
    Disconnected { reason: String },
    Reconnecting { attempt: u32, delay_ms: u64 },
    Failed { reason: String },
}

/// Build client options from the broker section
///
/// Credentials have already been resolved from the environment when the
/// configuration was loaded.
pub fn configure_mqtt_options(config: &BrokerSection) -> MqttOptions {
    let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    if config.tls {
        options.set_transport(RumqttcTransport::tls_with_default_config());
    }
    if let Some(credentials) = &config.credentials {
        options.set_credentials(&credentials.username, &credentials.password);
    }
    options
}

/// Classify a connection failure from its rendered message
pub fn classify_failure(message: &str) -> ConnectError {
    let lowered = message.to_lowercase();
    let auth_markers = [
        "notauthorized",
        "not authorized",
        "badusername",
        "bad user name",
        "username",
        "password",
        "bad authentication",
    ];
    if lowered.contains("refused") && auth_markers.iter().any(|m| lowered.contains(m)) {
        ConnectError::Auth(message.to_string())
    } else if lowered.contains("tls") || lowered.contains("certificate") {
        ConnectError::Tls(message.to_string())
    } else {
        ConnectError::Network(message.to_string())
    }
}

pub fn to_mqtt_qos(qos: QosLevel) -> QoS {
    match qos {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

pub fn from_mqtt_qos(qos: QoS) -> QosLevel {
    match qos {
        QoS::AtMostOnce => QosLevel::AtMostOnce,
        QoS::AtLeastOnce => QosLevel::AtLeastOnce,
        QoS::ExactlyOnce => QosLevel::ExactlyOnce,
    }
}
