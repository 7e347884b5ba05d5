//! Mock implementations for testing
//!
//! Provides an in-memory [`Transport`] so the pipeline, hub and health monitor
//! can be tested without a broker.

use crate::protocol::{PublishOptions, QosLevel};
use crate::transport::{
    BrokerError, BrokerEvent, ConnectionPhase, ConnectionSnapshot, ManualReconnect, Transport,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

/// One recorded upstream publish
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub options: PublishOptions,
}

impl PublishedMessage {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

/// Mock transport for testing
#[derive(Debug)]
pub struct MockTransport {
    pub published: Arc<Mutex<Vec<PublishedMessage>>>,
    pub subscriptions: Arc<Mutex<Vec<(String, QosLevel)>>>,
    pub should_fail: AtomicBool,
    pub reconnect_requests: AtomicUsize,
    pub shut_down: AtomicBool,
    snapshot: std::sync::Mutex<ConnectionSnapshot>,
    events: broadcast::Sender<BrokerEvent>,
}

impl Default for MockTransport {
    fn default() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            published: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            should_fail: AtomicBool::new(false),
            reconnect_requests: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
            snapshot: std::sync::Mutex::new(ConnectionSnapshot::new("mock:1883")),
            events,
        }
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that starts out connected
    pub fn connected() -> Self {
        let mock = Self::default();
        mock.set_connected(true);
        mock
    }

    /// A connected transport whose publishes fail
    pub fn with_failure() -> Self {
        let mock = Self::connected();
        mock.should_fail.store(true, Ordering::SeqCst);
        mock
    }

    pub fn set_connected(&self, connected: bool) {
        let phase = if connected {
            ConnectionPhase::Connected
        } else {
            ConnectionPhase::Reconnecting { attempt: 1 }
        };
        self.set_phase(phase);
        let event = if connected {
            BrokerEvent::Connected
        } else {
            BrokerEvent::Disconnected {
                reason: "mock disconnect".to_string(),
            }
        };
        let _ = self.events.send(event);
    }

    pub fn set_phase(&self, phase: ConnectionPhase) {
        let mut snapshot = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        snapshot.set_phase(phase);
    }

    pub async fn get_published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    pub async fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub async fn get_subscriptions(&self) -> Vec<(String, QosLevel)> {
        self.subscriptions.lock().await.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn subscribe(&self, pattern: &str, qos: QosLevel) -> Result<(), BrokerError> {
        let mut subscriptions = self.subscriptions.lock().await;
        if !subscriptions.iter().any(|(p, q)| p == pattern && *q == qos) {
            subscriptions.push((pattern.to_string(), qos));
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected {
                phase: self.connection().phase.label().to_string(),
            });
        }
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(BrokerError::PublishFailed {
                topic: topic.to_string(),
                reason: "mock publish failure".to_string(),
            });
        }
        self.published.lock().await.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            options,
        });
        Ok(())
    }

    fn connection(&self) -> ConnectionSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn request_reconnect(&self) -> Result<ManualReconnect, BrokerError> {
        self.reconnect_requests.fetch_add(1, Ordering::SeqCst);
        match self.connection().phase {
            ConnectionPhase::Failed { reason } => Err(BrokerError::SupervisorFailed(reason)),
            ConnectionPhase::Connected => Ok(ManualReconnect::AlreadyConnected),
            _ => Ok(ManualReconnect::Scheduled),
        }
    }

    fn record_heartbeat(&self, at: DateTime<Utc>) {
        let mut snapshot = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        snapshot.last_heartbeat = Some(at);
    }

    fn broker_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    async fn shutdown(&self) -> Result<(), BrokerError> {
        self.shut_down.store(true, Ordering::SeqCst);
        self.set_phase(ConnectionPhase::Idle);
        Ok(())
    }
}
