//! Transport layer for the upstream broker link
//!
//! This module provides the transport abstraction used by the rest of the
//! relay and its MQTT implementation.
//!
//! ```rust
//! use bytes::Bytes;
//! use robot_relay::protocol::{PublishOptions, QosLevel};
//! use robot_relay::testing::MockTransport;
//! use robot_relay::transport::Transport;
//!
//! # tokio_test::block_on(async {
//! let transport = MockTransport::connected();
//! transport.subscribe("scale/#", QosLevel::AtLeastOnce).await.unwrap();
//! transport
//!     .publish("processed/weight", Bytes::from_static(b"{}"), PublishOptions::default())
//!     .await
//!     .unwrap();
//! assert_eq!(transport.get_published().await.len(), 1);
//! # });
//! ```

use crate::protocol::{PublishOptions, QosLevel};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

pub mod mqtt;

pub use mqtt::{
    BrokerConnection, BrokerError, BrokerEvent, ConnectError, ConnectionPhase, ConnectionSnapshot,
    ManualReconnect,
};

/// Operations the relay needs from its broker link
///
/// Abstracted so the pipeline, hub and health monitor can be exercised
/// against an in-memory mock.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe upstream; queued and replayed when not yet connected
    async fn subscribe(&self, pattern: &str, qos: QosLevel) -> Result<(), BrokerError>;

    /// Publish upstream; fails fast with `NotConnected` when the link is down
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), BrokerError>;

    /// Current connection-state record
    fn connection(&self) -> ConnectionSnapshot;

    fn is_connected(&self) -> bool {
        self.connection().connected
    }

    /// Operator "reconnect now"
    fn request_reconnect(&self) -> Result<ManualReconnect, BrokerError>;

    /// Stamp the connection record with the last heartbeat time
    fn record_heartbeat(&self, at: DateTime<Utc>);

    /// Connection lifecycle events
    fn broker_events(&self) -> broadcast::Receiver<BrokerEvent>;

    /// Flush a shutdown status and close the link
    async fn shutdown(&self) -> Result<(), BrokerError>;
}
