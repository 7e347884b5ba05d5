//! robot-relay
//!
//! Bridges an MQTT broker carrying robot telemetry, sensor readings and
//! control commands to any number of live WebSocket sessions.
//!
//! # Overview
//!
//! - One supervised broker link with exponential-backoff reconnection
//! - Per-message classification by topic family, with range validation
//! - Safety validation and clamping of robot commands before they leave
//! - A bounded ring buffer per topic for history and arrival statistics
//! - Non-blocking fan-out to sessions; slow sessions are dropped
//! - Periodic health heartbeats and HTTP health probes
//!
//! # Quick Start
//!
//! ```rust
//! use robot_relay::processing::{TopicClassifier, Category};
//! use robot_relay::protocol::{MessageEnvelope, QosLevel};
//! use robot_relay::config::{LimitsSection, TopicsSection};
//! use bytes::Bytes;
//!
//! let mut classifier = TopicClassifier::new(TopicsSection::default(), LimitsSection::default());
//! let envelope = MessageEnvelope::new("scale/weight", Bytes::from_static(b"15.5"), QosLevel::AtMostOnce);
//! let result = classifier.classify(&envelope);
//! assert_eq!(result.category, Category::Weight);
//! assert!(result.validation.is_accepted());
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod health;
pub mod hub;
pub mod observability;
pub mod processing;
pub mod protocol;
pub mod relay;
pub mod testing;
pub mod transport;

pub use buffer::{BufferStats, RingBuffer, TopicBuffers};
pub use config::*;
pub use error::{RelayError, RelayResult};
pub use health::{HealthMonitor, HealthSnapshot, HealthStatus};
pub use hub::ClientHub;
pub use protocol::*;
pub use relay::RelayContext;
pub use transport::{BrokerConnection, Transport};
