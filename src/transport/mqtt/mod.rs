//! MQTT broker link
//!
//! Split the same way as the rest of the transport code: pure functions
//! apart from I/O.
//!
//! - [`connection`] - connection-state record, errors and client options
//! - [`message_handler`] - pure routing of event-loop events
//! - [`supervisor`] - pure reconnection policy and state machine
//! - [`client`] - the impure event loop and broker operations

pub mod client;
pub mod connection;
pub mod message_handler;
pub mod supervisor;

pub use client::BrokerConnection;
pub use connection::{
    BrokerError, BrokerEvent, ConnectError, ConnectionPhase, ConnectionSnapshot,
};
pub use message_handler::{EventRoute, MessageHandler};
pub use supervisor::{BackoffPolicy, ManualReconnect, ReconnectSupervisor, ReconnectionDecision};
