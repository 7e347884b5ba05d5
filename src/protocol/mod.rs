//! Wire protocol types and topic handling
//!
//! Message envelopes exchanged with the broker and with downstream sessions,
//! plus MQTT-style topic pattern matching.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
