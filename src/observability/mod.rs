//! Observability: structured logging and relay metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{MetricsCollector, MetricsSnapshot};

pub use logging::{broker_span, relay_span, session_span};
