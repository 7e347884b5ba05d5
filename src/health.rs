//! Periodic health reporting
//!
//! Every cycle the monitor rates the broker link, builds a [`HealthSnapshot`],
//! publishes it as the heartbeat, pushes it to every session and keeps it as
//! the latest snapshot for the HTTP health routes. Three degraded cycles in a
//! row (by default) rate the relay `error`; the monitor never stops the
//! process itself.

use crate::config::HealthSection;
use crate::hub::ClientHub;
use crate::observability::{MetricsCollector, MetricsSnapshot};
use crate::protocol::{PublishOptions, QosLevel, WireMessage, WireMessageType};
use crate::transport::{BrokerError, ConnectionSnapshot, Transport};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Error,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Process memory from `/proc/self/status`, when available
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub rss_kb: Option<u64>,
    pub peak_kb: Option<u64>,
}

impl MemoryUsage {
    pub fn current() -> Self {
        std::fs::read_to_string("/proc/self/status")
            .map(|text| parse_proc_status(&text))
            .unwrap_or_default()
    }
}

/// Pull `VmRSS` and `VmHWM` out of a `/proc/<pid>/status` listing
pub fn parse_proc_status(text: &str) -> MemoryUsage {
    let field = |name: &str| {
        text.lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
            .and_then(|kb| kb.parse().ok())
    };
    MemoryUsage {
        rss_kb: field("VmRSS"),
        peak_kb: field("VmHWM"),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub connected: bool,
    pub session_count: usize,
    pub uptime_seconds: f64,
    pub memory: MemoryUsage,
    pub timestamp: DateTime<Utc>,
    pub consecutive_degraded: u32,
    pub connection: ConnectionSnapshot,
    pub metrics: MetricsSnapshot,
}

/// Pure rating of consecutive cycles
#[derive(Debug, Clone)]
pub struct HealthTracker {
    unhealthy_after: u32,
    consecutive_degraded: u32,
}

impl HealthTracker {
    pub fn new(unhealthy_after: u32) -> Self {
        Self {
            unhealthy_after: unhealthy_after.max(1),
            consecutive_degraded: 0,
        }
    }

    pub fn consecutive_degraded(&self) -> u32 {
        self.consecutive_degraded
    }

    /// Rate one cycle from the connection record
    pub fn evaluate(&mut self, connection: &ConnectionSnapshot) -> HealthStatus {
        if connection.phase.is_failed() {
            self.consecutive_degraded = self.consecutive_degraded.saturating_add(1);
            return HealthStatus::Error;
        }
        if connection.connected {
            self.consecutive_degraded = 0;
            return HealthStatus::Healthy;
        }
        self.consecutive_degraded = self.consecutive_degraded.saturating_add(1);
        if self.consecutive_degraded >= self.unhealthy_after {
            HealthStatus::Error
        } else {
            HealthStatus::Degraded
        }
    }
}

pub struct HealthMonitor<T: Transport> {
    config: HealthSection,
    transport: Arc<T>,
    hub: Arc<ClientHub>,
    metrics: Arc<MetricsCollector>,
    latest: watch::Sender<Option<HealthSnapshot>>,
    tracker: HealthTracker,
}

impl<T: Transport> HealthMonitor<T> {
    pub fn new(
        config: HealthSection,
        transport: Arc<T>,
        hub: Arc<ClientHub>,
        metrics: Arc<MetricsCollector>,
        latest: watch::Sender<Option<HealthSnapshot>>,
    ) -> Self {
        let tracker = HealthTracker::new(config.unhealthy_after);
        Self {
            config,
            transport,
            hub,
            metrics,
            latest,
            tracker,
        }
    }

    /// Run one cycle now
    pub async fn tick(&mut self) -> HealthSnapshot {
        let connection = self.transport.connection();
        let previous = self.latest.borrow().as_ref().map(|s| s.status);
        let status = self.tracker.evaluate(&connection);

        let snapshot = HealthSnapshot {
            status,
            connected: connection.connected,
            session_count: self.hub.session_count().await,
            uptime_seconds: self.metrics.uptime().as_secs_f64(),
            memory: MemoryUsage::current(),
            timestamp: Utc::now(),
            consecutive_degraded: self.tracker.consecutive_degraded(),
            connection,
            metrics: self.metrics.snapshot(),
        };

        if previous != Some(status) {
            match status {
                HealthStatus::Healthy => info!("Relay healthy"),
                HealthStatus::Degraded => warn!(
                    consecutive = snapshot.consecutive_degraded,
                    "Relay degraded"
                ),
                HealthStatus::Error => error!(
                    consecutive = snapshot.consecutive_degraded,
                    phase = snapshot.connection.phase.label(),
                    "Relay unhealthy"
                ),
            }
        }

        self.publish_heartbeat(&snapshot).await;

        if let Ok(data) = serde_json::to_value(&snapshot) {
            let frame = WireMessage::new(WireMessageType::Health)
                .with_topic(&self.config.topic)
                .with_data(data);
            let report = self.hub.broadcast_all(&frame).await;
            self.metrics
                .broadcast_completed(report.delivered, report.pruned.len());
        }

        self.latest.send_replace(Some(snapshot.clone()));
        snapshot
    }

    async fn publish_heartbeat(&self, snapshot: &HealthSnapshot) {
        let payload = match serde_json::to_vec(snapshot) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(error = %e, "Failed to serialize heartbeat");
                return;
            }
        };
        let options = PublishOptions {
            qos: QosLevel::AtMostOnce,
            retain: false,
        };
        match self
            .transport
            .publish(&self.config.topic, payload, options)
            .await
        {
            Ok(()) => {
                self.transport.record_heartbeat(snapshot.timestamp);
                self.metrics.heartbeat_sent();
                self.metrics.publish_succeeded();
            }
            Err(BrokerError::NotConnected { .. }) => {
                debug!("Heartbeat skipped while disconnected");
            }
            Err(e) => {
                self.metrics.publish_failed();
                warn!(error = %e, "Heartbeat publish failed");
            }
        }
    }

    /// Tick every interval until shutdown
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = period.as_secs(), "Health monitor started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Health monitor stopped");
    }
}
