//! Pure reconnection policy for the broker link
//!
//! The supervisor is a small state machine driven by the broker event loop:
//! `Idle -> Connecting -> Connected -> Reconnecting -> Connecting -> ...`.
//! It never sleeps or does I/O itself; each transition returns a
//! [`ReconnectionDecision`] that the event loop carries out.

use super::connection::ConnectionPhase;
use crate::config::ReconnectSection;
use std::time::Duration;
use tracing::{error, info, warn};

/// Exponential backoff with a cap and a bounded number of failures
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn from_config(config: &ReconnectSection) -> Self {
        Self {
            base: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            cap: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
        }
    }

    /// Delay before retry `attempt` (1-based): `min(base * multiplier^(n-1), cap)`
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let millis = self.base.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.cap.as_millis() as f64);
        Duration::from_millis(capped.round() as u64)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectSection::default())
    }
}

/// What the event loop should do next
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectionDecision {
    /// Wait `delay`, then make retry `attempt`
    Retry { attempt: u32, delay: Duration },
    /// Stop retrying; the link is permanently failed
    GiveUp { reason: String },
    /// Nothing to do
    Continue,
}

/// Why a manual reconnect was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualReconnect {
    /// A pending wait will be cut short
    Scheduled,
    /// Already connected; nothing to do
    AlreadyConnected,
    /// Retries were exhausted; only a restart recovers
    Refused { reason: String },
}

#[derive(Debug, Clone)]
pub struct ReconnectSupervisor {
    policy: BackoffPolicy,
    phase: ConnectionPhase,
    attempt: u32,
    failures: u32,
}

impl ReconnectSupervisor {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            phase: ConnectionPhase::Idle,
            attempt: 0,
            failures: 0,
        }
    }

    pub fn phase(&self) -> &ConnectionPhase {
        &self.phase
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Begin the initial attempt, or a scheduled retry
    pub fn begin_attempt(&mut self) {
        self.phase = ConnectionPhase::Connecting;
    }

    /// ConnAck received: reset both counters
    pub fn on_connected(&mut self) {
        if self.attempt > 0 {
            info!(attempt = self.attempt, "Reconnection successful");
        }
        self.attempt = 0;
        self.failures = 0;
        self.phase = ConnectionPhase::Connected;
    }

    /// An established session dropped; schedule the first retry
    pub fn on_connection_lost(&mut self, reason: &str) -> ReconnectionDecision {
        if self.phase.is_failed() {
            return ReconnectionDecision::Continue;
        }
        warn!(reason = %reason, "Broker connection lost");
        self.attempt = 1;
        self.schedule()
    }

    /// An attempt failed before ConnAck
    pub fn on_attempt_failed(&mut self, reason: &str) -> ReconnectionDecision {
        if self.phase.is_failed() {
            return ReconnectionDecision::Continue;
        }
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            let reason = format!(
                "{} consecutive connection failures, last: {}",
                self.failures, reason
            );
            error!(failures = self.failures, "Giving up on broker connection");
            self.phase = ConnectionPhase::Failed {
                reason: reason.clone(),
            };
            return ReconnectionDecision::GiveUp { reason };
        }
        self.attempt += 1;
        warn!(
            failures = self.failures,
            max_attempts = self.policy.max_attempts,
            reason = %reason,
            "Broker connection attempt failed"
        );
        self.schedule()
    }

    /// Operator asked to reconnect now
    pub fn request_manual(&self) -> ManualReconnect {
        match &self.phase {
            ConnectionPhase::Failed { reason } => ManualReconnect::Refused {
                reason: reason.clone(),
            },
            ConnectionPhase::Connected => ManualReconnect::AlreadyConnected,
            _ => ManualReconnect::Scheduled,
        }
    }

    fn schedule(&mut self) -> ReconnectionDecision {
        let delay = self.policy.delay(self.attempt);
        self.phase = ConnectionPhase::Reconnecting {
            attempt: self.attempt,
        };
        ReconnectionDecision::Retry {
            attempt: self.attempt,
            delay,
        }
    }
}
