//! Thread-safe metrics collection
//!
//! Atomic counters for the hot paths (every inbound message touches several)
//! and mutex-protected collections for per-category counts and processing
//! times. One collector is owned by each relay context; there is no global
//! instance, so isolated relays in one process keep separate numbers.

use crate::processing::Category;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Processing-time samples kept for percentiles
const MAX_TIMING_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
#[derive(Debug)]
pub struct MetricsCollector {
    // Pipeline
    messages_received: AtomicU64,
    messages_classified: AtomicU64,
    messages_rejected: AtomicU64,
    emergencies: AtomicU64,

    // Sessions
    sessions_accepted: AtomicU64,
    sessions_closed: AtomicU64,
    sessions_pruned: AtomicU64,
    broadcasts_delivered: AtomicU64,

    // Broker link
    publishes_ok: AtomicU64,
    publishes_failed: AtomicU64,
    connections_established: AtomicU64,
    connection_losses: AtomicU64,
    reconnect_attempts: AtomicU64,
    heartbeats: AtomicU64,

    per_category: Mutex<HashMap<Category, u64>>,
    processing_times: Mutex<Vec<u64>>, // microseconds
    started: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_classified: AtomicU64::new(0),
            messages_rejected: AtomicU64::new(0),
            emergencies: AtomicU64::new(0),
            sessions_accepted: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            sessions_pruned: AtomicU64::new(0),
            broadcasts_delivered: AtomicU64::new(0),
            publishes_ok: AtomicU64::new(0),
            publishes_failed: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_losses: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            heartbeats: AtomicU64::new(0),
            per_category: Mutex::new(HashMap::new()),
            processing_times: Mutex::new(Vec::new()),
            started: Instant::now(),
        }
    }

    // Pipeline metrics
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_classified(&self, category: Category, accepted: bool, elapsed: Duration) {
        self.messages_classified.fetch_add(1, Ordering::Relaxed);
        if !accepted {
            self.messages_rejected.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut counts) = self.per_category.lock() {
            *counts.entry(category).or_insert(0) += 1;
        }
        self.record_processing_time(elapsed);
    }

    pub fn emergency_detected(&self) {
        self.emergencies.fetch_add(1, Ordering::Relaxed);
    }

    fn record_processing_time(&self, elapsed: Duration) {
        if let Ok(mut times) = self.processing_times.lock() {
            times.push(elapsed.as_micros() as u64);
            if times.len() > MAX_TIMING_SAMPLES {
                times.remove(0);
            }
        }
    }

    // Session metrics
    pub fn session_accepted(&self) {
        self.sessions_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broadcast_completed(&self, delivered: usize, pruned: usize) {
        self.broadcasts_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.sessions_pruned
            .fetch_add(pruned as u64, Ordering::Relaxed);
    }

    // Broker metrics
    pub fn publish_succeeded(&self) {
        self.publishes_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publishes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.connection_losses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_attempted(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_sent(&self) {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Average and percentiles of recorded processing times (pure function)
    fn processing_time_statistics(&self) -> ProcessingTimes {
        let Ok(times) = self.processing_times.lock() else {
            return ProcessingTimes::default();
        };
        if times.is_empty() {
            return ProcessingTimes::default();
        }
        let mut sorted = times.clone();
        sorted.sort_unstable();
        ProcessingTimes {
            avg_us: sorted.iter().sum::<u64>() as f64 / sorted.len() as f64,
            p50_us: percentile(&sorted, 50.0),
            p95_us: percentile(&sorted, 95.0),
            p99_us: percentile(&sorted, 99.0),
        }
    }

    fn category_counts(&self) -> HashMap<String, u64> {
        self.per_category
            .lock()
            .map(|counts| {
                counts
                    .iter()
                    .map(|(category, count)| (category.as_str().to_string(), *count))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Serializable point-in-time view
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pipeline: PipelineMetrics {
                messages_received: self.messages_received.load(Ordering::Relaxed),
                messages_classified: self.messages_classified.load(Ordering::Relaxed),
                messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
                emergencies: self.emergencies.load(Ordering::Relaxed),
                per_category: self.category_counts(),
                processing_time: self.processing_time_statistics(),
            },
            sessions: SessionMetrics {
                accepted: self.sessions_accepted.load(Ordering::Relaxed),
                closed: self.sessions_closed.load(Ordering::Relaxed),
                pruned: self.sessions_pruned.load(Ordering::Relaxed),
                broadcasts_delivered: self.broadcasts_delivered.load(Ordering::Relaxed),
            },
            broker: BrokerMetrics {
                publishes_ok: self.publishes_ok.load(Ordering::Relaxed),
                publishes_failed: self.publishes_failed.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_losses: self.connection_losses.load(Ordering::Relaxed),
                reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
                heartbeats: self.heartbeats.load(Ordering::Relaxed),
            },
            uptime_seconds: self.uptime().as_secs_f64(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((pct / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[index.min(sorted.len() - 1)] as f64
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessingTimes {
    pub avg_us: f64,
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineMetrics {
    pub messages_received: u64,
    pub messages_classified: u64,
    pub messages_rejected: u64,
    pub emergencies: u64,
    pub per_category: HashMap<String, u64>,
    pub processing_time: ProcessingTimes,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionMetrics {
    pub accepted: u64,
    pub closed: u64,
    pub pruned: u64,
    pub broadcasts_delivered: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerMetrics {
    pub publishes_ok: u64,
    pub publishes_failed: u64,
    pub connections_established: u64,
    pub connection_losses: u64,
    pub reconnect_attempts: u64,
    pub heartbeats: u64,
}

/// Complete metrics snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub pipeline: PipelineMetrics,
    pub sessions: SessionMetrics,
    pub broker: BrokerMetrics,
    pub uptime_seconds: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_counters() {
        let metrics = MetricsCollector::new();
        metrics.message_received();
        metrics.message_received();
        metrics.message_classified(Category::Weight, true, Duration::from_micros(40));
        metrics.message_classified(Category::Weight, false, Duration::from_micros(60));
        metrics.emergency_detected();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pipeline.messages_received, 2);
        assert_eq!(snapshot.pipeline.messages_classified, 2);
        assert_eq!(snapshot.pipeline.messages_rejected, 1);
        assert_eq!(snapshot.pipeline.emergencies, 1);
        assert_eq!(snapshot.pipeline.per_category.get("weight"), Some(&2));
        assert_eq!(snapshot.pipeline.processing_time.avg_us, 50.0);
    }

    #[test]
    fn test_broadcast_and_broker_counters() {
        let metrics = MetricsCollector::new();
        metrics.broadcast_completed(3, 1);
        metrics.broadcast_completed(2, 0);
        metrics.publish_succeeded();
        metrics.publish_failed();
        metrics.reconnect_attempted();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions.broadcasts_delivered, 5);
        assert_eq!(snapshot.sessions.pruned, 1);
        assert_eq!(snapshot.broker.publishes_ok, 1);
        assert_eq!(snapshot.broker.publishes_failed, 1);
        assert_eq!(snapshot.broker.reconnect_attempts, 1);
    }

    #[test]
    fn test_collectors_are_independent() {
        let a = MetricsCollector::new();
        let b = MetricsCollector::new();
        a.message_received();
        assert_eq!(a.snapshot().pipeline.messages_received, 1);
        assert_eq!(b.snapshot().pipeline.messages_received, 0);
    }

    #[test]
    fn test_timing_samples_are_bounded() {
        let metrics = MetricsCollector::new();
        for i in 0..(MAX_TIMING_SAMPLES + 50) {
            metrics.message_classified(Category::Other, true, Duration::from_micros(i as u64));
        }
        assert_eq!(
            metrics.processing_times.lock().unwrap().len(),
            MAX_TIMING_SAMPLES
        );
    }

    #[test]
    fn test_percentile() {
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_eq!(percentile(&[1, 2, 3, 4, 5], 50.0), 3.0);
        assert_eq!(percentile(&[1, 2, 3, 4, 5], 100.0), 5.0);
    }
}
