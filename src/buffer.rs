//! Bounded per-topic history
//!
//! Each topic gets a fixed-capacity FIFO created on its first message. When a
//! ring is full, every insertion evicts exactly the single oldest entry. Arrival
//! timestamps are kept in lockstep with the entries so rate statistics can be
//! computed without touching the entries themselves.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use tracing::debug;

/// Fixed-capacity FIFO of entries with parallel arrival timestamps
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    capacity: usize,
    entries: VecDeque<T>,
    timestamps: VecDeque<DateTime<Utc>>,
    evicted: u64,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
            timestamps: VecDeque::with_capacity(capacity),
            evicted: 0,
        }
    }

    /// Append an entry, evicting the oldest one if the ring is full
    pub fn push(&mut self, entry: T, at: DateTime<Utc>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.timestamps.pop_front();
            self.evicted += 1;
        }
        self.entries.push_back(entry);
        self.timestamps.push_back(at);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&T> {
        self.entries.back()
    }

    /// The most recent `count` entries, oldest first
    pub fn window(&self, count: usize) -> Vec<T> {
        let skip = self.entries.len().saturating_sub(count);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// Entries that arrived within `[start, end]`, oldest first
    pub fn range_by_time(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<T> {
        // Timestamps are appended in arrival order, so the first index at or
        // after `start` bounds the scan.
        let first = self.timestamps.partition_point(|ts| *ts < start);
        self.timestamps
            .iter()
            .zip(self.entries.iter())
            .skip(first)
            .take_while(|(ts, _)| **ts <= end)
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    /// Count, first/last arrival and arrival rate over the trailing window
    pub fn stats(&self, rate_window: ChronoDuration, now: DateTime<Utc>) -> BufferStats {
        let first_ts = self.timestamps.front().copied();
        let last_ts = self.timestamps.back().copied();

        let window_start = now - rate_window;
        let recent: Vec<&DateTime<Utc>> = self
            .timestamps
            .iter()
            .filter(|ts| **ts >= window_start)
            .collect();

        let rate_hz = match (recent.first(), recent.last()) {
            (Some(first), Some(last)) if recent.len() > 1 => {
                let span = (**last - **first).num_milliseconds() as f64 / 1000.0;
                if span > 0.0 {
                    (recent.len() - 1) as f64 / span
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };

        BufferStats {
            count: self.entries.len(),
            capacity: self.capacity,
            evicted: self.evicted,
            first_ts,
            last_ts,
            rate_hz,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.timestamps.clear();
    }
}

/// Statistics for one topic's buffer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferStats {
    pub count: usize,
    pub capacity: usize,
    pub evicted: u64,
    pub first_ts: Option<DateTime<Utc>>,
    pub last_ts: Option<DateTime<Utc>>,
    pub rate_hz: f64,
}

/// Per-topic ring buffers behind a single lock
///
/// Operations hold the lock only for the in-memory copy; nothing awaits while
/// holding it.
#[derive(Debug)]
pub struct TopicBuffers<T> {
    capacity: usize,
    rate_window: ChronoDuration,
    rings: RwLock<HashMap<String, RingBuffer<T>>>,
}

impl<T: Clone> TopicBuffers<T> {
    pub fn new(capacity: usize, rate_window: std::time::Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            rate_window: ChronoDuration::from_std(rate_window)
                .unwrap_or_else(|_| ChronoDuration::seconds(60)),
            rings: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an entry stamped with the current time
    pub fn append(&self, topic: &str, entry: T) {
        self.append_at(topic, entry, Utc::now());
    }

    /// Append an entry with an explicit arrival time
    pub fn append_at(&self, topic: &str, entry: T, at: DateTime<Utc>) {
        let mut rings = self.rings.write().unwrap_or_else(|e| e.into_inner());
        if !rings.contains_key(topic) {
            debug!(topic = %topic, capacity = self.capacity, "Creating ring buffer");
        }
        rings
            .entry(topic.to_string())
            .or_insert_with(|| RingBuffer::new(self.capacity))
            .push(entry, at);
    }

    pub fn latest(&self, topic: &str) -> Option<T> {
        let rings = self.rings.read().unwrap_or_else(|e| e.into_inner());
        rings.get(topic).and_then(|ring| ring.latest().cloned())
    }

    pub fn window(&self, topic: &str, count: usize) -> Vec<T> {
        let rings = self.rings.read().unwrap_or_else(|e| e.into_inner());
        rings
            .get(topic)
            .map(|ring| ring.window(count))
            .unwrap_or_default()
    }

    pub fn range_by_time(&self, topic: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<T> {
        let rings = self.rings.read().unwrap_or_else(|e| e.into_inner());
        rings
            .get(topic)
            .map(|ring| ring.range_by_time(start, end))
            .unwrap_or_default()
    }

    pub fn stats(&self, topic: &str) -> Option<BufferStats> {
        let rings = self.rings.read().unwrap_or_else(|e| e.into_inner());
        rings
            .get(topic)
            .map(|ring| ring.stats(self.rate_window, Utc::now()))
    }

    /// Stats for every known topic
    pub fn all_stats(&self) -> HashMap<String, BufferStats> {
        let now = Utc::now();
        let rings = self.rings.read().unwrap_or_else(|e| e.into_inner());
        rings
            .iter()
            .map(|(topic, ring)| (topic.clone(), ring.stats(self.rate_window, now)))
            .collect()
    }

    pub fn topics(&self) -> Vec<String> {
        let rings = self.rings.read().unwrap_or_else(|e| e.into_inner());
        let mut topics: Vec<String> = rings.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Drop one topic's history
    pub fn clear(&self, topic: &str) {
        let mut rings = self.rings.write().unwrap_or_else(|e| e.into_inner());
        if let Some(ring) = rings.get_mut(topic) {
            ring.clear();
        }
    }

    /// Drop every topic
    pub fn reset(&self) {
        let mut rings = self.rings.write().unwrap_or_else(|e| e.into_inner());
        rings.clear();
    }
}
