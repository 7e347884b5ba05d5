//! Telemetry topic-list analysis
//!
//! A robot periodically publishes the names of every topic it exposes. Each
//! list is partitioned into categories, checked against a required set and
//! diffed against the previous list received on the same source topic.

use super::decode::{from_value, json_or_text, DecodeError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicGroup {
    Control,
    Status,
    Diagnostics,
    Navigation,
    System,
    Other,
}

static GROUP_RULES: Lazy<Vec<(TopicGroup, Regex)>> = Lazy::new(|| {
    let rule = |group, pattern: &str| {
        (
            group,
            Regex::new(pattern).expect("telemetry group pattern is valid"),
        )
    };
    vec![
        rule(
            TopicGroup::Diagnostics,
            r"(?i)(diagnostic|error|fault|alarm|warning|rosout)",
        ),
        rule(
            TopicGroup::Control,
            r"(?i)(cmd|command|control|trajectory|goal|action|servo)",
        ),
        rule(
            TopicGroup::Status,
            r"(?i)(state|status|feedback|battery|joint)",
        ),
        rule(
            TopicGroup::Navigation,
            r"(?i)(^/?tf(_static)?$|odom|map|nav|pose|path|scan|gps|imu)",
        ),
        rule(
            TopicGroup::System,
            r"(?i)(parameter|clock|system|heartbeat|node|log)",
        ),
    ]
});

static ERROR_TOPIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(error|fault|alarm|diagnostic)").expect("error topic pattern is valid")
});

/// Assign a topic name to its group; first matching rule wins
pub fn group_for(topic: &str) -> TopicGroup {
    GROUP_RULES
        .iter()
        .find(|(_, pattern)| pattern.is_match(topic))
        .map(|(group, _)| *group)
        .unwrap_or(TopicGroup::Other)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TopicListPayload {
    List(Vec<String>),
    Wrapped { topics: Vec<String> },
}

/// Decode a topic list sent either as a bare array or as `{"topics": [...]}`
pub fn decode_topic_list(payload: &[u8]) -> Result<BTreeSet<String>, DecodeError> {
    let list = match from_value::<TopicListPayload>(json_or_text(payload)?)? {
        TopicListPayload::List(list) => list,
        TopicListPayload::Wrapped { topics } => topics,
    };
    Ok(list
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryHealth {
    pub status: TelemetryStatus,
    pub missing: Vec<String>,
    pub error_topics: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// True when no earlier list exists for this source
    pub first_seen: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySummary {
    pub total: usize,
    pub groups: BTreeMap<TopicGroup, Vec<String>>,
    pub health: TelemetryHealth,
    pub changes: TopicChanges,
}

/// Keeps the last list seen per source so successive lists can be diffed
#[derive(Debug, Default)]
pub struct TelemetryTracker {
    required: Vec<String>,
    previous: HashMap<String, BTreeSet<String>>,
}

impl TelemetryTracker {
    pub fn new(required: Vec<String>) -> Self {
        Self {
            required,
            previous: HashMap::new(),
        }
    }

    /// Analyze a list and remember it for the next diff on `source`
    pub fn analyze(&mut self, source: &str, topics: BTreeSet<String>) -> TelemetrySummary {
        let mut groups: BTreeMap<TopicGroup, Vec<String>> = BTreeMap::new();
        for topic in &topics {
            groups.entry(group_for(topic)).or_default().push(topic.clone());
        }

        let missing: Vec<String> = self
            .required
            .iter()
            .filter(|required| !topics.contains(*required))
            .cloned()
            .collect();
        let error_topics: Vec<String> = topics
            .iter()
            .filter(|t| ERROR_TOPIC.is_match(t))
            .cloned()
            .collect();
        let status = if missing.is_empty() && error_topics.is_empty() {
            TelemetryStatus::Healthy
        } else {
            TelemetryStatus::Degraded
        };

        let changes = match self.previous.get(source) {
            Some(previous) => TopicChanges {
                added: topics.difference(previous).cloned().collect(),
                removed: previous.difference(&topics).cloned().collect(),
                first_seen: false,
            },
            None => TopicChanges {
                added: topics.iter().cloned().collect(),
                removed: Vec::new(),
                first_seen: true,
            },
        };

        let summary = TelemetrySummary {
            total: topics.len(),
            groups,
            health: TelemetryHealth {
                status,
                missing,
                error_topics,
            },
            changes,
        };
        self.previous.insert(source.to_string(), topics);
        summary
    }

    pub fn sources(&self) -> usize {
        self.previous.len()
    }
}
