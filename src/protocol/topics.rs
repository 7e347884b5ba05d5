//! Topic pattern validation and matching
//!
//! Patterns follow MQTT filter syntax: `+` matches exactly one level, a
//! trailing `#` matches any remaining levels (including none). Downstream
//! sessions may also use `*` as a shorthand for every topic.

use thiserror::Error;

/// Pattern that matches every topic
pub const ALL_TOPICS: &str = "*";

/// Check whether `topic` matches `pattern`
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == ALL_TOPICS || pattern == "#" {
        return true;
    }
    if pattern == topic {
        return true;
    }

    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validate a subscription pattern
pub fn validate_pattern(pattern: &str) -> Result<(), TopicError> {
    if pattern.is_empty() {
        return Err(TopicError::Empty);
    }
    if pattern == ALL_TOPICS {
        return Ok(());
    }

    let levels: Vec<&str> = pattern.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || index != levels.len() - 1) {
            return Err(TopicError::MisplacedMultiLevel(pattern.to_string()));
        }
        if level.contains('+') && *level != "+" {
            return Err(TopicError::PartialWildcard(pattern.to_string()));
        }
        if level.contains('*') {
            return Err(TopicError::PartialWildcard(pattern.to_string()));
        }
    }

    Ok(())
}

/// Validate a concrete topic name used for publishing
pub fn validate_publish_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.contains(['+', '#', '*']) {
        return Err(TopicError::WildcardInTopic(topic.to_string()));
    }
    Ok(())
}

/// Last `/`-separated segment of a topic
pub fn last_segment(topic: &str) -> &str {
    topic.rsplit('/').next().unwrap_or(topic)
}

/// Topic validation errors
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    Empty,
    #[error("'#' must be the last level of the pattern: {0}")]
    MisplacedMultiLevel(String),
    #[error("Wildcards must occupy a whole level: {0}")]
    PartialWildcard(String),
    #[error("Publish topic cannot contain wildcards: {0}")]
    WildcardInTopic(String),
}
