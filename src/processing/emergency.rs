//! Emergency keyword detection and error severity
//!
//! A fixed keyword set is matched case-insensitively against a message's
//! topic and its serialized payload. A hit escalates the message to
//! `critical` regardless of what the message claims to be, and tells the
//! caller to broadcast an emergency stop.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Keywords that mark a safety-critical condition
pub const EMERGENCY_KEYWORDS: [&str; 6] = [
    "emergency",
    "safety",
    "collision",
    "overload",
    "temperature",
    "power_failure",
];

static EMERGENCY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    let alternation = EMERGENCY_KEYWORDS.join("|");
    Regex::new(&format!("(?i)({alternation})")).expect("emergency keyword pattern is valid")
});

static CONNECTIVITY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(disconnect|connection|timeout|timed out|network|unreachable|offline)")
        .expect("connectivity pattern is valid")
});

/// Which keyword matched and where
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencySignal {
    pub keyword: String,
    pub source: MatchSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    Topic,
    Payload,
}

/// Scan the topic first, then the payload text
pub fn detect_emergency(topic: &str, payload: &str) -> Option<EmergencySignal> {
    if let Some(m) = EMERGENCY_PATTERN.find(topic) {
        return Some(EmergencySignal {
            keyword: m.as_str().to_lowercase(),
            source: MatchSource::Topic,
        });
    }
    EMERGENCY_PATTERN.find(payload).map(|m| EmergencySignal {
        keyword: m.as_str().to_lowercase(),
        source: MatchSource::Payload,
    })
}

/// Error severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Parse a declared severity label as sent by publishers
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "info" | "debug" | "low" | "ok" => Some(Severity::Info),
            "warn" | "warning" | "medium" => Some(Severity::Warning),
            "error" | "high" | "fault" => Some(Severity::Error),
            "critical" | "fatal" | "emergency" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// What an operator or downstream controller should do about an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredAction {
    ImmediateStop,
    Reconnect,
    Monitor,
}

/// Severity and action derived for an error/health message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityAssessment {
    pub severity: Severity,
    pub action: RequiredAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emergency: Option<EmergencySignal>,
}

/// Derive severity for an error or health message
///
/// An emergency keyword always wins. Otherwise a declared severity is used
/// if present, falling back to keyword heuristics on the text.
pub fn assess_severity(topic: &str, text: &str, declared: Option<&str>) -> SeverityAssessment {
    if let Some(signal) = detect_emergency(topic, text) {
        return SeverityAssessment {
            severity: Severity::Critical,
            action: RequiredAction::ImmediateStop,
            emergency: Some(signal),
        };
    }

    let lowered = text.to_lowercase();
    let severity = declared
        .and_then(Severity::from_label)
        .unwrap_or_else(|| {
            if lowered.contains("critical") || lowered.contains("fatal") {
                Severity::Critical
            } else if lowered.contains("error") || lowered.contains("fail") {
                Severity::Error
            } else if lowered.contains("warn") {
                Severity::Warning
            } else {
                Severity::Info
            }
        });

    let action = if severity == Severity::Critical {
        RequiredAction::ImmediateStop
    } else if CONNECTIVITY_PATTERN.is_match(topic) || CONNECTIVITY_PATTERN.is_match(text) {
        RequiredAction::Reconnect
    } else {
        RequiredAction::Monitor
    };

    SeverityAssessment {
        severity,
        action,
        emergency: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_keyword_in_topic() {
        let signal = detect_emergency("robot/control/emergency_stop", "").unwrap();
        assert_eq!(signal.keyword, "emergency");
        assert_eq!(signal.source, MatchSource::Topic);
    }

    #[test]
    fn test_detects_keyword_in_payload_case_insensitive() {
        let signal = detect_emergency("robot/error", r#"{"msg":"Motor OVERLOAD on J3"}"#).unwrap();
        assert_eq!(signal.keyword, "overload");
        assert_eq!(signal.source, MatchSource::Payload);

        let power = detect_emergency("system/error", "POWER_FAILURE detected").unwrap();
        assert_eq!(power.keyword, "power_failure");
    }

    #[test]
    fn test_no_keyword_no_signal() {
        assert!(detect_emergency("robot/control/stop", "{}").is_none());
        assert!(detect_emergency("scale/weight", "15.5").is_none());
    }

    #[test]
    fn test_emergency_escalates_to_critical() {
        let assessment = assess_severity("robot/error", "joint temperature high", Some("info"));
        assert_eq!(assessment.severity, Severity::Critical);
        assert_eq!(assessment.action, RequiredAction::ImmediateStop);
        assert!(assessment.emergency.is_some());
    }

    #[test]
    fn test_declared_severity_is_respected() {
        let assessment = assess_severity("robot/error", "gripper slow", Some("warning"));
        assert_eq!(assessment.severity, Severity::Warning);
        assert_eq!(assessment.action, RequiredAction::Monitor);
    }

    #[test]
    fn test_connectivity_errors_require_reconnect() {
        let assessment = assess_severity("system/error", "controller connection lost", None);
        assert_eq!(assessment.severity, Severity::Info);
        assert_eq!(assessment.action, RequiredAction::Reconnect);

        let failed = assess_severity("system/error", "network timeout, request failed", None);
        assert_eq!(failed.severity, Severity::Error);
        assert_eq!(failed.action, RequiredAction::Reconnect);
    }

    #[test]
    fn test_text_heuristics() {
        assert_eq!(
            assess_severity("robot/error", "fatal fault", None).severity,
            Severity::Critical
        );
        assert_eq!(
            assess_severity("robot/error", "servo error 12", None).severity,
            Severity::Error
        );
        assert_eq!(
            assess_severity("robot/error", "warning: low battery", None).severity,
            Severity::Warning
        );
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }
}
