//! Topic classification
//!
//! Dispatch is by exact topic first, then by pattern: the control prefix and
//! error-like topic suffixes. Each family decodes and normalizes its payload;
//! a payload that cannot be decoded yields a rejected result instead of being
//! dropped.

use super::command::CommandValidator;
use super::decode::{from_value, json_or_text, DecodeError};
use super::emergency::{assess_severity, EmergencySignal};
use super::result::{Category, ClassifiedResult, Validation};
use super::sensors::{decode_concentration, decode_weight, normalize_concentration, normalize_weight};
use super::telemetry::{decode_topic_list, TelemetryTracker};
use crate::config::{LimitsSection, TopicsSection};
use crate::protocol::{last_segment, MessageEnvelope};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

const ERROR_SUFFIXES: [&str; 4] = ["error", "errors", "fault", "alarm"];

/// Topic family resolved for an inbound topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicFamily {
    TelemetryList,
    Weight,
    Concentration,
    Control,
    Health,
    Error,
    Other,
}

impl TopicFamily {
    pub fn category(&self) -> Category {
        match self {
            TopicFamily::TelemetryList => Category::TelemetryList,
            TopicFamily::Weight => Category::Weight,
            TopicFamily::Concentration => Category::Concentration,
            TopicFamily::Control => Category::RobotControl,
            TopicFamily::Health => Category::Health,
            TopicFamily::Error => Category::Error,
            TopicFamily::Other => Category::Other,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct StatusFields {
    severity: Option<String>,
    level: Option<String>,
    status: Option<String>,
}

/// Classifies inbound messages; owns the telemetry history used for diffs
#[derive(Debug)]
pub struct TopicClassifier {
    topics: TopicsSection,
    limits: LimitsSection,
    commands: CommandValidator,
    telemetry: TelemetryTracker,
}

impl TopicClassifier {
    pub fn new(topics: TopicsSection, limits: LimitsSection) -> Self {
        let telemetry = TelemetryTracker::new(topics.required_telemetry.clone());
        let commands = CommandValidator::new(limits.clone());
        Self {
            topics,
            limits,
            commands,
            telemetry,
        }
    }

    pub fn family(&self, topic: &str) -> TopicFamily {
        let exact = |list: &[String]| list.iter().any(|t| t == topic);
        if exact(&self.topics.telemetry_list) {
            return TopicFamily::TelemetryList;
        }
        if exact(&self.topics.weight) {
            return TopicFamily::Weight;
        }
        if exact(&self.topics.concentration) {
            return TopicFamily::Concentration;
        }
        if exact(&self.topics.health) {
            return TopicFamily::Health;
        }
        if exact(&self.topics.errors) {
            return TopicFamily::Error;
        }
        if exact(&self.topics.commands) {
            return TopicFamily::Control;
        }

        let prefix = format!("{}/", self.topics.control_prefix.trim_end_matches('/'));
        if topic.starts_with(&prefix) && topic.len() > prefix.len() {
            return TopicFamily::Control;
        }
        if ERROR_SUFFIXES.contains(&last_segment(topic).to_lowercase().as_str()) {
            return TopicFamily::Error;
        }
        TopicFamily::Other
    }

    /// Classify one envelope; never fails
    pub fn classify(&mut self, envelope: &MessageEnvelope) -> ClassifiedResult {
        let family = self.family(&envelope.topic);
        let topic = envelope.topic.as_str();
        let payload = envelope.payload.as_ref();

        let (normalized_data, validation, emergency) = match family {
            TopicFamily::TelemetryList => match decode_topic_list(payload) {
                Ok(list) => {
                    let summary = self.telemetry.analyze(topic, list);
                    (to_value(&summary), Validation::accepted(), None)
                }
                Err(e) => rejected(e),
            },
            TopicFamily::Weight => match decode_weight(payload) {
                Ok(raw) => {
                    let reading = normalize_weight(raw, &self.limits);
                    let mut warnings = Vec::new();
                    if reading.clamped {
                        warnings.push(format!(
                            "weight {} outside {}..{}",
                            raw, self.limits.weight.min, self.limits.weight.max
                        ));
                    }
                    (
                        to_value(&reading),
                        Validation::accepted_with(warnings),
                        None,
                    )
                }
                Err(e) => rejected(e),
            },
            TopicFamily::Concentration => match decode_concentration(payload) {
                Ok(input) => {
                    let target = normalize_concentration(input, self.limits.concentration);
                    let mut warnings = Vec::new();
                    if target.clamped {
                        warnings.push(format!(
                            "concentration {} clamped to {}",
                            target.original, target.target
                        ));
                    }
                    (
                        to_value(&target),
                        Validation::accepted_with(warnings),
                        None,
                    )
                }
                Err(e) => rejected(e),
            },
            TopicFamily::Control => {
                let outcome = self.commands.validate(topic, payload);
                (outcome.to_value(), outcome.validation, outcome.emergency)
            }
            TopicFamily::Health | TopicFamily::Error => match json_or_text(payload) {
                Ok(value) => {
                    let fields = from_value::<StatusFields>(value.clone()).unwrap_or_default();
                    let declared = fields.severity.or(fields.level).or(fields.status);
                    let text = match &value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    let assessment = assess_severity(topic, &text, declared.as_deref());
                    let emergency = assessment.emergency.clone();
                    (
                        json!({
                            "payload": value,
                            "severity": assessment.severity,
                            "action": assessment.action,
                        }),
                        Validation::accepted(),
                        emergency,
                    )
                }
                Err(e) => rejected(e),
            },
            TopicFamily::Other => match json_or_text(payload) {
                Ok(value) => (value, Validation::accepted(), None),
                Err(DecodeError::Empty) => (Value::Null, Validation::accepted(), None),
                Err(DecodeError::NotUtf8) => (
                    json!({ "encoding": "binary", "bytes": payload.len() }),
                    Validation::accepted(),
                    None,
                ),
                Err(e) => rejected(e),
            },
        };

        let category = family.category();
        if !validation.is_accepted() {
            warn!(
                topic = %topic,
                category = category.as_str(),
                reason = validation.reason.as_deref().unwrap_or_default(),
                "Message rejected"
            );
        } else if family == TopicFamily::Other {
            trace!(topic = %topic, "Unclassified topic passed through");
        } else {
            debug!(topic = %topic, category = category.as_str(), "Message classified");
        }

        ClassifiedResult {
            topic: envelope.topic.clone(),
            category,
            normalized_data,
            validation,
            timestamp: envelope.received_at,
            qos: envelope.qos,
            emergency,
        }
    }
}

fn rejected(error: DecodeError) -> (Value, Validation, Option<EmergencySignal>) {
    (Value::Null, Validation::rejected(error.to_string()), None)
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::result::ValidationStatus;
    use crate::protocol::QosLevel;

    fn classifier() -> TopicClassifier {
        TopicClassifier::new(TopicsSection::default(), LimitsSection::default())
    }

    fn envelope(topic: &str, payload: &[u8]) -> MessageEnvelope {
        MessageEnvelope::new(topic, payload.to_vec(), QosLevel::AtMostOnce)
    }

    #[test]
    fn test_family_dispatch() {
        let c = classifier();
        assert_eq!(c.family("robot/topics"), TopicFamily::TelemetryList);
        assert_eq!(c.family("scale/weight"), TopicFamily::Weight);
        assert_eq!(c.family("scale/kalman_pv"), TopicFamily::Weight);
        assert_eq!(c.family("test"), TopicFamily::Weight);
        assert_eq!(c.family("robot/command/sugar"), TopicFamily::Concentration);
        assert_eq!(c.family("robot/control/move_joint"), TopicFamily::Control);
        assert_eq!(c.family("robot/control"), TopicFamily::Other);
        assert_eq!(c.family("system/health"), TopicFamily::Health);
        assert_eq!(c.family("robot/error"), TopicFamily::Error);
        assert_eq!(c.family("robot/arm/fault"), TopicFamily::Error);
        assert_eq!(c.family("robot/command/start"), TopicFamily::Control);
        assert_eq!(c.family("robot/command/other"), TopicFamily::Other);
        assert_eq!(c.family("camera/frame"), TopicFamily::Other);
    }

    #[test]
    fn test_start_button_is_a_command() {
        let result = classifier().classify(&envelope("robot/command/start", b"1"));
        assert_eq!(result.category, Category::RobotControl);
        assert!(result.validation.is_accepted());
        assert_eq!(result.normalized_data["command"], "start");
        assert_eq!(result.normalized_data["safety_level"], "normal");
        assert!(!result.is_emergency());
    }

    #[test]
    fn test_binary_payload_on_unclassified_topic_passes_through() {
        let result = classifier().classify(&envelope("camera/frame", &[0xff, 0xfe, 0x00, 0x10]));
        assert_eq!(result.category, Category::Other);
        assert!(result.validation.is_accepted());
        assert_eq!(result.normalized_data["encoding"], "binary");
        assert_eq!(result.normalized_data["bytes"], 4);
    }

    #[test]
    fn test_weight_numeric_string() {
        let result = classifier().classify(&envelope("scale/weight", b"\"15.5\""));
        assert_eq!(result.category, Category::Weight);
        assert!(result.validation.is_accepted());
        assert_eq!(result.normalized_data["value"], 15.5);
        assert_eq!(result.normalized_data["unit"], "kg");
        assert_eq!(result.normalized_data["status"], "normal");
        assert_eq!(result.normalized_data["quality"], "good");
    }

    #[test]
    fn test_malformed_weight_is_rejected_not_dropped() {
        let result = classifier().classify(&envelope("scale/weight", b"heavy"));
        assert_eq!(result.validation.status, ValidationStatus::Rejected);
        assert!(result.validation.reason.is_some());
        assert_eq!(result.topic, "scale/weight");
    }

    #[test]
    fn test_concentration_clamped_with_warning() {
        let result = classifier().classify(&envelope(
            "robot/concentration/target",
            br#"{"target": 150}"#,
        ));
        assert_eq!(result.normalized_data["target"], 100.0);
        assert_eq!(result.normalized_data["clamped"], true);
        assert_eq!(result.validation.warnings.len(), 1);
    }

    #[test]
    fn test_control_emergency_stop() {
        let result = classifier().classify(&envelope("robot/control/emergency_stop", b""));
        assert_eq!(result.category, Category::RobotControl);
        assert!(result.validation.is_accepted());
        assert_eq!(result.normalized_data["safety_level"], "critical");
        assert_eq!(result.normalized_data["execution"], "immediate");
        assert!(result.is_emergency());
    }

    #[test]
    fn test_error_severity_and_emergency() {
        let mut c = classifier();
        let plain = c.classify(&envelope("robot/error", br#"{"severity": "warning", "msg": "slow"}"#));
        assert_eq!(plain.normalized_data["severity"], "warning");
        assert_eq!(plain.normalized_data["action"], "monitor");
        assert!(!plain.is_emergency());

        let hot = c.classify(&envelope("robot/error", b"motor temperature 95C"));
        assert_eq!(hot.normalized_data["severity"], "critical");
        assert_eq!(hot.normalized_data["action"], "immediate_stop");
        assert!(hot.is_emergency());
    }

    #[test]
    fn test_health_passthrough() {
        let result = classifier().classify(&envelope("system/health", br#"{"status": "ok"}"#));
        assert_eq!(result.category, Category::Health);
        assert_eq!(result.normalized_data["severity"], "info");
        assert_eq!(result.normalized_data["payload"]["status"], "ok");
    }

    #[test]
    fn test_telemetry_list_diffs_across_calls() {
        let mut c = classifier();
        c.classify(&envelope("robot/topics", br#"["/tf", "/joint_states"]"#));
        let second = c.classify(&envelope("robot/topics", br#"["/tf", "/robot_state"]"#));
        let changes = &second.normalized_data["changes"];
        assert_eq!(changes["added"], json!(["/robot_state"]));
        assert_eq!(changes["removed"], json!(["/joint_states"]));
    }

    #[test]
    fn test_other_passthrough() {
        let mut c = classifier();
        let result = c.classify(&envelope("camera/frame", br#"{"id": 3}"#));
        assert_eq!(result.category, Category::Other);
        assert_eq!(result.normalized_data, json!({"id": 3}));

        let empty = c.classify(&envelope("camera/frame", b""));
        assert!(empty.validation.is_accepted());
        assert_eq!(empty.normalized_data, Value::Null);
    }

    #[test]
    fn test_timestamp_and_qos_come_from_envelope() {
        let env = MessageEnvelope::new("scale/weight", b"1".to_vec(), QosLevel::AtLeastOnce);
        let result = classifier().classify(&env);
        assert_eq!(result.timestamp, env.received_at);
        assert_eq!(result.qos, QosLevel::AtLeastOnce);
    }
}
