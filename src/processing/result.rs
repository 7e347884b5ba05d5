//! Classified message results

use super::emergency::EmergencySignal;
use crate::protocol::QosLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topic family a message was classified into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    TelemetryList,
    Weight,
    Concentration,
    RobotControl,
    Health,
    Error,
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::TelemetryList => "telemetry-list",
            Category::Weight => "weight",
            Category::Concentration => "concentration",
            Category::RobotControl => "robot-control",
            Category::Health => "health",
            Category::Error => "error",
            Category::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub status: ValidationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl Validation {
    pub fn accepted() -> Self {
        Self::accepted_with(Vec::new())
    }

    pub fn accepted_with(warnings: Vec<String>) -> Self {
        Self {
            status: ValidationStatus::Accepted,
            reason: None,
            warnings,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            status: ValidationStatus::Rejected,
            reason: Some(reason.into()),
            warnings: Vec::new(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status == ValidationStatus::Accepted
    }
}

/// One inbound message after classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedResult {
    pub topic: String,
    pub category: Category,
    pub normalized_data: Value,
    pub validation: Validation,
    pub timestamp: DateTime<Utc>,
    pub qos: QosLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emergency: Option<EmergencySignal>,
}

impl ClassifiedResult {
    pub fn is_emergency(&self) -> bool {
        self.emergency.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_category_wire_names() {
        assert_eq!(
            serde_json::to_value(Category::TelemetryList).unwrap(),
            json!("telemetry-list")
        );
        assert_eq!(
            serde_json::to_value(Category::RobotControl).unwrap(),
            json!(Category::RobotControl.as_str())
        );
    }

    #[test]
    fn test_rejected_result_serializes_reason() {
        let result = ClassifiedResult {
            topic: "scale/weight".into(),
            category: Category::Weight,
            normalized_data: Value::Null,
            validation: Validation::rejected("payload is empty"),
            timestamp: Utc::now(),
            qos: QosLevel::AtMostOnce,
            emergency: None,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["validation"]["status"], "rejected");
        assert_eq!(value["validation"]["reason"], "payload is empty");
        assert_eq!(value["normalizedData"], Value::Null);
        assert!(value.get("emergency").is_none());
    }
}
