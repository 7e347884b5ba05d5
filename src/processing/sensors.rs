//! Weight and concentration normalization
//!
//! Both sensors publish a single scalar in varying shapes. Decoding picks the
//! first populated field, then the scalar is clamped into its configured range.
//! Weight readings are additionally rounded to two decimals and labelled with a
//! status and a quality grade.

use super::decode::{json_or_text, from_value, DecodeError, NumericValue};
use crate::config::{LimitsSection, Range};
use serde::{Deserialize, Serialize};

/// Rounding deltas at or below this are not reported as filtering
const FILTER_EPSILON: f64 = 1e-3;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum WeightPayload {
    Bare(NumericValue),
    Fields(WeightFields),
}

#[derive(Debug, Clone, Deserialize)]
struct WeightFields {
    value: Option<Box<WeightPayload>>,
    weight: Option<Box<WeightPayload>>,
    data: Option<Box<WeightPayload>>,
    payload: Option<Box<WeightPayload>>,
}

impl WeightPayload {
    fn resolve(&self) -> Result<f64, DecodeError> {
        match self {
            WeightPayload::Bare(n) => n.to_f64(),
            WeightPayload::Fields(fields) => [
                &fields.value,
                &fields.weight,
                &fields.data,
                &fields.payload,
            ]
            .into_iter()
            .flatten()
            .next()
            .ok_or_else(|| {
                DecodeError::UnexpectedShape(
                    "expected one of value, weight, data, payload".to_string(),
                )
            })?
            .resolve(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightStatus {
    Empty,
    Normal,
    Heavy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightQuality {
    Good,
    Filtered,
    Warning,
    Poor,
}

/// Normalized weight reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightReading {
    pub value: f64,
    pub unit: String,
    pub status: WeightStatus,
    pub quality: WeightQuality,
    pub raw_value: f64,
    pub clamped: bool,
}

/// Decode a raw weight payload into a float
pub fn decode_weight(payload: &[u8]) -> Result<f64, DecodeError> {
    let value = json_or_text(payload)?;
    from_value::<WeightPayload>(value)?.resolve()
}

/// Clamp, round and label a weight value
pub fn normalize_weight(raw: f64, limits: &LimitsSection) -> WeightReading {
    let clamped_value = limits.weight.clamp(raw);
    let clamped = clamped_value != raw;
    let value = round2(clamped_value);

    let status = if value < limits.weight_empty_threshold {
        WeightStatus::Empty
    } else if value > limits.weight_heavy_threshold {
        WeightStatus::Heavy
    } else {
        WeightStatus::Normal
    };

    let quality = if clamped {
        WeightQuality::Poor
    } else if status == WeightStatus::Heavy {
        WeightQuality::Warning
    } else if (value - clamped_value).abs() > FILTER_EPSILON {
        WeightQuality::Filtered
    } else {
        WeightQuality::Good
    };

    WeightReading {
        value,
        unit: limits.weight_unit.clone(),
        status,
        quality,
        raw_value: raw,
        clamped,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ConcentrationPayload {
    Bare(NumericValue),
    Fields(ConcentrationFields),
}

#[derive(Debug, Clone, Deserialize)]
struct ConcentrationFields {
    target: Option<NumericValue>,
    concentration: Option<NumericValue>,
    value: Option<NumericValue>,
    level: Option<NumericValue>,
    sugar: Option<NumericValue>,
    data: Option<NumericValue>,
    source: Option<String>,
}

/// Decoded concentration value and where it came from
#[derive(Debug, Clone, PartialEq)]
pub struct ConcentrationInput {
    pub value: f64,
    pub source: String,
}

/// Normalized concentration target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcentrationTarget {
    pub target: f64,
    pub clamped: bool,
    pub original: f64,
    pub source: String,
}

/// Decode a raw concentration payload
///
/// The source label is the payload's own `source` field when present,
/// otherwise the field the value was read from (`raw` for bare values).
pub fn decode_concentration(payload: &[u8]) -> Result<ConcentrationInput, DecodeError> {
    let value = json_or_text(payload)?;
    match from_value::<ConcentrationPayload>(value)? {
        ConcentrationPayload::Bare(n) => Ok(ConcentrationInput {
            value: n.to_f64()?,
            source: "raw".to_string(),
        }),
        ConcentrationPayload::Fields(fields) => {
            let candidates = [
                ("target", &fields.target),
                ("concentration", &fields.concentration),
                ("value", &fields.value),
                ("level", &fields.level),
                ("sugar", &fields.sugar),
                ("data", &fields.data),
            ];
            let (field, number) = candidates
                .into_iter()
                .find_map(|(name, v)| v.as_ref().map(|v| (name, v)))
                .ok_or_else(|| {
                    DecodeError::UnexpectedShape(
                        "expected one of target, concentration, value, level, sugar, data"
                            .to_string(),
                    )
                })?;
            Ok(ConcentrationInput {
                value: number.to_f64()?,
                source: fields.source.unwrap_or_else(|| field.to_string()),
            })
        }
    }
}

/// Clamp a concentration value into its range
pub fn normalize_concentration(input: ConcentrationInput, range: Range) -> ConcentrationTarget {
    let target = range.clamp(input.value);
    ConcentrationTarget {
        target,
        clamped: target != input.value,
        original: input.value,
        source: input.source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn limits() -> LimitsSection {
        LimitsSection::default()
    }

    #[test]
    fn test_weight_from_numeric_string() {
        let raw = decode_weight(b"\"15.5\"").unwrap();
        let reading = normalize_weight(raw, &limits());
        assert_eq!(reading.value, 15.5);
        assert_eq!(reading.unit, "kg");
        assert_eq!(reading.status, WeightStatus::Normal);
        assert_eq!(reading.quality, WeightQuality::Good);
        assert!(!reading.clamped);
    }

    #[test]
    fn test_weight_shapes() {
        assert_eq!(decode_weight(b"12").unwrap(), 12.0);
        assert_eq!(decode_weight(b"15.5g").unwrap(), 15.5);
        assert_eq!(decode_weight(br#"{"value": 3.25}"#).unwrap(), 3.25);
        assert_eq!(decode_weight(br#"{"weight": "4.5"}"#).unwrap(), 4.5);
        assert_eq!(decode_weight(br#"{"data": {"weight": 6}}"#).unwrap(), 6.0);
        assert_eq!(decode_weight(br#"{"payload": 7}"#).unwrap(), 7.0);
    }

    #[test]
    fn test_weight_malformed() {
        assert!(decode_weight(b"").is_err());
        assert!(decode_weight(b"heavy").is_err());
        assert!(decode_weight(br#"{"unit": "kg"}"#).is_err());
        assert!(decode_weight(b"[1, 2]").is_err());
        assert!(decode_weight(b"true").is_err());
    }

    #[test]
    fn test_weight_out_of_range_is_poor() {
        let reading = normalize_weight(80.0, &limits());
        assert_eq!(reading.value, 50.0);
        assert!(reading.clamped);
        assert_eq!(reading.quality, WeightQuality::Poor);
        assert_eq!(reading.status, WeightStatus::Heavy);

        let negative = normalize_weight(-2.0, &limits());
        assert_eq!(negative.value, 0.0);
        assert_eq!(negative.status, WeightStatus::Empty);
        assert_eq!(negative.quality, WeightQuality::Poor);
    }

    #[test]
    fn test_weight_heavy_is_warning() {
        let reading = normalize_weight(45.0, &limits());
        assert_eq!(reading.status, WeightStatus::Heavy);
        assert_eq!(reading.quality, WeightQuality::Warning);
    }

    #[test]
    fn test_weight_rounding_marks_filtered() {
        let reading = normalize_weight(12.3456, &limits());
        assert_eq!(reading.value, 12.35);
        assert_eq!(reading.quality, WeightQuality::Filtered);
        assert_eq!(reading.raw_value, 12.3456);
    }

    #[test]
    fn test_weight_empty_threshold() {
        let reading = normalize_weight(0.01, &limits());
        assert_eq!(reading.status, WeightStatus::Empty);
    }

    #[test]
    fn test_concentration_clamped() {
        let input = decode_concentration(br#"{"target": 150}"#).unwrap();
        let target = normalize_concentration(input, Range::new(0.0, 100.0));
        assert_eq!(target.target, 100.0);
        assert!(target.clamped);
        assert_eq!(target.original, 150.0);
        assert_eq!(target.source, "target");
    }

    #[test]
    fn test_concentration_source_label() {
        let input = decode_concentration(br#"{"sugar": "40", "source": "dashboard"}"#).unwrap();
        assert_eq!(input.value, 40.0);
        assert_eq!(input.source, "dashboard");

        let bare = decode_concentration(b"55").unwrap();
        assert_eq!(bare.source, "raw");
    }

    #[test]
    fn test_concentration_in_range_untouched() {
        let input = decode_concentration(br#"{"level": 42.5}"#).unwrap();
        let target = normalize_concentration(input, Range::new(0.0, 100.0));
        assert_eq!(target.target, 42.5);
        assert!(!target.clamped);
    }

    #[test]
    fn test_concentration_malformed() {
        assert!(decode_concentration(br#"{"source": "x"}"#).is_err());
        assert!(decode_concentration(b"lots").is_err());
    }

    proptest! {
        #[test]
        fn weight_normalization_is_idempotent(raw in -1000.0f64..1000.0) {
            let limits = limits();
            let once = normalize_weight(raw, &limits);
            let twice = normalize_weight(once.value, &limits);
            prop_assert_eq!(once.value, twice.value);
            prop_assert!(limits.weight.contains(once.value));
        }

        #[test]
        fn weight_in_range_is_not_clamped(raw in 0.0f64..50.0) {
            let reading = normalize_weight(raw, &limits());
            prop_assert!(!reading.clamped);
        }

        #[test]
        fn concentration_clamp_is_idempotent(raw in -500.0f64..500.0) {
            let range = Range::new(0.0, 100.0);
            let once = normalize_concentration(ConcentrationInput { value: raw, source: "raw".into() }, range);
            let twice = normalize_concentration(ConcentrationInput { value: once.target, source: "raw".into() }, range);
            prop_assert_eq!(once.target, twice.target);
            prop_assert!(!twice.clamped);
            prop_assert!(range.contains(once.target));
        }
    }
}
