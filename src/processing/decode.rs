//! Typed payload decoding
//!
//! Publishers are inconsistent: the same sensor may send `15.5`, `"15.5"`,
//! `"15.5g"` or `{"weight": 15.5}`. Each category decodes its payload into a
//! typed value here or fails with a [`DecodeError`]; nothing downstream probes
//! raw JSON.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

static NUMERIC_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?)")
        .expect("numeric prefix pattern is valid")
});

/// Why a payload could not be decoded
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecodeError {
    #[error("payload is empty")]
    Empty,
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("no numeric value found in {0}")]
    NotNumeric(String),
    #[error("value is not finite")]
    NotFinite,
    #[error("unexpected payload shape: {0}")]
    UnexpectedShape(String),
}

/// A number that may arrive as JSON number or as text
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum NumericValue {
    Number(f64),
    Text(String),
}

impl NumericValue {
    /// Coerce to a finite float; text uses its leading numeric prefix
    pub fn to_f64(&self) -> Result<f64, DecodeError> {
        let value = match self {
            NumericValue::Number(n) => *n,
            NumericValue::Text(text) => parse_numeric_text(text)?,
        };
        if value.is_finite() {
            Ok(value)
        } else {
            Err(DecodeError::NotFinite)
        }
    }
}

/// Parse `"15.5"`, `" 15.5 kg"` or `"15.5g"` into 15.5
pub fn parse_numeric_text(text: &str) -> Result<f64, DecodeError> {
    NUMERIC_PREFIX
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .ok_or_else(|| DecodeError::NotNumeric(truncate(text, 64)))
}

/// Decode a payload as JSON, falling back to treating it as a bare string
///
/// Non-JSON text such as `15.5g` becomes `Value::String`.
pub fn json_or_text(payload: &[u8]) -> Result<Value, DecodeError> {
    if payload.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(DecodeError::Empty);
    }
    match serde_json::from_slice::<Value>(payload) {
        Ok(value) => Ok(value),
        Err(_) => {
            let text = std::str::from_utf8(payload).map_err(|_| DecodeError::NotUtf8)?;
            Ok(Value::String(text.trim().to_string()))
        }
    }
}

/// Decode a payload strictly as JSON; empty payloads become `{}`
pub fn json_or_empty(payload: &[u8]) -> Result<Value, DecodeError> {
    if payload.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_slice(payload).map_err(|e| DecodeError::InvalidJson(e.to_string()))
}

/// Deserialize a decoded value into a typed payload
pub fn from_value<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|e| DecodeError::UnexpectedShape(e.to_string()))
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}
