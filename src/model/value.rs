//! Typed configuration values.
//!
//! Values are persisted as raw JSON next to their declared [`DataType`] and
//! converted into a [`ConfigValue`] exactly once: on the write path before
//! validation, and on the read path before a resolution enters the cache.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declared storage type of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Number,
    Boolean,
    Json,
    Array,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Json => "json",
            Self::Array => "array",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value converted to its declared type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ConfigValue {
    String(String),
    Number(f64),
    Boolean(bool),
    Json(Value),
    Array(Vec<Value>),
}

/// Raw input could not be converted to the declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMismatch {
    pub expected: DataType,
    pub found: &'static str,
}

impl ConfigValue {
    /// Convert raw JSON into the declared type.
    ///
    /// Lenient where the intent is unambiguous: numeric strings become
    /// numbers, `"true"`/`"false"` become booleans, and a JSON-encoded string
    /// is accepted for `json` and `array` entries.
    pub fn coerce(raw: &Value, data_type: DataType) -> Result<Self, TypeMismatch> {
        let mismatch = || TypeMismatch {
            expected: data_type,
            found: json_kind(raw),
        };

        match data_type {
            DataType::String => match raw {
                Value::String(s) => Ok(Self::String(s.clone())),
                _ => Err(mismatch()),
            },
            DataType::Number => match raw {
                Value::Number(n) => n.as_f64().map(Self::Number).ok_or_else(mismatch),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|n| n.is_finite())
                    .map(Self::Number)
                    .ok_or_else(mismatch),
                _ => Err(mismatch()),
            },
            DataType::Boolean => match raw {
                Value::Bool(b) => Ok(Self::Boolean(*b)),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" => Ok(Self::Boolean(true)),
                    "false" => Ok(Self::Boolean(false)),
                    _ => Err(mismatch()),
                },
                _ => Err(mismatch()),
            },
            DataType::Json => match raw {
                Value::String(s) => serde_json::from_str::<Value>(s)
                    .ok()
                    .filter(|v| v.is_object() || v.is_array())
                    .map(Self::Json)
                    .ok_or_else(mismatch),
                Value::Null => Err(mismatch()),
                other => Ok(Self::Json(other.clone())),
            },
            DataType::Array => match raw {
                Value::Array(items) => Ok(Self::Array(items.clone())),
                Value::String(s) => match serde_json::from_str::<Value>(s) {
                    Ok(Value::Array(items)) => Ok(Self::Array(items)),
                    _ => Err(mismatch()),
                },
                _ => Err(mismatch()),
            },
        }
    }

    /// Take raw JSON at face value, for caller-supplied defaults with no
    /// declared type.
    pub fn infer(raw: Value) -> Self {
        match raw {
            Value::String(s) => Self::String(s),
            Value::Bool(b) => Self::Boolean(b),
            Value::Number(n) => match n.as_f64() {
                Some(f) => Self::Number(f),
                None => Self::Json(Value::Number(n)),
            },
            Value::Array(items) => Self::Array(items),
            other => Self::Json(other),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Self::String(_) => DataType::String,
            Self::Number(_) => DataType::Number,
            Self::Boolean(_) => DataType::Boolean,
            Self::Json(_) => DataType::Json,
            Self::Array(_) => DataType::Array,
        }
    }

    /// Canonical JSON form used for persistence and comparisons.
    pub fn to_json(&self) -> Value {
        match self {
            Self::String(s) => Value::String(s.clone()),
            // Integral values stay integers so `3` round-trips as `3`, not `3.0`.
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 9.0e15 => Value::from(*n as i64),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Boolean(b) => Value::Bool(*b),
            Self::Json(v) => v.clone(),
            Self::Array(items) => Value::Array(items.clone()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Deserialize a `json` value into a concrete type.
    pub fn parse_json<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        match self {
            Self::Json(v) => serde_json::from_value(v.clone()).ok(),
            _ => None,
        }
    }

    /// Length for strings (chars) and arrays (items).
    pub fn length(&self) -> Option<usize> {
        match self {
            Self::String(s) => Some(s.chars().count()),
            Self::Array(items) => Some(items.len()),
            _ => None,
        }
    }

    /// Loose truthiness used by dependency conditions.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::String(s) => !s.is_empty(),
            Self::Number(n) => *n != 0.0,
            Self::Boolean(b) => *b,
            Self::Json(v) => !v.is_null(),
            Self::Array(items) => !items.is_empty(),
        }
    }

    /// Compare against raw JSON after coercing it to this value's type.
    pub fn matches_json(&self, other: &Value) -> bool {
        ConfigValue::coerce(other, self.data_type())
            .map(|o| o == *self)
            .unwrap_or(false)
    }

    /// Render for logs, hiding sensitive content.
    pub fn display_redacted(&self, sensitive: bool) -> String {
        if sensitive {
            "[redacted]".to_string()
        } else {
            self.to_json().to_string()
        }
    }
}

/// Name of a raw JSON value's kind, for error messages.
pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_number_coercion() {
        assert_eq!(
            ConfigValue::coerce(&json!(3), DataType::Number),
            Ok(ConfigValue::Number(3.0))
        );
        assert_eq!(
            ConfigValue::coerce(&json!(" 2.5 "), DataType::Number),
            Ok(ConfigValue::Number(2.5))
        );
        let err = ConfigValue::coerce(&json!("three"), DataType::Number).unwrap_err();
        assert_eq!(err.expected, DataType::Number);
        assert_eq!(err.found, "string");
    }

    #[test]
    fn test_boolean_and_string_coercion() {
        assert_eq!(
            ConfigValue::coerce(&json!("TRUE"), DataType::Boolean),
            Ok(ConfigValue::Boolean(true))
        );
        assert!(ConfigValue::coerce(&json!(1), DataType::Boolean).is_err());
        assert!(ConfigValue::coerce(&json!(1), DataType::String).is_err());
    }

    #[test]
    fn test_json_and_array_from_encoded_strings() {
        let v = ConfigValue::coerce(&json!("{\"a\":1}"), DataType::Json).unwrap();
        assert_eq!(v.to_json(), json!({"a": 1}));

        let v = ConfigValue::coerce(&json!("[1,2]"), DataType::Array).unwrap();
        assert_eq!(v.length(), Some(2));
        assert!(ConfigValue::coerce(&json!({"a": 1}), DataType::Array).is_err());
    }

    #[test]
    fn test_matches_json_uses_declared_type() {
        let v = ConfigValue::Number(5.0);
        assert!(v.matches_json(&json!(5)));
        assert!(v.matches_json(&json!("5")));
        assert!(!v.matches_json(&json!(6)));
    }

    #[test]
    fn test_integral_numbers_encode_as_integers() {
        assert_eq!(ConfigValue::Number(3.0).to_json(), json!(3));
        assert_eq!(ConfigValue::Number(2.5).to_json(), json!(2.5));
    }

    #[test]
    fn test_redaction() {
        let v = ConfigValue::String("hunter2".into());
        assert_eq!(v.display_redacted(true), "[redacted]");
        assert_eq!(v.display_redacted(false), "\"hunter2\"");
    }
}
