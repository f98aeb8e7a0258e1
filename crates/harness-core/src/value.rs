use bigdecimal::BigDecimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::HarnessError;

/// A number in the exact textual form produced by the runtime that created it.
///
/// Parameter blobs are parsed with arbitrary precision, so fractional and
/// out-of-range numbers arrive as `ForeignNumber` and are only turned into a
/// [`BigDecimal`] by [`normalize_numeric`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignNumber(String);

impl ForeignNumber {
    pub fn new(repr: impl Into<String>) -> Self {
        Self(repr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ForeignNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Integer(i64),
    Decimal(BigDecimal),
    Text(String),
    Foreign(ForeignNumber),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Decimal(d) => number_or_text(&d.to_string()),
            Value::Foreign(n) => number_or_text(n.as_str()),
        }
    }

    pub fn from_json(name: &str, raw: serde_json::Value) -> Result<Self, HarnessError> {
        match raw {
            serde_json::Value::Bool(b) => Ok(Value::Bool(b)),
            serde_json::Value::String(s) => Ok(Value::Text(s)),
            serde_json::Value::Number(n) => Ok(match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Foreign(ForeignNumber::new(n.to_string())),
            }),
            other => Err(HarnessError::config(format!(
                "variable `{}` must be a string, number or boolean (got {})",
                name,
                json_type_name(&other)
            ))),
        }
    }
}

fn number_or_text(repr: &str) -> serde_json::Value {
    match serde_json::from_str::<serde_json::Value>(repr) {
        Ok(v @ serde_json::Value::Number(_)) => v,
        _ => serde_json::Value::String(repr.to_string()),
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Text(s) => f.write_str(s),
            Value::Foreign(n) => f.write_str(n.as_str()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<BigDecimal> for Value {
    fn from(d: BigDecimal) -> Self {
        Value::Decimal(d)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Go through serde_json::Value so arbitrary-precision numbers keep their text.
        let raw = serde_json::Value::deserialize(deserializer)?;
        Value::from_json("value", raw).map_err(serde::de::Error::custom)
    }
}

/// Converts a foreign high-precision number into the canonical decimal type.
///
/// The conversion goes through the number's exact text, never through `f64`.
/// Everything else, including values that are already `Decimal`, is returned
/// unchanged, so the function is idempotent.
pub fn normalize_numeric(value: Value) -> Value {
    match value {
        Value::Foreign(n) => match BigDecimal::from_str(n.as_str()) {
            Ok(d) => Value::Decimal(d),
            Err(_) => {
                tracing::warn!(repr = n.as_str(), "foreign number is not a decimal; left as is");
                Value::Foreign(n)
            }
        },
        other => other,
    }
}
