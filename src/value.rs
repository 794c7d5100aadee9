//! Payload value types carried by stage records.
//!
//! Producer payloads are loosely typed, but not arbitrarily so: a payload is
//! an ordered map of tagged values validated against the model's declared
//! identity paths at extraction time. The `Map` arm carries nesting so dotted
//! identity paths can descend into sub-objects.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// An ordered map of payload field names to values.
pub type Payload = IndexMap<String, PayloadValue>;

/// Possible values a payload field can hold.
///
/// # Examples
///
/// ```
/// use linkage::PayloadValue;
///
/// let code = PayloadValue::String("CUST_001".to_string());
/// assert!(code.is_string());
/// assert_eq!(code.as_str(), Some("CUST_001"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PayloadValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    StringArray(Vec<String>),
    Map(Payload),
}

impl PayloadValue {
    pub const fn is_bool(&self) -> bool {
        matches!(self, Self::Bool(_))
    }

    pub const fn is_int(&self) -> bool {
        matches!(self, Self::Int(_))
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Self::Float(_))
    }

    pub const fn is_string(&self) -> bool {
        matches!(self, Self::String(_))
    }

    pub const fn is_string_array(&self) -> bool {
        matches!(self, Self::StringArray(_))
    }

    pub const fn is_map(&self) -> bool {
        matches!(self, Self::Map(_))
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_string_array(&self) -> Option<&[String]> {
        match self {
            Self::StringArray(v) => Some(v),
            _ => None,
        }
    }

    pub const fn as_map(&self) -> Option<&Payload> {
        match self {
            Self::Map(v) => Some(v),
            _ => None,
        }
    }

    /// Short name of the value's kind, for error messages.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::StringArray(_) => "string array",
            Self::Map(_) => "map",
        }
    }

    /// Rough in-memory footprint in bytes, used for batch-size feedback.
    #[must_use]
    pub fn approx_bytes(&self) -> u64 {
        match self {
            Self::Bool(_) => 1,
            Self::Int(_) | Self::Float(_) => 8,
            Self::String(s) => s.len() as u64,
            Self::StringArray(a) => a.iter().map(|s| s.len() as u64 + 8).sum(),
            Self::Map(m) => m
                .iter()
                .map(|(k, v)| k.len() as u64 + v.approx_bytes() + 16)
                .sum(),
        }
    }
}

impl TryFrom<serde_json::Value> for PayloadValue {
    type Error = String;

    /// Converts host-side JSON into the tagged payload shape.
    ///
    /// Arrays must contain only strings; `null` has no payload representation
    /// (absent fields are simply omitted from the map).
    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        use serde_json::Value;

        match value {
            Value::Bool(b) => Ok(Self::Bool(b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Self::Float(f))
                } else {
                    Err(format!("unrepresentable number: {n}"))
                }
            }
            Value::String(s) => Ok(Self::String(s)),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(s) => out.push(s),
                        other => return Err(format!("array element must be a string, got {other}")),
                    }
                }
                Ok(Self::StringArray(out))
            }
            Value::Object(fields) => {
                let mut out = Payload::with_capacity(fields.len());
                for (k, v) in fields {
                    out.insert(k, Self::try_from(v)?);
                }
                Ok(Self::Map(out))
            }
            Value::Null => Err("null has no payload representation".to_string()),
        }
    }
}
