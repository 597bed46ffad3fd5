//! Tagged value type for free-form entity content and relationship properties.
//!
//! Entity `content` and relationship `properties` are heterogeneous maps.
//! [`Value`] represents them as an explicit tagged variant rather than raw
//! `serde_json::Value`, so the storage layer and the merge rules can match on
//! shape without guessing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Map from field name to value, as stored in `content` and `properties`.
///
/// `BTreeMap` keeps serialization deterministic, which makes idempotence
/// checks a byte comparison.
pub type ValueMap = BTreeMap<String, Value>;

/// A dynamically-typed value.
///
/// The JSON representation is untagged: `true`, `42`, `"hall"`, `[..]`,
/// `{..}` all round-trip without a wrapper object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Absent/null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered list of values.
    List(Vec<Value>),
    /// Nested map.
    Map(ValueMap),
}

impl Value {
    /// Returns the boolean payload, if this value is a `Bool`.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer payload, if this value is an `Int`.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the string payload, if this value is a `String`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the list payload, if this value is a `List`.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Returns the map payload, if this value is a `Map`.
    #[must_use]
    pub const fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Flattens this value to the strings a substring search matches against.
    ///
    /// Scalars stringify; lists and maps contribute each leaf. Nulls
    /// contribute nothing.
    pub fn collect_search_text(&self, out: &mut Vec<String>) {
        match self {
            Self::Null => {},
            Self::Bool(b) => out.push(b.to_string()),
            Self::Int(i) => out.push(i.to_string()),
            Self::Float(f) => out.push(f.to_string()),
            Self::String(s) => out.push(s.clone()),
            Self::List(items) => {
                for item in items {
                    item.collect_search_text(out);
                }
            },
            Self::Map(map) => {
                for value in map.values() {
                    value.collect_search_text(out);
                }
            },
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::Null
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => write!(f, "{s}"),
            Err(_) => write!(f, "null"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

impl From<ValueMap> for Value {
    fn from(v: ValueMap) -> Self {
        Self::Map(v)
    }
}

/// Encodes a value map as a JSON string for blob storage.
pub fn encode_map(map: &ValueMap) -> crate::Result<String> {
    serde_json::to_string(map).map_err(|e| crate::Error::OperationFailed {
        operation: "encode_value_map".to_string(),
        cause: e.to_string(),
    })
}

/// Decodes a value map from its JSON blob representation.
pub fn decode_map(blob: &str) -> crate::Result<ValueMap> {
    serde_json::from_str(blob).map_err(|e| crate::Error::OperationFailed {
        operation: "decode_value_map".to_string(),
        cause: e.to_string(),
    })
}
