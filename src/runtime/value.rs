//! Dynamic values stored in locations
//!
//! Locations hold JSON values so that environments serialize directly into
//! instance snapshots. `ValueKind` is the type tag carried by location
//! references and checked on every write.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Value held by a location
pub type Value = serde_json::Value;

/// Type tag of a location reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ValueKind {
    /// Accepts any value
    #[default]
    Any,
    /// JSON null only
    Null,
    /// Boolean
    Bool,
    /// Integer or floating point number
    Number,
    /// UTF-8 string
    String,
    /// Ordered list
    Array,
    /// String-keyed map
    Object,
}

impl ValueKind {
    /// Kind of a concrete value
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
        }
    }

    /// Whether a value may be stored under this kind.
    ///
    /// Null is accepted everywhere so that unset optional values stay representable.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ValueKind::Any => true,
            kind => value.is_null() || *kind == ValueKind::of(value),
        }
    }

    /// Whether a reference of kind `other` may be bound where `self` is expected
    pub fn is_compatible_with(&self, other: ValueKind) -> bool {
        *self == ValueKind::Any || other == ValueKind::Any || *self == other
    }

    /// Initial value for a location of this kind
    pub fn default_value(&self) -> Value {
        match self {
            ValueKind::Any | ValueKind::Null => Value::Null,
            ValueKind::Bool => Value::Bool(false),
            ValueKind::Number => Value::from(0),
            ValueKind::String => Value::String(String::new()),
            ValueKind::Array => Value::Array(Vec::new()),
            ValueKind::Object => Value::Object(serde_json::Map::new()),
        }
    }

    /// Stable lowercase name used in fingerprints and messages
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Any => "any",
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_accepts() {
        assert!(ValueKind::Any.accepts(&json!({"a": 1})));
        assert!(ValueKind::Number.accepts(&json!(3.5)));
        assert!(ValueKind::Number.accepts(&Value::Null));
        assert!(!ValueKind::String.accepts(&json!(1)));
    }

    #[test]
    fn test_kind_compatibility() {
        assert!(ValueKind::Any.is_compatible_with(ValueKind::Bool));
        assert!(ValueKind::String.is_compatible_with(ValueKind::Any));
        assert!(!ValueKind::String.is_compatible_with(ValueKind::Number));
    }
}
