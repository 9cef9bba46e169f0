use indexmap::IndexMap;

use serde::Serialize;
use serde::ser::{SerializeMap, SerializeSeq};

use crate::error::CoercionError;

/// An ordered map of named [`Value`]s.
pub type Map = IndexMap<String, Value>;

/// A wire value.
///
/// The common currency between the protocol layer, property caches, and
/// the automation expression evaluator. All numbers are `f64`: the
/// expression language makes no integer/float distinction.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// No value.
    #[default]
    Null,
    /// A boolean.
    Bool(bool),
    /// A number.
    Number(f64),
    /// A character sequence.
    Text(String),
    /// An ordered sequence of values.
    Array(Vec<Value>),
    /// An ordered map of named values.
    Map(Map),
}

impl Value {
    /// Returns the name of this value's type.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "Null",
            Self::Bool(_) => "Bool",
            Self::Number(_) => "Number",
            Self::Text(_) => "Text",
            Self::Array(_) => "Array",
            Self::Map(_) => "Map",
        }
    }

    /// Returns the numeric reading of this value.
    ///
    /// Booleans read as `1.0`/`0.0`. Text is never parsed as a number.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Returns whether this value reads as true.
    ///
    /// Numeric readings at or above `0.5` are true; everything else,
    /// including non-numeric values, is false.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        self.as_f64().is_some_and(|n| n >= 0.5)
    }

    /// Checks whether this value is [`Value::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => "null".fmt(f),
            Self::Bool(b) => b.fmt(f),
            Self::Number(n) => n.fmt(f),
            Self::Text(s) => s.fmt(f),
            Self::Array(_) | Self::Map(_) => serde_json::Value::from(self.clone()).fmt(f),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for Value {
    #[allow(clippy::cast_precision_loss)]
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Self::Array(value)
    }
}

impl From<Map> for Value {
    fn from(value: Map) -> Self {
        Self::Map(value)
    }
}

impl From<serde_json::Value> for Value {
    #[allow(clippy::cast_precision_loss)]
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            // All numbers collapse to `f64`, the only numeric type the
            // object model carries.
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Self::Text(s),
            serde_json::Value::Array(values) => {
                Self::Array(values.into_iter().map(Into::into).collect())
            }
            serde_json::Value::Object(entries) => Self::Map(
                entries
                    .into_iter()
                    .map(|(name, value)| (name, Self::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            // Non-finite numbers have no JSON representation.
            Value::Number(n) => serde_json::Number::from_f64(n).map_or(Self::Null, Self::Number),
            Value::Text(s) => Self::String(s),
            Value::Array(values) => Self::Array(values.into_iter().map(Into::into).collect()),
            Value::Map(entries) => Self::Object(
                entries
                    .into_iter()
                    .map(|(name, value)| (name, Self::from(value)))
                    .collect(),
            ),
        }
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(n) => serializer.serialize_f64(*n),
            Self::Text(s) => serializer.serialize_str(s),
            Self::Array(values) => {
                let mut seq = serializer.serialize_seq(Some(values.len()))?;
                for value in values {
                    seq.serialize_element(value)?;
                }
                seq.end()
            }
            Self::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (name, value) in entries {
                    map.serialize_entry(name, value)?;
                }
                map.end()
            }
        }
    }
}

#[cfg(feature = "deserialize")]
impl<'de> serde::Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        <serde_json::Value as serde::Deserialize>::deserialize(deserializer).map(Into::into)
    }
}

/// Conversion between wire [`Value`]s and the Rust types declared by
/// property keys.
///
/// The round-trip law holds for every implementation:
/// `T::coerce(&x.inverse()) == Ok(x)` for all valid `x`.
pub trait PropertyValue: Sized {
    /// Converts a wire value into this type.
    ///
    /// # Errors
    ///
    /// Returns a [`CoercionError`] when the wire value does not represent
    /// this type. Mismatches always fail explicitly.
    fn coerce(value: &Value) -> Result<Self, CoercionError>;

    /// Converts this value back into its wire representation.
    fn inverse(self) -> Value;

    /// Returns the name of this type, used in coercion diagnostics.
    fn type_name() -> &'static str;
}

impl PropertyValue for f64 {
    fn coerce(value: &Value) -> Result<Self, CoercionError> {
        value
            .as_f64()
            .ok_or_else(|| CoercionError::new(Self::type_name(), value.type_name()))
    }

    fn inverse(self) -> Value {
        Value::Number(self)
    }

    fn type_name() -> &'static str {
        "f64"
    }
}

impl PropertyValue for bool {
    fn coerce(value: &Value) -> Result<Self, CoercionError> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Number(n) if *n == 0.0 => Ok(false),
            Value::Number(n) if *n == 1.0 => Ok(true),
            _ => Err(CoercionError::new(Self::type_name(), value.type_name())),
        }
    }

    fn inverse(self) -> Value {
        Value::Bool(self)
    }

    fn type_name() -> &'static str {
        "bool"
    }
}

impl PropertyValue for i64 {
    #[allow(clippy::cast_possible_truncation)]
    fn coerce(value: &Value) -> Result<Self, CoercionError> {
        match value {
            // Only integral numbers coerce; fractions never truncate.
            Value::Number(n) if n.fract() == 0.0 && n.abs() <= 2f64.powi(53) => Ok(*n as Self),
            _ => Err(CoercionError::new(Self::type_name(), value.type_name())),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn inverse(self) -> Value {
        Value::Number(self as f64)
    }

    fn type_name() -> &'static str {
        "i64"
    }
}

impl PropertyValue for String {
    fn coerce(value: &Value) -> Result<Self, CoercionError> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            _ => Err(CoercionError::new(Self::type_name(), value.type_name())),
        }
    }

    fn inverse(self) -> Value {
        Value::Text(self)
    }

    fn type_name() -> &'static str {
        "String"
    }
}

impl PropertyValue for Vec<Value> {
    fn coerce(value: &Value) -> Result<Self, CoercionError> {
        match value {
            Value::Array(values) => Ok(values.clone()),
            _ => Err(CoercionError::new(Self::type_name(), value.type_name())),
        }
    }

    fn inverse(self) -> Value {
        Value::Array(self)
    }

    fn type_name() -> &'static str {
        "Array"
    }
}

impl PropertyValue for Map {
    fn coerce(value: &Value) -> Result<Self, CoercionError> {
        match value {
            Value::Map(entries) => Ok(entries.clone()),
            _ => Err(CoercionError::new(Self::type_name(), value.type_name())),
        }
    }

    fn inverse(self) -> Value {
        Value::Map(self)
    }

    fn type_name() -> &'static str {
        "Map"
    }
}

impl PropertyValue for Value {
    fn coerce(value: &Value) -> Result<Self, CoercionError> {
        Ok(value.clone())
    }

    fn inverse(self) -> Value {
        self
    }

    fn type_name() -> &'static str {
        "Value"
    }
}

#[cfg(test)]
mod tests {
    use super::{Map, PropertyValue, Value};

    fn round_trip<T: PropertyValue + Clone + PartialEq + std::fmt::Debug>(value: T) {
        assert_eq!(T::coerce(&value.clone().inverse()), Ok(value));
    }

    #[test]
    fn round_trips() {
        round_trip(0.5f64);
        round_trip(-273.15f64);
        round_trip(true);
        round_trip(false);
        round_trip(42i64);
        round_trip("hello".to_string());
        round_trip(vec![Value::Number(1.0), Value::Bool(true)]);

        let mut map = Map::new();
        map.insert("x".into(), Value::Number(0.0));
        round_trip(map);
    }

    #[test]
    fn explicit_failures() {
        // Fractions never truncate to integers.
        assert!(i64::coerce(&Value::Number(1.5)).is_err());
        // Text never parses as a number.
        assert!(f64::coerce(&Value::Text("3".into())).is_err());
        // Only exact 0/1 numbers read as booleans.
        assert!(bool::coerce(&Value::Number(0.7)).is_err());
        assert!(String::coerce(&Value::Null).is_err());
    }

    #[test]
    fn numeric_reading() {
        assert_eq!(Value::Bool(true).as_f64(), Some(1.0));
        assert_eq!(Value::Bool(false).as_f64(), Some(0.0));
        assert_eq!(Value::Text("1".into()).as_f64(), None);

        assert!(Value::Number(0.5).is_truthy());
        assert!(!Value::Number(0.49).is_truthy());
        assert!(!Value::Null.is_truthy());
    }

    #[test]
    #[cfg(feature = "deserialize")]
    fn json_round_trip() {
        let mut map = Map::new();
        map.insert("on".into(), Value::Bool(true));
        map.insert("level".into(), Value::Number(0.25));

        let value = Value::Map(map);
        assert_eq!(
            crate::deserialize::<Value>(crate::serialize(&value)),
            value
        );
    }
}
