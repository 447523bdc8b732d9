// Copyright 2024 OctoFHIR Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Core value type shared by every backend

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;

use super::host::{HostObject, HostRef};

/// Ordered string-keyed map used for map values and batch output
pub type ValueMap = IndexMap<String, Value>;

/// Dynamic value produced and consumed by expressions
///
/// Plain data (`Null` through `Map`) comes from JSON roots, literals and
/// script results. `Object` carries a host object whose members are only
/// reachable through the resolvers of the active sandbox mode.
#[derive(Clone, Default)]
pub enum Value {
    /// Absent value
    #[default]
    Null,

    /// Boolean value
    Boolean(bool),

    /// Integer value (64-bit signed)
    Integer(i64),

    /// Floating point value
    Decimal(f64),

    /// String value
    String(String),

    /// Ordered list of values
    List(Vec<Value>),

    /// Insertion-ordered map of values
    Map(ValueMap),

    /// Host object exposed through the type registry
    Object(HostRef),
}

impl Value {
    /// Wrap a host object
    pub fn object(object: impl HostObject) -> Self {
        Self::Object(Arc::new(object))
    }

    /// Build a map value from key/value pairs
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Qualified type name of this value
    ///
    /// Plain data lives in the builtin `lang` namespace; host objects report
    /// their own registered name.
    pub fn type_name(&self) -> &str {
        match self {
            Self::Null => "lang.Null",
            Self::Boolean(_) => "lang.Boolean",
            Self::Integer(_) => "lang.Integer",
            Self::Decimal(_) => "lang.Double",
            Self::String(_) => "lang.String",
            Self::List(_) => "lang.List",
            Self::Map(_) => "lang.Map",
            Self::Object(object) => object.type_name(),
        }
    }

    /// Check if this value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get as boolean if this is a boolean value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as integer if this is an integer value
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as float, widening integers
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    /// Get as string slice if this is a string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as list if this is a list value
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Get as map if this is a map value
    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Get the host object if this is an object value
    pub fn as_object(&self) -> Option<&HostRef> {
        match self {
            Self::Object(object) => Some(object),
            _ => None,
        }
    }

    /// Downcast a host object value to its concrete type
    pub fn downcast_ref<T: HostObject>(&self) -> Option<&T> {
        self.as_object()
            .and_then(|object| object.as_any().downcast_ref::<T>())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Decimal(a), Self::Decimal(b)) => a == b,
            (Self::Integer(a), Self::Decimal(b)) | (Self::Decimal(b), Self::Integer(a)) => {
                (*a as f64) == *b
            }
            (Self::String(a), Self::String(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Integer(value.into())
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Self::Integer(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Decimal(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Self::List(value)
    }
}

impl From<ValueMap> for Value {
    fn from(value: ValueMap) -> Self {
        Self::Map(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Convert from serde_json::Value
impl From<JsonValue> for Value {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Boolean(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    Self::Decimal(f)
                } else {
                    Self::String(n.to_string())
                }
            }
            JsonValue::String(s) => Self::String(s),
            JsonValue::Array(items) => Self::List(items.into_iter().map(Value::from).collect()),
            JsonValue::Object(obj) => {
                Self::Map(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

/// Convert to serde_json::Value
///
/// Host objects have no data representation of their own and serialize as
/// their type name.
impl From<&Value> for JsonValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => JsonValue::Null,
            Value::Boolean(b) => JsonValue::Bool(*b),
            Value::Integer(i) => JsonValue::Number((*i).into()),
            Value::Decimal(d) => serde_json::Number::from_f64(*d)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(d.to_string())),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::List(items) => JsonValue::Array(items.iter().map(JsonValue::from).collect()),
            Value::Map(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), JsonValue::from(v)))
                    .collect(),
            ),
            Value::Object(object) => JsonValue::String(format!("<{}>", object.type_name())),
        }
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        JsonValue::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        JsonValue::deserialize(deserializer).map(Value::from)
    }
}

/// String rendering used by concatenation and `lang.String` conversion
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Decimal(d) => write!(f, "{d}"),
            Self::String(s) => write!(f, "{s}"),
            Self::List(_) | Self::Map(_) => write!(f, "{}", JsonValue::from(self)),
            Self::Object(object) => write!(f, "<{}>", object.type_name()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Boolean(b) => write!(f, "Boolean({b})"),
            Self::Integer(i) => write!(f, "Integer({i})"),
            Self::Decimal(d) => write!(f, "Decimal({d})"),
            Self::String(s) => write!(f, "String({s:?})"),
            Self::List(items) => f.debug_list().entries(items).finish(),
            Self::Map(map) => f.debug_map().entries(map).finish(),
            Self::Object(object) => write!(f, "Object({object:?})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_conversion_preserves_order() {
        let value = Value::from(json!({"b": 1, "a": [true, null, 1.5], "c": "x"}));
        let map = value.as_map().unwrap();
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["b", "a", "c"]);
        assert_eq!(
            map["a"],
            Value::List(vec![Value::Boolean(true), Value::Null, Value::Decimal(1.5)])
        );
        assert_eq!(JsonValue::from(&value), json!({"b": 1, "a": [true, null, 1.5], "c": "x"}));
    }

    #[test]
    fn test_numeric_equality_widens() {
        assert_eq!(Value::Integer(2), Value::Decimal(2.0));
        assert_ne!(Value::Integer(2), Value::String("2".into()));
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Value::Null.type_name(), "lang.Null");
        assert_eq!(Value::from("x").type_name(), "lang.String");
        assert_eq!(Value::from(1.5).type_name(), "lang.Double");
        assert_eq!(Value::map([("k", Value::Null)]).type_name(), "lang.Map");
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::from(3).to_string(), "3");
        assert_eq!(Value::from("hi").to_string(), "hi");
        assert_eq!(Value::List(vec![1.into(), 2.into()]).to_string(), "[1,2]");
    }
}
