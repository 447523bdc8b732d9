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

//! Conversion between [`Value`] and Rhai's [`Dynamic`]
//!
//! Host objects have no script-side representation. They cross the
//! boundary as maps of the properties the active resolvers allow, so a
//! sandboxed script sees exactly what a sandboxed path expression would.

use rhai::Dynamic;

use crate::model::{Value, ValueMap};
use crate::sandbox::ResolverSet;

/// Convert a value for a script scope
pub fn to_dynamic(value: &Value, resolvers: &ResolverSet) -> Dynamic {
    convert(value, &|object| resolvers.project(object))
}

/// Convert plain data, passing host objects as unit
pub(crate) fn plain_to_dynamic(value: &Value) -> Dynamic {
    convert(value, &|_| None)
}

fn convert(value: &Value, project: &dyn Fn(&Value) -> Option<ValueMap>) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Boolean(b) => Dynamic::from_bool(*b),
        Value::Integer(i) => Dynamic::from_int(*i),
        Value::Decimal(d) => Dynamic::from_float(*d),
        Value::String(s) => s.clone().into(),
        Value::List(items) => {
            Dynamic::from_array(items.iter().map(|item| convert(item, project)).collect())
        }
        Value::Map(map) => map_to_dynamic(map, project),
        Value::Object(_) => match project(value) {
            Some(projected) => map_to_dynamic(&projected, project),
            None => {
                log::debug!("No script form for {}, passing unit", value.type_name());
                Dynamic::UNIT
            }
        },
    }
}

fn map_to_dynamic(map: &ValueMap, project: &dyn Fn(&Value) -> Option<ValueMap>) -> Dynamic {
    let map: rhai::Map = map
        .iter()
        .map(|(key, value)| (key.as_str().into(), convert(value, project)))
        .collect();
    Dynamic::from_map(map)
}

/// Convert a script result back into a value
pub fn from_dynamic(value: Dynamic) -> Value {
    if value.is_unit() {
        return Value::Null;
    }
    if let Ok(b) = value.as_bool() {
        return Value::Boolean(b);
    }
    if let Ok(i) = value.as_int() {
        return Value::Integer(i);
    }
    if let Ok(f) = value.as_float() {
        return Value::Decimal(f);
    }
    if let Ok(c) = value.as_char() {
        return Value::String(c.to_string());
    }
    if value.is_string() {
        return match value.into_string() {
            Ok(s) => Value::String(s),
            Err(type_name) => Value::String(type_name.to_string()),
        };
    }
    if value.is_array() {
        return match value.into_array() {
            Ok(items) => Value::List(items.into_iter().map(from_dynamic).collect()),
            Err(_) => Value::Null,
        };
    }
    if value.is_map() {
        return match value.try_cast::<rhai::Map>() {
            Some(map) => Value::Map(
                map.into_iter()
                    .map(|(key, value)| (key.to_string(), from_dynamic(value)))
                    .collect(),
            ),
            None => Value::Null,
        };
    }
    Value::String(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TypeRegistry;
    use std::sync::Arc;

    #[test]
    fn test_plain_values_cross_back() {
        let resolvers = ResolverSet::open(Arc::new(TypeRegistry::with_builtins()));
        let value = Value::map([
            ("n", Value::from(1)),
            ("f", Value::from(0.5)),
            ("s", Value::from("x")),
            ("l", Value::List(vec![Value::Null, Value::from(true)])),
        ]);
        let back = from_dynamic(to_dynamic(&value, &resolvers));
        assert_eq!(back, value);
    }

    #[test]
    fn test_char_becomes_string() {
        assert_eq!(from_dynamic(Dynamic::from('c')), Value::from("c"));
    }
}
