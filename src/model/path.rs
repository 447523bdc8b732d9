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

//! Dotted-path assignment and map coercion used when placing batch results

use std::fmt;
use thiserror::Error;

use super::host::{TypeRegistry, Visibility};
use super::value::{Value, ValueMap};

/// Errors raised by path utilities
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PathError {
    /// The path has no segments
    #[error("Output path is empty")]
    Empty,

    /// A segment between dots is empty
    #[error("Output path '{path}' has an empty segment")]
    EmptySegment {
        /// Path as written
        path: String,
    },
}

/// Parsed dotted output path, e.g. `headers.x-trace.id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPath {
    segments: Vec<String>,
}

impl OutputPath {
    /// Parse a dotted path
    pub fn parse(path: &str) -> Result<Self, PathError> {
        if path.trim().is_empty() {
            return Err(PathError::Empty);
        }
        let segments = path
            .split('.')
            .map(|segment| segment.trim().to_string())
            .collect::<Vec<_>>();
        if segments.iter().any(String::is_empty) {
            return Err(PathError::EmptySegment {
                path: path.to_string(),
            });
        }
        Ok(Self { segments })
    }

    /// Path segments in order
    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl fmt::Display for OutputPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

/// Assign `value` at a dotted path, creating nested maps on demand
///
/// A non-map value found at an intermediate segment is replaced by a map.
pub fn assign_at_path(map: &mut ValueMap, path: &str, value: Value) -> Result<(), PathError> {
    let path = OutputPath::parse(path)?;
    let (last, parents) = match path.segments.split_last() {
        Some(split) => split,
        None => return Err(PathError::Empty),
    };

    let mut current = map;
    for segment in parents {
        let slot = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Map(ValueMap::new()));
        if !matches!(slot, Value::Map(_)) {
            log::debug!(
                "Replacing {} at '{segment}' with a map while assigning '{path}'",
                slot.type_name()
            );
            *slot = Value::Map(ValueMap::new());
        }
        current = match slot {
            Value::Map(inner) => inner,
            _ => unreachable!("slot was just set to a map"),
        };
    }
    current.insert(last.clone(), value);
    Ok(())
}

/// Coerce a value to a key/value mapping
///
/// Maps are used directly. Host objects contribute their public properties.
/// Anything else has no map form.
pub fn to_map(value: &Value, registry: &TypeRegistry) -> Option<ValueMap> {
    match value {
        Value::Map(map) => Some(map.clone()),
        Value::Object(_) => {
            let ty = registry.type_of(value)?;
            let map = ty
                .properties()
                .filter(|member| member.visibility() == Visibility::Public)
                .filter_map(|member| match member.get(value) {
                    Ok(v) => Some((member.name().to_string(), v)),
                    Err(err) => {
                        log::debug!("Skipping {} in map conversion: {err}", member.qualified_name());
                        None
                    }
                })
                .collect();
            Some(map)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_assign_creates_nested_maps() {
        let mut map = ValueMap::new();
        assign_at_path(&mut map, "a.b.c", Value::from(1)).unwrap();
        assign_at_path(&mut map, "a.b.d", Value::from(2)).unwrap();
        assign_at_path(&mut map, "top", Value::from("x")).unwrap();
        assert_eq!(
            serde_json::Value::from(&Value::Map(map)),
            json!({"a": {"b": {"c": 1, "d": 2}}, "top": "x"})
        );
    }

    #[test]
    fn test_assign_replaces_scalar_intermediate() {
        let mut map = ValueMap::new();
        assign_at_path(&mut map, "a", Value::from(1)).unwrap();
        assign_at_path(&mut map, "a.b", Value::from(2)).unwrap();
        assert_eq!(
            serde_json::Value::from(&Value::Map(map)),
            json!({"a": {"b": 2}})
        );
    }

    #[test]
    fn test_invalid_paths() {
        let mut map = ValueMap::new();
        assert_eq!(assign_at_path(&mut map, "", Value::Null), Err(PathError::Empty));
        assert!(matches!(
            assign_at_path(&mut map, "a..b", Value::Null),
            Err(PathError::EmptySegment { .. })
        ));
    }

    #[test]
    fn test_to_map_of_plain_values() {
        let registry = TypeRegistry::with_builtins();
        let map = Value::map([("x", Value::from(1))]);
        assert_eq!(to_map(&map, &registry), map.as_map().cloned());
        assert_eq!(to_map(&Value::from(3), &registry), None);
    }
}
