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

//! Configuration string resolution exposed to expressions
//!
//! `resolveConfig(text)` replaces `${key}` placeholders using a pluggable
//! [`ConfigResolver`]. Placeholders the resolver does not know are left
//! intact so a partially configured value is still visible.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use rustc_hash::FxHashMap;
use std::borrow::Cow;
use std::sync::Arc;

use crate::model::Value;
use crate::registry::function::{FunctionError, FunctionResult, UtilityFunction};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{\s*([A-Za-z0-9_.\-]+)\s*\}").expect("invalid regex"));

/// Source of configuration values
pub trait ConfigResolver: Send + Sync {
    /// Value for `key`, if configured
    fn lookup(&self, key: &str) -> Option<String>;

    /// Substitute every known `${key}` in `text`
    fn resolve<'t>(&self, text: &'t str) -> Cow<'t, str> {
        PLACEHOLDER.replace_all(text, |caps: &Captures<'_>| {
            let key = &caps[1];
            match self.lookup(key) {
                Some(value) => value,
                None => {
                    log::debug!("No configuration value for '{key}'");
                    caps[0].to_string()
                }
            }
        })
    }
}

/// Resolver over a fixed map
#[derive(Debug, Clone, Default)]
pub struct MapConfigResolver {
    values: FxHashMap<String, String>,
}

impl MapConfigResolver {
    /// Create an empty resolver
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapConfigResolver {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl ConfigResolver for MapConfigResolver {
    fn lookup(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Resolver over process environment variables
///
/// Keys are upper-cased with `.` and `-` mapped to `_`, so `db.host`
/// reads `DB_HOST`.
#[derive(Debug, Clone, Default)]
pub struct EnvConfigResolver {
    prefix: Option<String>,
}

impl EnvConfigResolver {
    /// Read variables without a prefix
    pub fn new() -> Self {
        Self::default()
    }

    /// Read variables named `<PREFIX>_<KEY>`
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }

    fn variable_name(&self, key: &str) -> String {
        let key: String = key
            .chars()
            .map(|c| match c {
                '.' | '-' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect();
        match &self.prefix {
            Some(prefix) => format!("{}_{key}", prefix.to_ascii_uppercase()),
            None => key,
        }
    }
}

impl ConfigResolver for EnvConfigResolver {
    fn lookup(&self, key: &str) -> Option<String> {
        std::env::var(self.variable_name(key)).ok()
    }
}

/// resolveConfig(text) - substitute configuration placeholders
pub struct ResolveConfigFunction {
    resolver: Arc<dyn ConfigResolver>,
}

impl ResolveConfigFunction {
    /// Expose `resolver` to expressions
    pub fn new(resolver: Arc<dyn ConfigResolver>) -> Self {
        Self { resolver }
    }
}

impl UtilityFunction for ResolveConfigFunction {
    fn name(&self) -> &str {
        "resolveConfig"
    }

    fn arity(&self) -> (usize, Option<usize>) {
        (1, Some(1))
    }

    fn call(&self, args: &[Value]) -> FunctionResult<Value> {
        match &args[0] {
            Value::String(text) => Ok(Value::String(self.resolver.resolve(text).into_owned())),
            Value::Null => Ok(Value::Null),
            other => Err(FunctionError::InvalidArgumentType {
                name: self.name().to_string(),
                index: 0,
                expected: "lang.String".to_string(),
                actual: other.type_name().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_placeholders_stay() {
        let resolver = MapConfigResolver::new().with("host", "db.internal");
        assert_eq!(
            resolver.resolve("jdbc://${host}:${ port }/x"),
            "jdbc://db.internal:${ port }/x"
        );
        assert!(matches!(resolver.resolve("plain"), Cow::Borrowed("plain")));
    }

    #[test]
    fn test_env_variable_names() {
        assert_eq!(EnvConfigResolver::new().variable_name("db.read-host"), "DB_READ_HOST");
        assert_eq!(
            EnvConfigResolver::with_prefix("app").variable_name("port"),
            "APP_PORT"
        );
    }

    #[test]
    fn test_resolve_config_function() {
        let resolver: MapConfigResolver = [("region", "eu-west-1")].into_iter().collect();
        let function = ResolveConfigFunction::new(Arc::new(resolver));
        assert_eq!(
            function.call(&[Value::from("s3.${region}")]).unwrap(),
            Value::from("s3.eu-west-1")
        );
        assert!(function.call(&[Value::from(1)]).is_err());
    }
}
