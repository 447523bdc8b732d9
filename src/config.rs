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

//! Engine configuration with presets and a fluent builder

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::cache::DEFAULT_CACHE_CAPACITY;
use crate::evaluator::{DEFAULT_MAX_DEPTH, DEFAULT_MAX_OPERATIONS, EvaluationLimits};
use crate::sandbox::DEFAULT_MEMO_CAPACITY;
use crate::script::DEFAULT_MAX_ENGINES;

/// Configuration of an [`ExpressionEngine`](crate::ExpressionEngine)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Backend used when an expression does not name one
    pub default_backend: Backend,
    /// Sandbox mode used when a caller does not choose one
    pub default_sandbox: bool,
    /// Whether sandboxed evaluation may be requested at all
    pub sandboxing_enabled: bool,
    /// Log reads through null intermediates at error level in verbose mode
    pub log_missing_properties: bool,
    /// Pooled script engines per backend
    pub max_engines_per_backend: usize,
    /// Compiled-expression cache capacity
    pub cache_capacity: usize,
    /// Type allow-list memo capacity
    pub type_memo_capacity: usize,
    /// Wall-clock limit per evaluation in milliseconds
    pub evaluation_timeout_ms: Option<u64>,
    /// Operation budget per evaluation, zero for unlimited
    pub max_operations: u64,
    /// Maximum parse and evaluation depth
    pub max_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_backend: Backend::Path,
            default_sandbox: false,
            sandboxing_enabled: true,
            log_missing_properties: false,
            max_engines_per_backend: DEFAULT_MAX_ENGINES,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            type_memo_capacity: DEFAULT_MEMO_CAPACITY,
            evaluation_timeout_ms: Some(5000),
            max_operations: DEFAULT_MAX_OPERATIONS,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl EngineConfig {
    /// Larger caches and pools, no deadline
    pub fn high_performance() -> Self {
        Self {
            max_engines_per_backend: 32,
            cache_capacity: 16 * 1024,
            type_memo_capacity: 1024,
            evaluation_timeout_ms: None,
            max_operations: 0,
            ..Self::default()
        }
    }

    /// Sandboxed by default with tight limits
    pub fn strict() -> Self {
        Self {
            default_sandbox: true,
            log_missing_properties: true,
            evaluation_timeout_ms: Some(1000),
            max_operations: 100_000,
            max_depth: 64,
            ..Self::default()
        }
    }

    /// Small caches and pools for tests
    pub fn testing() -> Self {
        Self {
            max_engines_per_backend: 2,
            cache_capacity: 64,
            type_memo_capacity: 32,
            evaluation_timeout_ms: Some(2000),
            ..Self::default()
        }
    }

    /// Wall-clock limit per evaluation
    pub fn evaluation_timeout(&self) -> Option<Duration> {
        self.evaluation_timeout_ms.map(Duration::from_millis)
    }

    /// Limits applied to each evaluation
    pub fn limits(&self) -> EvaluationLimits {
        EvaluationLimits {
            timeout: self.evaluation_timeout(),
            max_operations: self.max_operations,
            max_depth: self.max_depth,
        }
    }
}

/// Fluent builder for [`EngineConfig`]
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Start from the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    pub fn from_config(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Set the default backend
    pub fn with_default_backend(mut self, backend: Backend) -> Self {
        self.config.default_backend = backend;
        self
    }

    /// Set the default sandbox mode
    pub fn with_default_sandbox(mut self, sandbox: bool) -> Self {
        self.config.default_sandbox = sandbox;
        self
    }

    /// Allow or forbid sandboxed evaluation
    pub fn with_sandboxing(mut self, enabled: bool) -> Self {
        self.config.sandboxing_enabled = enabled;
        self
    }

    /// Toggle error-level logging of null intermediate reads
    pub fn with_log_missing_properties(mut self, enabled: bool) -> Self {
        self.config.log_missing_properties = enabled;
        self
    }

    /// Set pooled engines per backend
    pub fn with_max_engines(mut self, max: usize) -> Self {
        self.config.max_engines_per_backend = max;
        self
    }

    /// Set the compiled-expression cache capacity
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.config.cache_capacity = capacity;
        self
    }

    /// Set the type allow-list memo capacity
    pub fn with_type_memo_capacity(mut self, capacity: usize) -> Self {
        self.config.type_memo_capacity = capacity;
        self
    }

    /// Set (or remove) the per-evaluation deadline
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.evaluation_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    /// Set the operation budget
    pub fn with_max_operations(mut self, max: u64) -> Self {
        self.config.max_operations = max;
        self
    }

    /// Set the maximum depth
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.config.max_depth = depth;
        self
    }

    /// Finish
    pub fn build(self) -> EngineConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_builder() {
        let config = EngineConfigBuilder::new()
            .with_default_backend(Backend::Script)
            .with_sandboxing(false)
            .with_timeout(Some(Duration::from_millis(250)))
            .with_max_operations(10)
            .build();

        assert_eq!(config.default_backend, Backend::Script);
        assert!(!config.sandboxing_enabled);
        assert_eq!(
            config.limits(),
            EvaluationLimits {
                timeout: Some(Duration::from_millis(250)),
                max_operations: 10,
                max_depth: DEFAULT_MAX_DEPTH,
            }
        );
    }

    #[test]
    fn test_presets() {
        assert!(EngineConfig::strict().default_sandbox);
        assert_eq!(EngineConfig::high_performance().limits().timeout, None);
        assert_eq!(EngineConfig::testing().max_engines_per_backend, 2);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"default_backend": "script-expression", "max_depth": 16}"#)
                .unwrap();
        assert_eq!(config.default_backend, Backend::ScriptExpression);
        assert_eq!(config.max_depth, 16);
        assert_eq!(config.cache_capacity, DEFAULT_CACHE_CAPACITY);
    }
}
