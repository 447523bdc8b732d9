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

//! Batch output evaluation
//!
//! A batch is an ordered list of [`Expression`]s evaluated into one result
//! map. Every expression sees a wrapper root with the original `root`, the
//! `result` built so far and the caller's `context`, so later expressions
//! can read what earlier ones produced.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::backend::{Backend, CompileOptions, CompiledExpression};
use crate::context::EvaluationContext;
use crate::engine::ExpressionEngine;
use crate::error::{ExpressionError, Result};
use crate::model::{OutputPath, Value, ValueMap, assign_at_path, to_map};

/// Name of the original root in the wrapper root
pub const ROOT_KEY: &str = "root";
/// Name of the accumulating result in the wrapper root
pub const RESULT_KEY: &str = "result";
/// Name of the caller context in the wrapper root
pub const CONTEXT_KEY: &str = "context";

/// One output expression of a batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Expression {
    /// Source text
    pub source: String,
    /// Backend, or the engine default
    pub backend: Option<Backend>,
    /// Sandbox mode, or the batch default
    pub sandbox: Option<bool>,
    /// Variables bound for this expression
    pub variables: IndexMap<String, Value>,
    /// Dotted output path
    pub path: Option<String>,
    /// Merge a map-shaped result into the top level instead of assigning it
    pub merge_map: bool,
    /// Build the executable form at compile time
    pub precompile: bool,
}

impl Expression {
    /// Expression assigned at `path`
    pub fn new(path: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Expression whose map result is merged into the top level
    pub fn merged(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            merge_map: true,
            ..Self::default()
        }
    }

    /// Use a backend
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use a sandbox mode
    pub fn with_sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Bind a variable
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// Request a prebuilt form
    pub fn precompiled(mut self) -> Self {
        self.precompile = true;
        self
    }

    /// Check required fields
    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(ExpressionError::validation("source", "must not be empty"));
        }
        if self.merge_map {
            return Ok(());
        }
        match self.path.as_deref() {
            None => Err(ExpressionError::validation(
                "path",
                "is required unless the result is merged",
            )),
            Some(path) => OutputPath::parse(path)
                .map(|_| ())
                .map_err(|err| ExpressionError::validation("path", err.to_string())),
        }
    }
}

struct Prepared<'e> {
    expression: &'e Expression,
    compiled: Arc<CompiledExpression>,
}

impl ExpressionEngine {
    /// Evaluate a batch, leaving out expressions that fail
    pub fn evaluate_batch(
        &self,
        expressions: &[Expression],
        root: &Value,
        sandbox_default: bool,
        context: &ValueMap,
    ) -> ValueMap {
        let prepared = expressions
            .iter()
            .enumerate()
            .filter_map(|(index, expression)| match self.prepare(expression, sandbox_default) {
                Ok(prepared) => Some(prepared),
                Err(err) => {
                    log::warn!("Skipping batch expression {index}: {err}");
                    None
                }
            })
            .collect::<Vec<_>>();

        let mut scope = self.batch_scope(root, context);
        let mut result = ValueMap::new();
        for item in &prepared {
            if let Err(err) = self.place(item, &mut scope, &mut result) {
                log::warn!(
                    "Batch expression '{}' produced no output: {err}",
                    item.expression.source
                );
            }
        }
        result
    }

    /// Evaluate a batch, aborting on the first failure
    pub fn evaluate_batch_with_exception(
        &self,
        expressions: &[Expression],
        root: &Value,
        sandbox_default: bool,
        context: &ValueMap,
    ) -> Result<ValueMap> {
        let prepared = expressions
            .iter()
            .map(|expression| self.prepare(expression, sandbox_default))
            .collect::<Result<Vec<_>>>()?;

        let mut scope = self.batch_scope(root, context);
        let mut result = ValueMap::new();
        for item in &prepared {
            self.place(item, &mut scope, &mut result)?;
        }
        Ok(result)
    }

    fn prepare<'e>(&self, expression: &'e Expression, sandbox_default: bool) -> Result<Prepared<'e>> {
        expression.validate()?;
        let options = CompileOptions {
            precompile: expression.precompile,
        };
        let compiled = self.compile(
            &expression.source,
            expression.backend.unwrap_or_else(|| self.default_backend()),
            expression.sandbox.unwrap_or(sandbox_default),
            options,
        )?;
        Ok(Prepared {
            expression,
            compiled,
        })
    }

    /// Wrapper root shared by every expression of one batch
    fn batch_scope(&self, root: &Value, context: &ValueMap) -> EvaluationContext {
        self.context(Value::map([
            (ROOT_KEY, root.clone()),
            (RESULT_KEY, Value::Map(ValueMap::new())),
            (CONTEXT_KEY, Value::Map(context.clone())),
        ]))
    }

    fn place(
        &self,
        item: &Prepared<'_>,
        scope: &mut EvaluationContext,
        result: &mut ValueMap,
    ) -> Result<()> {
        // The accumulated result moves into the wrapper for the call and back out after it
        swap_result(scope, result);
        let variables = scope.variables_mut();
        variables.clear();
        variables.extend(item.expression.variables.clone());
        let evaluation = self.evaluate_in(&item.compiled, scope, false);
        swap_result(scope, result);

        let value = evaluation?;
        if value.is_null() {
            return Ok(());
        }

        if item.expression.merge_map {
            let entries = to_map(&value, self.type_registry()).ok_or_else(|| {
                ExpressionError::validation(
                    "merge_map",
                    format!("result of type {} has no map form", value.type_name()),
                )
            })?;
            result.extend(entries);
            return Ok(());
        }

        match item.expression.path.as_deref() {
            Some(path) => assign_at_path(result, path, value)
                .map_err(|err| ExpressionError::validation("path", err.to_string())),
            None => Err(ExpressionError::validation(
                "path",
                "is required unless the result is merged",
            )),
        }
    }
}

fn swap_result(scope: &mut EvaluationContext, result: &mut ValueMap) {
    if let Value::Map(wrapper) = scope.root_mut() {
        if let Some(Value::Map(slot)) = wrapper.get_mut(RESULT_KEY) {
            std::mem::swap(slot, result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn engine() -> ExpressionEngine {
        ExpressionEngine::with_config(EngineConfig::testing())
    }

    fn json_of(map: ValueMap) -> serde_json::Value {
        serde_json::Value::from(&Value::Map(map))
    }

    #[test]
    fn test_later_expressions_read_earlier_results() {
        let expressions = [
            Expression::new("a", "1 + 1"),
            Expression::new("b", "result.a * 10"),
        ];
        let result = engine().evaluate_batch(&expressions, &Value::Null, false, &ValueMap::new());
        assert_eq!(json_of(result), json!({"a": 2, "b": 20}));
    }

    #[test]
    fn test_merge_and_nested_paths() {
        let expressions = [
            Expression::merged("{x: 1, y: 2}"),
            Expression::new("totals.sum", "root.price + context.fee"),
        ];
        let root = Value::map([("price", Value::from(5))]);
        let context = Value::map([("fee", Value::from(1))]);
        let result = engine().evaluate_batch(
            &expressions,
            &root,
            false,
            context.as_map().unwrap(),
        );
        assert_eq!(json_of(result), json!({"x": 1, "y": 2, "totals": {"sum": 6}}));
    }

    #[test]
    fn test_result_survives_a_failing_expression() {
        let mut expressions = vec![Expression::new("v0", "1")];
        for i in 1..50 {
            expressions.push(Expression::new(format!("v{i}"), format!("result.v{} + 1", i - 1)));
        }
        expressions.insert(10, Expression::new("broken", "result.nothing.deeper"));

        let result = engine().evaluate_batch(&expressions, &Value::Null, false, &ValueMap::new());
        assert_eq!(result.len(), 50);
        assert!(!result.contains_key("broken"));
        assert_eq!(result["v49"], Value::Integer(50));
        assert_eq!(
            result.keys().take(3).collect::<Vec<_>>(),
            vec!["v0", "v1", "v2"]
        );
    }

    #[test]
    fn test_null_results_are_not_placed() {
        let expressions = [Expression::new("a", "root.missing")];
        let root = Value::map([("present", Value::from(1))]);
        let result = engine().evaluate_batch(&expressions, &root, false, &ValueMap::new());
        assert!(result.is_empty());
    }

    #[test]
    fn test_validation() {
        assert!(Expression::new("a", " ").validate().is_err());
        assert!(Expression::new("a..b", "1").validate().is_err());
        assert!(Expression::merged("{}").validate().is_ok());

        let missing_path = Expression {
            source: "1".into(),
            ..Expression::default()
        };
        assert!(matches!(
            missing_path.validate(),
            Err(ExpressionError::Validation { field: "path", .. })
        ));
    }

    #[test]
    fn test_expression_from_json() {
        let expression: Expression = serde_json::from_value(json!({
            "source": "qty * 2",
            "backend": "script-expression",
            "path": "out.qty",
            "variables": {"scale": 3}
        }))
        .unwrap();
        assert_eq!(expression.backend, Some(Backend::ScriptExpression));
        assert_eq!(expression.variables.get("scale"), Some(&Value::Integer(3)));
        assert!(!expression.merge_map);
    }
}
