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

//! Evaluation context: root, variables and utility functions

use indexmap::IndexMap;
use std::sync::Arc;

use crate::error::{EvalError, EvalResult};
use crate::model::Value;
use crate::registry::FunctionRegistry;

/// Names that always refer to the root
pub const ROOT_VARIABLES: [&str; 2] = ["root", "this"];

/// Root object, variables and utility functions visible to one evaluation
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    root: Value,
    variables: IndexMap<String, Value>,
    functions: Arc<FunctionRegistry>,
}

impl EvaluationContext {
    /// Create a context over `root`
    pub fn new(root: Value, functions: Arc<FunctionRegistry>) -> Self {
        Self {
            root,
            variables: IndexMap::new(),
            functions,
        }
    }

    /// Add a variable
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// Add several variables, later names overriding earlier ones
    pub fn with_variables<K, I>(mut self, variables: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        self.variables
            .extend(variables.into_iter().map(|(k, v)| (k.into(), v)));
        self
    }

    /// The evaluation root
    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Variables in insertion order
    pub fn variables(&self) -> &IndexMap<String, Value> {
        &self.variables
    }

    pub(crate) fn root_mut(&mut self) -> &mut Value {
        &mut self.root
    }

    pub(crate) fn variables_mut(&mut self) -> &mut IndexMap<String, Value> {
        &mut self.variables
    }

    /// Utility functions
    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.functions
    }

    /// Resolve `$name`
    pub fn variable(&self, name: &str) -> EvalResult<Value> {
        if let Some(value) = self.variables.get(name) {
            return Ok(value.clone());
        }
        if ROOT_VARIABLES.contains(&name) {
            return Ok(self.root.clone());
        }
        Err(EvalError::UnknownVariable {
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_lookup() {
        let context = EvaluationContext::new(Value::from(7), Arc::default())
            .with_variable("limit", Value::from(3));
        assert_eq!(context.variable("limit").unwrap(), Value::Integer(3));
        assert_eq!(context.variable("root").unwrap(), Value::Integer(7));
        assert_eq!(context.variable("this").unwrap(), Value::Integer(7));
        assert!(matches!(
            context.variable("missing"),
            Err(EvalError::UnknownVariable { .. })
        ));
    }
}
