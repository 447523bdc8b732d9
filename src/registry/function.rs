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

//! Utility function trait and registry
//!
//! Utility functions are plain callables over [`Value`] arguments that every
//! backend exposes to expressions: `f(x)` in the path and compiled
//! languages, native functions in the script backends.

use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::error::EvalError;
use crate::model::Value;

/// Result type for function operations
pub type FunctionResult<T> = Result<T, FunctionError>;

/// Function evaluation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FunctionError {
    /// Invalid number of arguments
    #[error("Function '{name}' expects {min}-{} arguments, got {actual}", max.map_or("∞".to_string(), |n| n.to_string()))]
    InvalidArity {
        /// Function name
        name: String,
        /// Minimum arguments
        min: usize,
        /// Maximum arguments (None for unlimited)
        max: Option<usize>,
        /// Actual arguments provided
        actual: usize,
    },

    /// Invalid argument type
    #[error("Function '{name}' argument {index} expects {expected}, got {actual}")]
    InvalidArgumentType {
        /// Function name
        name: String,
        /// Argument index
        index: usize,
        /// Expected type
        expected: String,
        /// Actual type
        actual: String,
    },

    /// Runtime evaluation error
    #[error("Function '{name}' evaluation error: {message}")]
    EvaluationError {
        /// Function name
        name: String,
        /// Error message
        message: String,
    },
}

impl FunctionError {
    /// Name of the failing function
    pub fn name(&self) -> &str {
        match self {
            Self::InvalidArity { name, .. }
            | Self::InvalidArgumentType { name, .. }
            | Self::EvaluationError { name, .. } => name,
        }
    }
}

impl From<FunctionError> for EvalError {
    fn from(err: FunctionError) -> Self {
        EvalError::function(err.name().to_string(), err.to_string())
    }
}

/// A callable exposed to every expression of an evaluation context
pub trait UtilityFunction: Send + Sync {
    /// Name the function is called by
    fn name(&self) -> &str;

    /// Minimum and maximum argument counts (`None` for variadic)
    fn arity(&self) -> (usize, Option<usize>);

    /// Invoke the function with already evaluated arguments
    fn call(&self, args: &[Value]) -> FunctionResult<Value>;

    /// Validate the argument count against [`arity`](Self::arity)
    fn validate_args(&self, args: &[Value]) -> FunctionResult<()> {
        let (min, max) = self.arity();
        if args.len() < min || max.is_some_and(|max| args.len() > max) {
            return Err(FunctionError::InvalidArity {
                name: self.name().to_string(),
                min,
                max,
                actual: args.len(),
            });
        }
        Ok(())
    }
}

/// Registry of utility functions, shared read-only between evaluations
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: FxHashMap<String, Arc<dyn UtilityFunction>>,
}

impl FunctionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function, replacing any function with the same name
    pub fn register<F: UtilityFunction + 'static>(&mut self, function: F) {
        self.register_arc(Arc::new(function));
    }

    /// Register a shared function
    pub fn register_arc(&mut self, function: Arc<dyn UtilityFunction>) {
        self.functions.insert(function.name().to_string(), function);
    }

    /// Look up a function by name
    pub fn get(&self, name: &str) -> Option<&Arc<dyn UtilityFunction>> {
        self.functions.get(name)
    }

    /// Whether a function is registered
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Registered functions in unspecified order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn UtilityFunction>> {
        self.functions.values()
    }

    /// Validate arguments and call a function by name
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, EvalError> {
        let function = self.get(name).ok_or_else(|| EvalError::UnknownFunction {
            name: name.to_string(),
        })?;
        function.validate_args(args)?;
        Ok(function.call(args)?)
    }

    /// Number of registered functions
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Twice;

    impl UtilityFunction for Twice {
        fn name(&self) -> &str {
            "twice"
        }

        fn arity(&self) -> (usize, Option<usize>) {
            (1, Some(1))
        }

        fn call(&self, args: &[Value]) -> FunctionResult<Value> {
            match &args[0] {
                Value::Integer(i) => Ok(Value::Integer(i * 2)),
                other => Err(FunctionError::InvalidArgumentType {
                    name: "twice".into(),
                    index: 0,
                    expected: "lang.Integer".into(),
                    actual: other.type_name().into(),
                }),
            }
        }
    }

    #[test]
    fn test_registry_call() {
        let mut registry = FunctionRegistry::new();
        registry.register(Twice);
        assert_eq!(registry.call("twice", &[Value::from(21)]).unwrap(), Value::Integer(42));
        assert!(matches!(
            registry.call("twice", &[]),
            Err(EvalError::Function { ref name, .. }) if name == "twice"
        ));
        assert!(matches!(
            registry.call("thrice", &[]),
            Err(EvalError::UnknownFunction { .. })
        ));
    }

    #[test]
    fn test_arity_message() {
        let err = Twice.validate_args(&[]).unwrap_err();
        assert_eq!(err.to_string(), "Function 'twice' expects 1-1 arguments, got 0");
    }
}
