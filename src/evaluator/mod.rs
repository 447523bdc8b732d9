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

//! Path backend: parse to an AST, evaluate by walking the tree
//!
//! The operator semantics in [`operations`] and the limits in [`budget`]
//! are shared with the compiled backend's VM.

pub mod budget;
pub mod operations;
pub mod walker;

pub use budget::{DEFAULT_MAX_DEPTH, DEFAULT_MAX_OPERATIONS, EvaluationBudget, EvaluationLimits};
pub use walker::TreeWalker;

use crate::backend::{Backend, CompileOptions, CompiledExpression, CompiledForm, ExpressionBackend, Invocation};
use crate::error::{EvalError, EvalResult, ExpressionError, Result};
use crate::model::Value;
use crate::parser::PrattParser;

/// AST-walking backend
#[derive(Debug, Clone)]
pub struct PathBackend {
    max_depth: usize,
}

impl PathBackend {
    /// Create a backend whose parser accepts nesting up to `max_depth`
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }
}

impl Default for PathBackend {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl ExpressionBackend for PathBackend {
    fn backend(&self) -> Backend {
        Backend::Path
    }

    fn compile(&self, source: &str, _options: CompileOptions) -> Result<CompiledForm> {
        PrattParser::with_max_depth(source, self.max_depth)
            .parse()
            .map(CompiledForm::Tree)
            .map_err(|err| ExpressionError::compile(Backend::Path, err.to_string()))
    }

    fn evaluate(&self, expression: &CompiledExpression, invocation: &Invocation<'_>) -> EvalResult<Value> {
        match expression.form() {
            CompiledForm::Tree(node) => TreeWalker::new(invocation).evaluate(node),
            _ => Err(EvalError::type_mismatch(format!(
                "{} expression passed to the path backend",
                expression.backend()
            ))),
        }
    }
}
