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

//! Rhai script backends
//!
//! Both script backends run on pooled interpreters. Every source is parsed
//! at compile time so syntax errors surface there. A precompiled expression
//! keeps the parsed script; otherwise the source is parsed again per call.

pub mod convert;
pub mod engine;
pub mod pool;

pub use convert::{from_dynamic, to_dynamic};
pub use engine::ScriptEngine;
pub use pool::{DEFAULT_MAX_ENGINES, EngineFactory, EnginePool, PoolStats, PooledEngine};

use std::sync::Arc;

use crate::backend::{Backend, CompileOptions, CompiledExpression, CompiledForm, ExpressionBackend, Invocation};
use crate::error::{EvalError, EvalResult, ExpressionError, Result};
use crate::model::Value;

/// Script backend family served by an [`EnginePool`]
#[derive(Debug, Clone)]
pub struct ScriptBackend {
    backend: Backend,
    pool: Arc<EnginePool>,
}

impl ScriptBackend {
    /// Create a backend for `Script` or `ScriptExpression`
    pub fn new(backend: Backend, pool: Arc<EnginePool>) -> Self {
        debug_assert!(backend.is_script());
        Self { backend, pool }
    }
}

impl ExpressionBackend for ScriptBackend {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn compile(&self, source: &str, options: CompileOptions) -> Result<CompiledForm> {
        let engine = self.pool.acquire(self.backend);
        let ast = engine
            .compile(self.backend, source)
            .map_err(|err| ExpressionError::compile(self.backend, err.to_string()))?;
        Ok(CompiledForm::Script(options.precompile.then_some(ast)))
    }

    fn evaluate(&self, expression: &CompiledExpression, invocation: &Invocation<'_>) -> EvalResult<Value> {
        let ast = match expression.form() {
            CompiledForm::Script(ast) => ast.as_ref(),
            _ => {
                return Err(EvalError::script(format!(
                    "{} expression handed to the {} backend",
                    expression.backend(),
                    self.backend
                )));
            }
        };
        let engine = self.pool.acquire(self.backend);
        engine.run(self.backend, expression.source(), ast, invocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EvaluationContext;
    use crate::evaluator::EvaluationLimits;
    use crate::model::TypeRegistry;
    use crate::registry::FunctionRegistry;
    use crate::sandbox::ResolverSet;

    fn backend(kind: Backend) -> (ScriptBackend, Arc<EnginePool>) {
        let pool = Arc::new(EnginePool::new(Arc::new(FunctionRegistry::new()), 2, 32));
        (ScriptBackend::new(kind, Arc::clone(&pool)), pool)
    }

    fn evaluate(backend: &ScriptBackend, source: &str, options: CompileOptions) -> EvalResult<Value> {
        let form = backend.compile(source, options).unwrap();
        let expression = CompiledExpression::new(backend.backend(), false, Arc::from(source), form);
        let context = EvaluationContext::new(
            Value::map([("qty", Value::from(4))]),
            Arc::new(FunctionRegistry::new()),
        );
        let resolvers = ResolverSet::open(Arc::new(TypeRegistry::with_builtins()));
        backend.evaluate(
            &expression,
            &Invocation {
                context: &context,
                resolvers: &resolvers,
                limits: EvaluationLimits::default(),
                sandboxed: false,
            },
        )
    }

    #[test]
    fn test_precompiled_and_interpreted_agree() {
        let (script, _) = backend(Backend::ScriptExpression);
        assert_eq!(evaluate(&script, "qty * 2", CompileOptions::default()).unwrap(), Value::Integer(8));
        assert_eq!(evaluate(&script, "qty * 2", CompileOptions::precompiled()).unwrap(), Value::Integer(8));
    }

    #[test]
    fn test_statements_need_script_backend() {
        let (statements, _) = backend(Backend::Script);
        assert_eq!(
            evaluate(&statements, "let x = qty; x + 1", CompileOptions::precompiled()).unwrap(),
            Value::Integer(5)
        );

        let (expression, _) = backend(Backend::ScriptExpression);
        assert!(matches!(
            expression.compile("let x = 1; x", CompileOptions::precompiled()),
            Err(ExpressionError::Compile { .. })
        ));
    }

    #[test]
    fn test_syntax_error_rejected_without_precompile() {
        for kind in [Backend::Script, Backend::ScriptExpression] {
            let (script, _) = backend(kind);
            assert!(matches!(
                script.compile("1 +", CompileOptions::default()),
                Err(ExpressionError::Compile { .. })
            ));
            assert!(matches!(
                script.compile("qty + 1", CompileOptions::default()),
                Ok(CompiledForm::Script(None))
            ));
        }
    }

    #[test]
    fn test_engine_released_after_error() {
        let (script, pool) = backend(Backend::Script);
        assert!(evaluate(&script, "missing_variable + 1", CompileOptions::default()).is_err());
        let stats = pool.stats(Backend::Script);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.owned, 1);
    }
}
