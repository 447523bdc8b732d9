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

//! Compiled backend: the path language compiled to bytecode
//!
//! Source is parsed once, lowered by [`ExpressionCompiler`] and run by the
//! [`VirtualMachine`] on every evaluation.

pub mod bytecode;
pub mod compiler;
pub mod vm;

pub use bytecode::{Bytecode, BytecodeBuilder, Instruction};
pub use compiler::{CompilationError, CompilationResult, CompilerConfig, ExpressionCompiler};
pub use vm::{VirtualMachine, VmConfig, VmError};

use std::sync::Arc;

use crate::backend::{Backend, CompileOptions, CompiledExpression, CompiledForm, ExpressionBackend, Invocation};
use crate::error::{EvalError, EvalResult, ExpressionError, Result};
use crate::model::Value;
use crate::parser::PrattParser;
use crate::registry::FunctionRegistry;

/// Bytecode backend
pub struct CompiledBackend {
    functions: Arc<FunctionRegistry>,
    config: CompilerConfig,
}

impl CompiledBackend {
    /// Create a backend checking calls against `functions`
    pub fn new(functions: Arc<FunctionRegistry>, config: CompilerConfig) -> Self {
        Self { functions, config }
    }
}

impl ExpressionBackend for CompiledBackend {
    fn backend(&self) -> Backend {
        Backend::Compiled
    }

    fn compile(&self, source: &str, _options: CompileOptions) -> Result<CompiledForm> {
        let fail = |message: String| ExpressionError::compile(Backend::Compiled, message);
        let ast = PrattParser::with_max_depth(source, self.config.max_recursion_depth)
            .parse()
            .map_err(|err| fail(err.to_string()))?;
        let mut compiler =
            ExpressionCompiler::with_config(Some(Arc::clone(&self.functions)), self.config.clone());
        let bytecode = compiler
            .compile_with_source(&ast, source)
            .map_err(|err| fail(err.to_string()))?;
        log::trace!("Compiled '{source}':\n{}", bytecode.disassemble());
        Ok(CompiledForm::Bytecode(bytecode))
    }

    fn evaluate(&self, expression: &CompiledExpression, invocation: &Invocation<'_>) -> EvalResult<Value> {
        match expression.form() {
            CompiledForm::Bytecode(bytecode) => VirtualMachine::new(bytecode, invocation).execute(),
            _ => Err(EvalError::type_mismatch(format!(
                "{} expression passed to the compiled backend",
                expression.backend()
            ))),
        }
    }
}
