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

//! Backend identifiers and the compile/evaluate capability
//!
//! The set of expression languages is closed. [`Backend`] names one and
//! [`ExpressionBackend`] is the capability every family implements; the
//! engine dispatches on the enum.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ast::ExpressionNode;
use crate::compiler::Bytecode;
use crate::context::EvaluationContext;
use crate::error::{EvalResult, Result};
use crate::evaluator::EvaluationLimits;
use crate::model::Value;
use crate::sandbox::ResolverSet;

/// Expression language an expression is written in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// AST-walking property path language
    #[default]
    Path,
    /// Same language compiled to bytecode
    Compiled,
    /// Rhai script with statements
    Script,
    /// Single Rhai expression
    ScriptExpression,
}

impl Backend {
    /// Every backend, in declaration order
    pub const ALL: [Backend; 4] = [
        Backend::Path,
        Backend::Compiled,
        Backend::Script,
        Backend::ScriptExpression,
    ];

    /// Stable lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Path => "path",
            Backend::Compiled => "compiled",
            Backend::Script => "script",
            Backend::ScriptExpression => "script-expression",
        }
    }

    /// Whether the backend runs on pooled interpreter engines
    pub fn is_script(self) -> bool {
        matches!(self, Backend::Script | Backend::ScriptExpression)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognized backend name
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown backend '{0}' (expected one of: path, compiled, script, script-expression)")]
pub struct UnknownBackend(pub String);

impl FromStr for Backend {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "path" => Ok(Backend::Path),
            "compiled" => Ok(Backend::Compiled),
            "script" => Ok(Backend::Script),
            "script-expression" => Ok(Backend::ScriptExpression),
            _ => Err(UnknownBackend(s.to_string())),
        }
    }
}

/// Options for [`ExpressionBackend::compile`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileOptions {
    /// Build the executable form now instead of interpreting the source per call
    pub precompile: bool,
}

impl CompileOptions {
    /// Options requesting a prebuilt form
    pub fn precompiled() -> Self {
        Self { precompile: true }
    }
}

/// Backend-specific prepared form of an expression
#[derive(Debug)]
pub enum CompiledForm {
    /// Parsed tree for the path backend
    Tree(ExpressionNode),
    /// Bytecode for the compiled backend
    Bytecode(Bytecode),
    /// Script source, with the parsed script when precompiled
    Script(Option<rhai::AST>),
}

/// A compiled expression, shared read-only by every holder of its cache key
#[derive(Debug)]
pub struct CompiledExpression {
    backend: Backend,
    sandboxed: bool,
    source: Arc<str>,
    form: CompiledForm,
}

impl CompiledExpression {
    pub(crate) fn new(backend: Backend, sandboxed: bool, source: Arc<str>, form: CompiledForm) -> Self {
        Self {
            backend,
            sandboxed,
            source,
            form,
        }
    }

    /// Backend the expression was compiled for
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Whether sandboxing was requested at compile time
    pub fn is_sandboxed(&self) -> bool {
        self.sandboxed
    }

    /// Source text
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Prepared form
    pub fn form(&self) -> &CompiledForm {
        &self.form
    }

    /// Whether a script expression carries a parsed script
    pub fn is_precompiled(&self) -> bool {
        !matches!(self.form, CompiledForm::Script(None))
    }
}

/// Everything a backend needs for one evaluation
pub struct Invocation<'a> {
    /// Root, variables and utility functions
    pub context: &'a EvaluationContext,
    /// Resolvers of the selected sandbox mode
    pub resolvers: &'a ResolverSet,
    /// Deadline, operation and depth limits
    pub limits: EvaluationLimits,
    /// Whether the evaluation is sandboxed
    pub sandboxed: bool,
}

impl Invocation<'_> {
    /// The evaluation root
    pub fn root(&self) -> &Value {
        self.context.root()
    }
}

/// Compile and evaluate capability of one backend family
pub trait ExpressionBackend: Send + Sync {
    /// Backend this implementation serves
    fn backend(&self) -> Backend;

    /// Prepare `source` for evaluation
    fn compile(&self, source: &str, options: CompileOptions) -> Result<CompiledForm>;

    /// Evaluate a compiled expression
    fn evaluate(&self, expression: &CompiledExpression, invocation: &Invocation<'_>) -> EvalResult<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_names_round_trip() {
        for backend in Backend::ALL {
            assert_eq!(backend.as_str().parse::<Backend>().unwrap(), backend);
            let json = serde_json::to_string(&backend).unwrap();
            assert_eq!(json, format!("\"{backend}\""));
        }
        assert_eq!("Script_Expression".parse::<Backend>().unwrap(), Backend::ScriptExpression);
        assert!("ognl".parse::<Backend>().is_err());
    }
}
