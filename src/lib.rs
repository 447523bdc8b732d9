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

//! Sandboxed multi-backend expression evaluation
//!
//! Expressions are compiled once through a shared cache and evaluated by one
//! of four backends: the tree-walking path language, the same language
//! compiled to bytecode, and two Rhai script styles served by a bounded
//! engine pool. Sandboxed evaluation routes every type lookup and member
//! access through a versioned policy store. Batches of output expressions
//! accumulate into a single ordered result map.

pub mod ast;
pub mod backend;
pub mod batch;
pub mod cache;
pub mod compiler;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod metrics;
pub mod model;
pub mod parser;
pub mod registry;
pub mod sandbox;
pub mod script;

// Re-export main types
pub use backend::{Backend, CompileOptions, CompiledExpression};
pub use batch::Expression;
pub use cache::{CacheStats, ExpressionCache};
pub use config::{EngineConfig, EngineConfigBuilder};
pub use context::EvaluationContext;
pub use engine::{ExpressionEngine, ExpressionEngineBuilder, ExpressionSource};
pub use error::{EvalError, ExpressionError, Result};
pub use metrics::{InMemoryMetrics, LogMetrics, MetricsSink, NoopMetrics, Phase};
pub use model::{HostObject, HostType, TypeRegistry, Value, ValueMap, Visibility};
pub use parser::{ParseError, parse_expression as parse};
pub use registry::{ConfigResolver, FunctionRegistry, UtilityFunction};
pub use sandbox::{AccessFlags, MemberPolicy, Sandbox, SandboxPolicy};
pub use script::PoolStats;
