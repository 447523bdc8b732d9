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

//! Utility function registry
//!
//! Provides the [`UtilityFunction`] trait, the [`FunctionRegistry`] shared
//! by evaluation contexts, the builtin aggregate helpers and the
//! configuration placeholder resolver.

pub mod config;
pub mod function;
pub mod functions;

pub use config::{ConfigResolver, EnvConfigResolver, MapConfigResolver, ResolveConfigFunction};
pub use function::{FunctionError, FunctionRegistry, FunctionResult, UtilityFunction};

use std::sync::Arc;

/// Create a registry with the builtin helpers and `resolveConfig`
pub fn create_standard_registry(config: Arc<dyn ConfigResolver>) -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    functions::register_builtin_functions(&mut registry);
    registry.register(ResolveConfigFunction::new(config));
    registry
}
