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

//! Builtin utility functions

mod aggregate;
mod join;

pub use aggregate::{AvgFunction, CountFunction, MaxFunction, MinFunction, SumFunction};
pub(crate) use aggregate::compare_values;
pub use join::JoinFunction;

use crate::registry::function::FunctionRegistry;

/// Register the aggregate and string helpers
pub fn register_builtin_functions(registry: &mut FunctionRegistry) {
    registry.register(SumFunction);
    registry.register(AvgFunction);
    registry.register(MinFunction);
    registry.register(MaxFunction);
    registry.register(CountFunction);
    registry.register(JoinFunction);
}
