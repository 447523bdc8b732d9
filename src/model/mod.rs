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

//! Data model for expression evaluation
//!
//! This module provides the dynamic value type, the host reflection model
//! and the path utilities used to place batch results.

mod builtins;
pub mod host;
pub mod path;
pub mod value;

pub use host::{
    BUILTIN_NAMESPACE, HostObject, HostRef, HostType, HostTypeBuilder, Member, MemberKind,
    TypeRegistry, Visibility,
};
pub use path::{OutputPath, PathError, assign_at_path, to_map};
pub use value::{Value, ValueMap};
