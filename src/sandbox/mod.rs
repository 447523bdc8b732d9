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

//! Sandbox policy layer
//!
//! A [`Sandbox`] holds the live policy: the type allow-list, per-kind member
//! rules and visibility flags. Every change bumps its version, which the
//! [`TypeAllowList`] memo watches. Resolver sets wire the policy into
//! evaluation.

pub mod access_gate;
pub mod policy;
pub mod resolvers;
pub mod type_resolver;

pub use access_gate::{AccessGuard, MemberAccessGate};
pub use policy::{
    AccessFlags, MemberPolicy, MemberPolicyConfig, PolicyError, RuleAction, Sandbox, SandboxPolicy,
};
pub use resolvers::{
    ConstructorResolver, MethodResolver, OpenTypeResolver, PropertyResolver, ResolverSet,
    TypeResolver,
};
pub use type_resolver::{DEFAULT_MEMO_CAPACITY, TypeAllowList};
