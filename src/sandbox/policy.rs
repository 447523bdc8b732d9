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

//! Sandbox policy and its versioned store
//!
//! The policy is process-wide configuration that changes rarely. It is held
//! behind a read/write lock together with a version counter; anything that
//! memoizes decisions derived from the policy compares versions and drops its
//! state when they differ.

use glob::Pattern;
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::model::{MemberKind, Visibility};

/// Errors raised while building a policy
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    /// A member pattern is not a valid glob
    #[error("Invalid member pattern '{pattern}': {message}")]
    InvalidPattern {
        /// Pattern as written
        pattern: String,
        /// Glob parser message
        message: String,
    },
}

/// Decision applied when no rule matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Permit the access
    Allow,
    /// Refuse the access
    #[default]
    Deny,
}

/// Serializable form of a [`MemberPolicy`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemberPolicyConfig {
    /// Decision when no pattern matches
    pub default: RuleAction,
    /// Patterns over `Type#member` that are permitted
    pub allow: Vec<String>,
    /// Patterns over `Type#member` that are refused; deny wins over allow
    pub deny: Vec<String>,
}

/// Allow/deny rules for one kind of member
///
/// Patterns are globs matched against `Owner#member`, for example
/// `acme.*#get*` or `lang.String#*`. A matching deny pattern always wins;
/// otherwise a matching allow pattern permits; otherwise the default applies.
#[derive(Debug, Clone)]
pub struct MemberPolicy {
    allow: Vec<Pattern>,
    deny: Vec<Pattern>,
    default: RuleAction,
}

impl MemberPolicy {
    /// Policy that permits everything not explicitly denied
    pub fn allow_all() -> Self {
        Self {
            allow: Vec::new(),
            deny: Vec::new(),
            default: RuleAction::Allow,
        }
    }

    /// Policy that refuses everything not explicitly allowed
    pub fn deny_all() -> Self {
        Self {
            allow: Vec::new(),
            deny: Vec::new(),
            default: RuleAction::Deny,
        }
    }

    /// Add an allow pattern
    pub fn allow(mut self, pattern: &str) -> Result<Self, PolicyError> {
        self.allow.push(compile_pattern(pattern)?);
        Ok(self)
    }

    /// Add a deny pattern
    pub fn deny(mut self, pattern: &str) -> Result<Self, PolicyError> {
        self.deny.push(compile_pattern(pattern)?);
        Ok(self)
    }

    /// Build from the serializable form
    pub fn from_config(config: &MemberPolicyConfig) -> Result<Self, PolicyError> {
        let mut policy = Self {
            allow: Vec::with_capacity(config.allow.len()),
            deny: Vec::with_capacity(config.deny.len()),
            default: config.default,
        };
        for pattern in &config.allow {
            policy.allow.push(compile_pattern(pattern)?);
        }
        for pattern in &config.deny {
            policy.deny.push(compile_pattern(pattern)?);
        }
        Ok(policy)
    }

    /// Whether access to `Owner#member` is permitted
    pub fn permits(&self, qualified: &str) -> bool {
        if self.deny.iter().any(|p| p.matches(qualified)) {
            return false;
        }
        if self.allow.iter().any(|p| p.matches(qualified)) {
            return true;
        }
        self.default == RuleAction::Allow
    }
}

fn compile_pattern(pattern: &str) -> Result<Pattern, PolicyError> {
    Pattern::new(pattern).map_err(|e| PolicyError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.msg.to_string(),
    })
}

/// Which non-public visibilities may be accessed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessFlags {
    /// Permit private members
    pub allow_private: bool,
    /// Permit protected members
    pub allow_protected: bool,
    /// Permit package-private members
    pub allow_package: bool,
}

impl AccessFlags {
    /// Every visibility permitted
    pub fn all() -> Self {
        Self {
            allow_private: true,
            allow_protected: true,
            allow_package: true,
        }
    }

    /// Public members only
    pub fn public_only() -> Self {
        Self::default()
    }

    /// Whether a member of this visibility may be accessed
    pub fn permits(&self, visibility: Visibility) -> bool {
        match visibility {
            Visibility::Public => true,
            Visibility::Protected => self.allow_protected,
            Visibility::Package => self.allow_package,
            Visibility::Private => self.allow_private,
        }
    }
}

/// Complete sandbox policy
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    /// Qualified type names that sandboxed type lookups may resolve
    pub allowed_types: FxHashSet<String>,
    /// Rules for property reads
    pub properties: MemberPolicy,
    /// Rules for method calls
    pub methods: MemberPolicy,
    /// Rules for constructor invocations
    pub constructors: MemberPolicy,
    /// Visibility flags consulted by the member access gate
    pub access: AccessFlags,
}

impl SandboxPolicy {
    /// Builtin value types every sandbox may name
    pub const DEFAULT_ALLOWED_TYPES: [&'static str; 6] = [
        "lang.String",
        "lang.Integer",
        "lang.Double",
        "lang.Boolean",
        "lang.List",
        "lang.Map",
    ];

    /// Policy that only permits public members of the builtin types
    pub fn restrictive() -> Self {
        Self {
            allowed_types: Self::DEFAULT_ALLOWED_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            properties: MemberPolicy::allow_all(),
            methods: builtin_only("lang.*#*"),
            constructors: builtin_only("lang.*#new"),
            access: AccessFlags::public_only(),
        }
    }

    /// Rules for a given member kind
    pub fn rules_for(&self, kind: MemberKind) -> &MemberPolicy {
        match kind {
            MemberKind::Property => &self.properties,
            MemberKind::Method => &self.methods,
            MemberKind::Constructor => &self.constructors,
        }
    }
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self::restrictive()
    }
}

fn builtin_only(pattern: &str) -> MemberPolicy {
    MemberPolicy {
        allow: Pattern::new(pattern).into_iter().collect(),
        deny: Vec::new(),
        default: RuleAction::Deny,
    }
}

/// Versioned holder of the active [`SandboxPolicy`]
#[derive(Debug)]
pub struct Sandbox {
    policy: RwLock<Arc<SandboxPolicy>>,
    version: AtomicU64,
}

impl Sandbox {
    /// Create a store holding `policy`
    pub fn new(policy: SandboxPolicy) -> Self {
        Self {
            policy: RwLock::new(Arc::new(policy)),
            version: AtomicU64::new(0),
        }
    }

    /// Current policy
    pub fn snapshot(&self) -> Arc<SandboxPolicy> {
        Arc::clone(&self.policy.read())
    }

    /// Current policy together with its version, read consistently
    pub fn current(&self) -> (Arc<SandboxPolicy>, u64) {
        let guard = self.policy.read();
        (Arc::clone(&guard), self.version.load(Ordering::Acquire))
    }

    /// Current version
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Apply a change and publish it as a new version
    pub fn update(&self, change: impl FnOnce(&mut SandboxPolicy)) {
        let mut guard = self.policy.write();
        let mut next = SandboxPolicy::clone(&guard);
        change(&mut next);
        *guard = Arc::new(next);
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        log::debug!("Sandbox policy updated to version {version}");
    }

    /// Invalidate dependent state without changing the policy
    pub fn touch(&self) {
        self.update(|_| {});
    }

    /// Replace the whole policy
    pub fn replace(&self, policy: SandboxPolicy) {
        self.update(|current| *current = policy);
    }

    /// Replace the type allow-list
    pub fn set_allowed_types<I, S>(&self, types: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let types: FxHashSet<String> = types.into_iter().map(Into::into).collect();
        self.update(|policy| policy.allowed_types = types);
    }

    /// Add a single type to the allow-list
    pub fn allow_type(&self, name: impl Into<String>) {
        let name = name.into();
        self.update(|policy| {
            policy.allowed_types.insert(name);
        });
    }

    /// Replace the property rules
    pub fn set_property_policy(&self, rules: MemberPolicy) {
        self.update(|policy| policy.properties = rules);
    }

    /// Replace the method rules
    pub fn set_method_policy(&self, rules: MemberPolicy) {
        self.update(|policy| policy.methods = rules);
    }

    /// Replace the constructor rules
    pub fn set_constructor_policy(&self, rules: MemberPolicy) {
        self.update(|policy| policy.constructors = rules);
    }

    /// Replace the visibility flags
    pub fn set_access_flags(&self, access: AccessFlags) {
        self.update(|policy| policy.access = access);
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(SandboxPolicy::default())
    }
}
