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

//! Type allow-list resolver
//!
//! Resolves type names for sandboxed `new` and `is` expressions. Only names
//! present in the policy's allow-list resolve. Unqualified names are retried
//! in the builtin namespace. Positive and negative answers are memoized in a
//! bounded LRU that is dropped whenever the sandbox version changes.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

use super::policy::{Sandbox, SandboxPolicy};
use crate::model::{BUILTIN_NAMESPACE, HostType, TypeRegistry};

/// Default number of memoized type names
pub const DEFAULT_MEMO_CAPACITY: usize = 256;

struct Memo {
    version: u64,
    entries: LruCache<String, Option<Arc<HostType>>>,
}

/// Allow-list backed type resolver with memoization
pub struct TypeAllowList {
    sandbox: Arc<Sandbox>,
    registry: Arc<TypeRegistry>,
    memo: Mutex<Memo>,
}

impl TypeAllowList {
    /// Create a resolver over the given policy store and registry
    pub fn new(sandbox: Arc<Sandbox>, registry: Arc<TypeRegistry>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let version = sandbox.version();
        Self {
            sandbox,
            registry,
            memo: Mutex::new(Memo {
                version,
                entries: LruCache::new(capacity),
            }),
        }
    }

    /// Resolve a type name if the allow-list permits it
    pub fn resolve(&self, name: &str) -> Option<Arc<HostType>> {
        let (policy, version) = self.sandbox.current();
        let mut memo = self.memo.lock();

        if memo.version != version {
            log::debug!(
                "Type memo invalidated: sandbox version {} -> {version}",
                memo.version
            );
            memo.entries.clear();
            memo.version = version;
        }

        if let Some(cached) = memo.entries.get(name) {
            return cached.clone();
        }

        let resolved = self.lookup(&policy, name);
        if resolved.is_none() {
            log::debug!("Type '{name}' is not on the sandbox allow-list");
        }
        memo.entries.put(name.to_string(), resolved.clone());
        resolved
    }

    fn lookup(&self, policy: &SandboxPolicy, name: &str) -> Option<Arc<HostType>> {
        let qualified = (!name.contains('.')).then(|| format!("{BUILTIN_NAMESPACE}.{name}"));
        std::iter::once(name)
            .chain(qualified.as_deref())
            .filter(|candidate| policy.allowed_types.contains(*candidate))
            .find_map(|candidate| self.registry.get(candidate))
    }

    /// Number of memoized names
    pub fn memo_len(&self) -> usize {
        self.memo.lock().entries.len()
    }
}

impl std::fmt::Debug for TypeAllowList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeAllowList")
            .field("memo_len", &self.memo_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<Sandbox>, TypeAllowList) {
        let registry = Arc::new(TypeRegistry::with_builtins());
        registry.register(HostType::builder("com.example.Forbidden").build());
        let sandbox = Arc::new(Sandbox::default());
        let resolver = TypeAllowList::new(Arc::clone(&sandbox), registry, 16);
        (sandbox, resolver)
    }

    #[test]
    fn test_builtin_namespace_retry() {
        let (_, resolver) = setup();
        assert_eq!(resolver.resolve("String").unwrap().name(), "lang.String");
        assert_eq!(resolver.resolve("lang.Map").unwrap().name(), "lang.Map");
    }

    #[test]
    fn test_negative_memo_dropped_on_allow_list_change() {
        let (sandbox, resolver) = setup();
        assert!(resolver.resolve("com.example.Forbidden").is_none());
        assert_eq!(resolver.memo_len(), 1);

        sandbox.allow_type("com.example.Forbidden");
        assert_eq!(
            resolver.resolve("com.example.Forbidden").unwrap().name(),
            "com.example.Forbidden"
        );
    }

    #[test]
    fn test_replacing_allow_list_revokes() {
        let (sandbox, resolver) = setup();
        assert!(resolver.resolve("String").is_some());
        sandbox.set_allowed_types(["lang.Map"]);
        assert!(resolver.resolve("String").is_none());
        assert!(resolver.resolve("Map").is_some());
    }

    #[test]
    fn test_allowed_but_unregistered() {
        let (sandbox, resolver) = setup();
        sandbox.allow_type("com.example.Missing");
        assert!(resolver.resolve("com.example.Missing").is_none());
    }
}
