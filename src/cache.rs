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

//! Compiled-expression cache
//!
//! Entries are keyed by backend, sandbox flag and source text. A failed
//! compile is stored like a successful one, so a broken expression is not
//! recompiled until the cache is cleared. Concurrent callers for a missing
//! key may each compile, but only the first stored outcome is kept and
//! every caller observes it.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;

use crate::backend::{Backend, CompiledExpression};
use crate::error::Result;

/// Default number of cached expressions
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Identity of a cached compile
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Backend compiled for
    pub backend: Backend,
    /// Sandbox flag at compile time
    pub sandboxed: bool,
    /// Source text
    pub source: Arc<str>,
}

impl CacheKey {
    /// Build a key
    pub fn new(backend: Backend, sandboxed: bool, source: impl Into<Arc<str>>) -> Self {
        Self {
            backend,
            sandboxed,
            source: source.into(),
        }
    }
}

/// Result stored for a key
pub type CompileOutcome = Result<Arc<CompiledExpression>>;

struct CacheEntry {
    outcome: CompileOutcome,
    last_used: AtomicU64,
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that compiled
    pub misses: u64,
    /// Outcomes stored
    pub insertions: u64,
    /// Entries removed to respect the capacity
    pub evictions: u64,
    /// Failed compiles stored
    pub failures: u64,
    /// Current number of entries
    pub size: usize,
    /// Maximum number of entries
    pub capacity: usize,
}

impl CacheStats {
    /// Fraction of lookups answered from the cache
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
    failures: AtomicU64,
}

/// Concurrent least-recently-used cache of compile outcomes
pub struct ExpressionCache {
    entries: DashMap<CacheKey, Arc<CacheEntry>>,
    capacity: AtomicUsize,
    clock: AtomicU64,
    counters: Counters,
}

impl ExpressionCache {
    /// Create a cache holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: AtomicUsize::new(capacity.max(1)),
            clock: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up a stored outcome without compiling
    pub fn get(&self, key: &CacheKey) -> Option<CompileOutcome> {
        let entry = self.entries.get(key).map(|entry| Arc::clone(entry.value()))?;
        entry.last_used.store(self.tick(), Ordering::Relaxed);
        Some(entry.outcome.clone())
    }

    /// Return the stored outcome for `key`, compiling and storing it if absent
    pub fn get_or_compile<F>(&self, key: CacheKey, compile: F) -> CompileOutcome
    where
        F: FnOnce() -> Result<CompiledExpression>,
    {
        if let Some(outcome) = self.get(&key) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return outcome;
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        // Compile without holding a shard lock
        let outcome: CompileOutcome = compile().map(Arc::new);
        if let Err(err) = &outcome {
            log::debug!(
                "Caching failed {} compile of '{}': {err}",
                key.backend,
                key.source
            );
        }

        let fresh = Arc::new(CacheEntry {
            outcome,
            last_used: AtomicU64::new(self.tick()),
        });
        let stored = {
            let entry = self.entries.entry(key).or_insert_with(|| {
                self.counters.insertions.fetch_add(1, Ordering::Relaxed);
                if fresh.outcome.is_err() {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                }
                Arc::clone(&fresh)
            });
            Arc::clone(entry.value())
        };

        self.evict_if_needed();
        stored.outcome.clone()
    }

    /// Remove the least recently used fifth once over capacity
    fn evict_if_needed(&self) {
        let capacity = self.capacity.load(Ordering::Relaxed);
        let len = self.entries.len();
        if len <= capacity {
            return;
        }

        let mut ages: Vec<(CacheKey, u64)> = self
            .entries
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.value().last_used.load(Ordering::Relaxed),
                )
            })
            .collect();
        ages.sort_unstable_by_key(|(_, last_used)| *last_used);

        let excess = len - capacity;
        let count = excess.max(capacity / 5).min(ages.len());
        let mut evicted = 0u64;
        for (key, _) in ages.into_iter().take(count) {
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
        log::debug!("Evicted {evicted} cached expressions (capacity {capacity})");
    }

    /// Drop every entry, including cached failures
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Change the capacity, evicting immediately when shrinking
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity.max(1), Ordering::Relaxed);
        self.evict_if_needed();
    }

    /// Number of stored outcomes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            insertions: self.counters.insertions.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            size: self.entries.len(),
            capacity: self.capacity.load(Ordering::Relaxed),
        }
    }
}

impl Default for ExpressionCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl fmt::Debug for ExpressionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpressionCache")
            .field("size", &self.entries.len())
            .field("capacity", &self.capacity.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CompiledForm;
    use crate::error::ExpressionError;
    use std::sync::atomic::AtomicUsize;

    fn compiled(source: &str) -> CompiledExpression {
        CompiledExpression::new(Backend::Script, false, Arc::from(source), CompiledForm::Script(None))
    }

    #[test]
    fn test_same_key_compiles_once() {
        let cache = ExpressionCache::new(8);
        let compiles = AtomicUsize::new(0);
        let compile = || {
            compiles.fetch_add(1, Ordering::SeqCst);
            Ok(compiled("1 + 1"))
        };

        let first = cache.get_or_compile(CacheKey::new(Backend::Script, false, "1 + 1"), compile).unwrap();
        let second = cache
            .get_or_compile(CacheKey::new(Backend::Script, false, "1 + 1"), || {
                compiles.fetch_add(1, Ordering::SeqCst);
                Ok(compiled("1 + 1"))
            })
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(compiles.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_sandbox_flag_is_part_of_key() {
        let cache = ExpressionCache::new(8);
        cache.get_or_compile(CacheKey::new(Backend::Script, false, "x"), || Ok(compiled("x"))).unwrap();
        cache.get_or_compile(CacheKey::new(Backend::Script, true, "x"), || Ok(compiled("x"))).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_failures_are_cached_until_clear() {
        let cache = ExpressionCache::new(8);
        let key = CacheKey::new(Backend::Path, false, "1 +");
        let attempts = AtomicUsize::new(0);
        let fail = || {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(ExpressionError::compile(Backend::Path, "unexpected end"))
        };

        let first = cache.get_or_compile(key.clone(), fail);
        let second = cache.get_or_compile(key.clone(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(ExpressionError::compile(Backend::Path, "unexpected end"))
        });
        assert!(first.is_err());
        assert_eq!(first.unwrap_err(), second.unwrap_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().failures, 1);

        cache.clear();
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = ExpressionCache::new(5);
        for i in 0..5 {
            let source = format!("e{i}");
            cache
                .get_or_compile(CacheKey::new(Backend::Script, false, source.as_str()), || {
                    Ok(compiled(&source))
                })
                .unwrap();
        }
        // Refresh e0 so e1 is the oldest
        assert!(cache.get(&CacheKey::new(Backend::Script, false, "e0")).is_some());
        cache
            .get_or_compile(CacheKey::new(Backend::Script, false, "e5"), || Ok(compiled("e5")))
            .unwrap();

        assert_eq!(cache.len(), 5);
        assert!(cache.get(&CacheKey::new(Backend::Script, false, "e0")).is_some());
        assert!(cache.get(&CacheKey::new(Backend::Script, false, "e1")).is_none());
        assert_eq!(cache.stats().evictions, 1);
    }
}
