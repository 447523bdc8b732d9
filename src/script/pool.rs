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

//! Bounded per-backend pool of script engines
//!
//! Engines are created lazily up to the configured maximum and reused through
//! an idle queue. Once the maximum is reached, further concurrent demand is
//! served by overflow engines that are dropped on release. Acquisition never
//! waits for capacity.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};

use super::engine::ScriptEngine;
use crate::backend::Backend;
use crate::registry::FunctionRegistry;

/// Default number of pooled engines per backend
pub const DEFAULT_MAX_ENGINES: usize = 8;

/// Builds a raw interpreter for a backend
pub type EngineFactory = Arc<dyn Fn() -> rhai::Engine + Send + Sync>;

/// Snapshot of one backend's pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Engines waiting in the idle queue
    pub idle: usize,
    /// Engines tracked as pool-owned
    pub owned: usize,
    /// Pool-owned engines created since the last reset
    pub live: usize,
    /// Maximum pool-owned engines
    pub max: usize,
    /// Acquisitions served from the idle queue
    pub hits: u64,
    /// Acquisitions that created a pool-owned engine
    pub misses: u64,
    /// Acquisitions served by an overflow engine
    pub overflows: u64,
}

impl PoolStats {
    /// Fraction of acquisitions served from the idle queue
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.overflows;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct BackendPool {
    backend: Backend,
    idle: Mutex<VecDeque<ScriptEngine>>,
    owned: DashSet<u64>,
    live: AtomicUsize,
    max: AtomicUsize,
    factory: RwLock<Option<EngineFactory>>,
    hits: AtomicU64,
    misses: AtomicU64,
    overflows: AtomicU64,
}

impl BackendPool {
    fn new(backend: Backend, max: usize) -> Self {
        Self {
            backend,
            idle: Mutex::new(VecDeque::new()),
            owned: DashSet::new(),
            live: AtomicUsize::new(0),
            max: AtomicUsize::new(max),
            factory: RwLock::new(None),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
        }
    }

    /// Claim one pool slot if the pool is below its maximum
    fn reserve_slot(&self) -> bool {
        let max = self.max.load(Ordering::Acquire);
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < max).then_some(live + 1)
            })
            .is_ok()
    }

    fn raw_engine(&self) -> rhai::Engine {
        match self.factory.read().as_ref() {
            Some(factory) => factory(),
            None => rhai::Engine::new(),
        }
    }

    fn release(&self, engine: ScriptEngine) {
        if self.owned.contains(&engine.id()) {
            self.idle.lock().push_back(engine);
        } else {
            log::trace!(
                "Discarding overflow engine {} for {}",
                engine.id(),
                self.backend
            );
        }
    }

    fn reset(&self) {
        self.idle.lock().clear();
        self.owned.clear();
        self.live.store(0, Ordering::Release);
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.lock().len(),
            owned: self.owned.len(),
            live: self.live.load(Ordering::Acquire),
            max: self.max.load(Ordering::Acquire),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
        }
    }
}

/// Pool of script engines keyed by backend
pub struct EnginePool {
    pools: DashMap<Backend, Arc<BackendPool>>,
    default_max: AtomicUsize,
    functions: RwLock<Arc<FunctionRegistry>>,
    max_depth: usize,
}

impl EnginePool {
    /// Create a pool whose engines expose `functions`
    pub fn new(functions: Arc<FunctionRegistry>, default_max: usize, max_depth: usize) -> Self {
        Self {
            pools: DashMap::new(),
            default_max: AtomicUsize::new(default_max),
            functions: RwLock::new(functions),
            max_depth,
        }
    }

    fn pool(&self, backend: Backend) -> Arc<BackendPool> {
        self.pools
            .entry(backend)
            .or_insert_with(|| {
                Arc::new(BackendPool::new(
                    backend,
                    self.default_max.load(Ordering::Acquire),
                ))
            })
            .clone()
    }

    fn build(&self, pool: &BackendPool) -> ScriptEngine {
        let functions = self.functions.read().clone();
        ScriptEngine::new(pool.raw_engine(), &functions, self.max_depth)
    }

    /// Take an engine, creating one when the idle queue is empty
    ///
    /// The returned guard gives the engine back on drop.
    pub fn acquire(&self, backend: Backend) -> PooledEngine {
        let pool = self.pool(backend);

        let idle = pool.idle.lock().pop_front();
        if let Some(engine) = idle {
            pool.hits.fetch_add(1, Ordering::Relaxed);
            return PooledEngine::new(engine, pool, true);
        }

        if pool.reserve_slot() {
            let engine = self.build(&pool);
            pool.owned.insert(engine.id());
            pool.misses.fetch_add(1, Ordering::Relaxed);
            log::debug!("Created pooled engine {} for {backend}", engine.id());
            return PooledEngine::new(engine, pool, true);
        }

        let engine = self.build(&pool);
        pool.overflows.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Engine pool for {backend} exhausted at {}, using overflow engine {}",
            pool.max.load(Ordering::Acquire),
            engine.id()
        );
        PooledEngine::new(engine, pool, false)
    }

    /// Drop all idle and owned tracking for a backend
    ///
    /// Engines checked out at the time are discarded when released.
    pub fn reset(&self, backend: Backend) {
        if let Some(pool) = self.pools.get(&backend) {
            pool.reset();
            log::debug!("Reset engine pool for {backend}");
        }
    }

    /// Reset every backend
    pub fn reset_all(&self) {
        for pool in self.pools.iter() {
            pool.reset();
        }
    }

    /// Set the maximum number of pooled engines for one backend
    pub fn set_max_engines(&self, backend: Backend, max: usize) {
        let pool = self.pool(backend);
        pool.max.store(max, Ordering::Release);
        pool.reset();
    }

    /// Set the maximum for every backend, including ones not created yet
    pub fn set_default_max_engines(&self, max: usize) {
        self.default_max.store(max, Ordering::Release);
        for pool in self.pools.iter() {
            pool.max.store(max, Ordering::Release);
            pool.reset();
        }
    }

    /// Install (or clear) the raw engine factory for a backend
    pub fn set_factory(&self, backend: Backend, factory: Option<EngineFactory>) {
        let pool = self.pool(backend);
        *pool.factory.write() = factory;
        pool.reset();
    }

    /// Replace the utility functions exposed to new engines
    pub fn set_functions(&self, functions: Arc<FunctionRegistry>) {
        *self.functions.write() = functions;
        self.reset_all();
    }

    /// Snapshot of a backend's pool
    pub fn stats(&self, backend: Backend) -> PoolStats {
        self.pools
            .get(&backend)
            .map(|pool| pool.stats())
            .unwrap_or_else(|| PoolStats {
                max: self.default_max.load(Ordering::Acquire),
                ..PoolStats::default()
            })
    }
}

impl fmt::Debug for EnginePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnginePool")
            .field("backends", &self.pools.len())
            .field("default_max", &self.default_max.load(Ordering::Relaxed))
            .finish()
    }
}

/// Checked-out engine, returned to its pool on drop
pub struct PooledEngine {
    engine: Option<ScriptEngine>,
    pool: Arc<BackendPool>,
    pool_owned: bool,
}

impl PooledEngine {
    fn new(engine: ScriptEngine, pool: Arc<BackendPool>, pool_owned: bool) -> Self {
        Self {
            engine: Some(engine),
            pool,
            pool_owned,
        }
    }

    /// Whether the engine was tracked by the pool when acquired
    pub fn is_pool_owned(&self) -> bool {
        self.pool_owned
    }
}

impl Deref for PooledEngine {
    type Target = ScriptEngine;

    fn deref(&self) -> &ScriptEngine {
        // Only taken in `drop`
        match &self.engine {
            Some(engine) => engine,
            None => unreachable!("engine already released"),
        }
    }
}

impl Drop for PooledEngine {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            self.pool.release(engine);
        }
    }
}

impl fmt::Debug for PooledEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledEngine")
            .field("engine", &self.engine)
            .field("pool_owned", &self.pool_owned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn pool(max: usize) -> EnginePool {
        EnginePool::new(Arc::new(FunctionRegistry::new()), max, 32)
    }

    #[test]
    fn test_bounded_with_overflow() {
        let pool = pool(2);
        let first = pool.acquire(Backend::Script);
        let second = pool.acquire(Backend::Script);
        let third = pool.acquire(Backend::Script);

        assert!(first.is_pool_owned());
        assert!(second.is_pool_owned());
        assert!(!third.is_pool_owned());

        let stats = pool.stats(Backend::Script);
        assert_eq!(stats.owned, 2);
        assert_eq!(stats.live, 2);
        assert_eq!(stats.overflows, 1);

        drop(third);
        assert_eq!(pool.stats(Backend::Script).idle, 0);

        let reused_id = first.id();
        drop(first);
        assert_eq!(pool.stats(Backend::Script).idle, 1);

        let next = pool.acquire(Backend::Script);
        assert_eq!(next.id(), reused_id);
        assert!(next.is_pool_owned());
        assert_eq!(pool.stats(Backend::Script).hits, 1);
        drop(second);
    }

    #[test]
    fn test_backends_have_separate_pools() {
        let pool = pool(1);
        let script = pool.acquire(Backend::Script);
        let expression = pool.acquire(Backend::ScriptExpression);
        assert!(script.is_pool_owned());
        assert!(expression.is_pool_owned());
    }

    #[test]
    fn test_reset_discards_checked_out_engines() {
        let pool = pool(2);
        let engine = pool.acquire(Backend::Script);
        pool.reset(Backend::Script);
        drop(engine);

        let stats = pool.stats(Backend::Script);
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.owned, 0);
        assert_eq!(stats.live, 0);
    }

    #[test]
    fn test_factory_used_for_new_engines() {
        let pool = pool(2);
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        pool.set_factory(
            Backend::Script,
            Some(Arc::new(move || {
                flag.store(true, Ordering::SeqCst);
                rhai::Engine::new()
            })),
        );
        let _engine = pool.acquire(Backend::Script);
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_hit_rate() {
        let stats = PoolStats {
            hits: 3,
            misses: 1,
            ..PoolStats::default()
        };
        assert_eq!(stats.hit_rate(), 0.75);
        assert_eq!(PoolStats::default().hit_rate(), 0.0);
    }
}
