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

//! Evaluation orchestrator
//!
//! [`ExpressionEngine`] owns the compiled-expression cache, the sandbox
//! policy store, the resolver sets of each evaluation mode and the script
//! engine pool. It compiles through the cache, dispatches to the backend
//! named by the expression, times both phases and turns backend failures
//! into [`ExpressionError`]s.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::backend::{Backend, CompileOptions, CompiledExpression, ExpressionBackend, Invocation};
use crate::cache::{CacheKey, CacheStats, ExpressionCache};
use crate::compiler::{CompiledBackend, CompilerConfig};
use crate::config::EngineConfig;
use crate::context::EvaluationContext;
use crate::error::{ExpressionError, Result};
use crate::evaluator::PathBackend;
use crate::metrics::{EXPRESSION_CATEGORY, LogMetrics, MetricsSink, Phase, Timer};
use crate::model::{HostType, TypeRegistry, Value};
use crate::registry::{
    ConfigResolver, FunctionRegistry, MapConfigResolver, UtilityFunction, create_standard_registry,
};
use crate::sandbox::{
    AccessFlags, MemberPolicy, ResolverSet, Sandbox, SandboxPolicy, TypeAllowList,
};
use crate::script::{EngineFactory, EnginePool, PoolStats, ScriptBackend};

/// Expression to evaluate: source text or an already compiled expression
#[derive(Debug, Clone)]
pub enum ExpressionSource<'a> {
    /// Source text, compiled through the cache before evaluation
    Text {
        /// Source text
        source: &'a str,
        /// Backend, or the engine default
        backend: Option<Backend>,
    },
    /// Compiled expression
    Compiled(Arc<CompiledExpression>),
}

impl<'a> ExpressionSource<'a> {
    /// Source text for a given backend
    pub fn text(source: &'a str, backend: Backend) -> Self {
        Self::Text {
            source,
            backend: Some(backend),
        }
    }
}

impl<'a> From<&'a str> for ExpressionSource<'a> {
    fn from(source: &'a str) -> Self {
        Self::Text {
            source,
            backend: None,
        }
    }
}

impl From<Arc<CompiledExpression>> for ExpressionSource<'_> {
    fn from(expression: Arc<CompiledExpression>) -> Self {
        Self::Compiled(expression)
    }
}

impl From<&Arc<CompiledExpression>> for ExpressionSource<'_> {
    fn from(expression: &Arc<CompiledExpression>) -> Self {
        Self::Compiled(Arc::clone(expression))
    }
}

/// Sandboxed multi-backend expression engine
pub struct ExpressionEngine {
    config: RwLock<EngineConfig>,
    sandbox: Arc<Sandbox>,
    registry: Arc<TypeRegistry>,
    functions: Arc<FunctionRegistry>,
    allow_list: Arc<TypeAllowList>,
    open: ResolverSet,
    visibility: ResolverSet,
    policy: ResolverSet,
    cache: ExpressionCache,
    pool: Arc<EnginePool>,
    path: PathBackend,
    compiled: CompiledBackend,
    script: ScriptBackend,
    script_expression: ScriptBackend,
    metrics: Arc<dyn MetricsSink>,
}

impl ExpressionEngine {
    /// Engine with the default configuration
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Engine with a given configuration
    pub fn with_config(config: EngineConfig) -> Self {
        Self::builder().config(config).build()
    }

    /// Start building an engine
    pub fn builder() -> ExpressionEngineBuilder {
        ExpressionEngineBuilder::default()
    }

    // Compilation

    /// Compile `source` for `backend`, returning the cached outcome when present
    ///
    /// Failed compiles are cached too and returned until [`clear_cache`](Self::clear_cache).
    pub fn compile(
        &self,
        source: &str,
        backend: Backend,
        sandbox: bool,
        options: CompileOptions,
    ) -> Result<Arc<CompiledExpression>> {
        if sandbox && !self.config.read().sandboxing_enabled {
            return Err(ExpressionError::SandboxingDisabled);
        }
        if source.trim().is_empty() {
            return Err(ExpressionError::validation("source", "must not be empty"));
        }

        let key = CacheKey::new(backend, sandbox, source);
        self.cache.get_or_compile(key, || {
            let timer = self.timer(backend, Phase::Compile);
            let result = self
                .backend(backend)
                .compile(source, options)
                .map(|form| CompiledExpression::new(backend, sandbox, Arc::from(source), form));
            let elapsed = timer.stop();
            log::debug!(
                "Compiled {backend} expression in {}us (sandboxed: {sandbox})",
                elapsed.as_micros()
            );
            result
        })
    }

    // Evaluation

    /// Evaluate, logging and swallowing failures
    ///
    /// With `verbose`, failures are logged at error level together with the
    /// root, except reads through null intermediates unless missing
    /// properties are logged. Without it, failures are logged at debug level.
    pub fn evaluate<'a>(
        &self,
        expression: impl Into<ExpressionSource<'a>>,
        root: Value,
        sandbox: bool,
        verbose: bool,
    ) -> Option<Value> {
        let context = self.context(root);
        match self.evaluate_in(expression, &context, sandbox) {
            Ok(value) => Some(value),
            Err(err) => {
                self.report(&err, context.root(), verbose);
                None
            }
        }
    }

    /// Evaluate, propagating failures
    pub fn evaluate_with_exception<'a>(
        &self,
        expression: impl Into<ExpressionSource<'a>>,
        root: Value,
        sandbox: bool,
    ) -> Result<Value> {
        self.evaluate_in(expression, &self.context(root), sandbox)
    }

    /// Evaluate against a prepared context
    ///
    /// The evaluation is sandboxed when `sandbox` is requested or the
    /// expression was compiled sandboxed.
    pub fn evaluate_in<'a>(
        &self,
        expression: impl Into<ExpressionSource<'a>>,
        context: &EvaluationContext,
        sandbox: bool,
    ) -> Result<Value> {
        if sandbox && !self.config.read().sandboxing_enabled {
            return Err(ExpressionError::SandboxingDisabled);
        }

        let compiled = match expression.into() {
            ExpressionSource::Compiled(compiled) => compiled,
            ExpressionSource::Text { source, backend } => {
                let backend = backend.unwrap_or_else(|| self.default_backend());
                self.compile(source, backend, sandbox, CompileOptions::default())?
            }
        };

        let sandboxed = sandbox || compiled.is_sandboxed();
        let (limits, sandboxing_enabled) = {
            let config = self.config.read();
            (config.limits(), config.sandboxing_enabled)
        };
        if sandboxed && !sandboxing_enabled {
            return Err(ExpressionError::SandboxingDisabled);
        }

        let backend = compiled.backend();
        let invocation = Invocation {
            context,
            resolvers: self.resolvers(backend, sandboxed),
            limits,
            sandboxed,
        };

        let _timer = self.timer(backend, Phase::Evaluate);
        self.backend(backend)
            .evaluate(&compiled, &invocation)
            .map_err(|cause| ExpressionError::from_eval(backend, cause))
    }

    /// Context over `root` with the engine's utility functions
    pub fn context(&self, root: Value) -> EvaluationContext {
        EvaluationContext::new(root, Arc::clone(&self.functions))
    }

    pub(crate) fn report(&self, err: &ExpressionError, root: &Value, verbose: bool) {
        if !verbose {
            log::debug!("Expression evaluation failed: {err}");
            return;
        }
        if err.is_null_intermediate() && !self.config.read().log_missing_properties {
            log::debug!("Expression read through a null value: {err}");
            return;
        }
        log::error!("Expression evaluation failed: {err}; root: {root}");
    }

    fn backend(&self, backend: Backend) -> &dyn ExpressionBackend {
        match backend {
            Backend::Path => &self.path,
            Backend::Compiled => &self.compiled,
            Backend::Script => &self.script,
            Backend::ScriptExpression => &self.script_expression,
        }
    }

    fn resolvers(&self, backend: Backend, sandboxed: bool) -> &ResolverSet {
        match (sandboxed, backend) {
            (false, _) => &self.open,
            (true, Backend::Compiled) => &self.policy,
            (true, _) => &self.visibility,
        }
    }

    fn timer(&self, backend: Backend, phase: Phase) -> Timer {
        Timer::start(Arc::clone(&self.metrics), EXPRESSION_CATEGORY, backend, phase)
    }

    // Administration

    /// Snapshot of the configuration
    pub fn config(&self) -> EngineConfig {
        self.config.read().clone()
    }

    /// Backend used for source text that does not name one
    pub fn default_backend(&self) -> Backend {
        self.config.read().default_backend
    }

    /// Sandbox mode callers use when they do not choose one
    pub fn default_sandbox(&self) -> bool {
        self.config.read().default_sandbox
    }

    /// Set the default backend
    pub fn set_default_backend(&self, backend: Backend) {
        self.config.write().default_backend = backend;
    }

    /// Set the default sandbox mode
    pub fn set_default_sandbox(&self, sandbox: bool) {
        self.config.write().default_sandbox = sandbox;
    }

    /// Allow or forbid sandboxed compilation and evaluation
    pub fn set_sandboxing_enabled(&self, enabled: bool) {
        self.config.write().sandboxing_enabled = enabled;
        log::info!("Sandboxing {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Toggle error-level logging of null intermediate reads
    pub fn set_log_missing_properties(&self, enabled: bool) {
        self.config.write().log_missing_properties = enabled;
    }

    /// Set pooled engines for one script backend, resetting its pool
    pub fn set_max_engines(&self, backend: Backend, max: usize) {
        self.pool.set_max_engines(backend, max);
    }

    /// Set pooled engines for every script backend, resetting the pools
    pub fn set_default_max_engines(&self, max: usize) {
        self.config.write().max_engines_per_backend = max;
        self.pool.set_default_max_engines(max);
    }

    /// Install (or clear) the raw engine factory for a script backend
    pub fn set_engine_factory(&self, backend: Backend, factory: Option<EngineFactory>) {
        self.pool.set_factory(backend, factory);
    }

    /// Policy store shared by every sandboxed resolver
    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    /// Replace the whole sandbox policy
    pub fn set_sandbox_policy(&self, policy: SandboxPolicy) {
        self.sandbox.replace(policy);
    }

    /// Replace the property rules
    pub fn set_property_policy(&self, rules: MemberPolicy) {
        self.sandbox.set_property_policy(rules);
    }

    /// Replace the method rules
    pub fn set_method_policy(&self, rules: MemberPolicy) {
        self.sandbox.set_method_policy(rules);
    }

    /// Replace the constructor rules
    pub fn set_constructor_policy(&self, rules: MemberPolicy) {
        self.sandbox.set_constructor_policy(rules);
    }

    /// Replace the visibility flags
    pub fn set_access_flags(&self, access: AccessFlags) {
        self.sandbox.set_access_flags(access);
    }

    /// Replace the type allow-list
    pub fn set_allowed_types<I, S>(&self, types: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sandbox.set_allowed_types(types);
    }

    /// Add one type to the allow-list
    pub fn allow_type(&self, name: impl Into<String>) {
        self.sandbox.allow_type(name);
    }

    /// Register a host type
    ///
    /// Memoized type lookups are invalidated so a previously unknown name
    /// can resolve.
    pub fn register_type(&self, ty: HostType) -> Arc<HostType> {
        let ty = self.registry.register(ty);
        self.sandbox.touch();
        ty
    }

    /// Known host types
    pub fn type_registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Utility functions visible to every expression
    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.functions
    }

    /// Sandboxed type allow-list resolver
    pub fn type_allow_list(&self) -> &Arc<TypeAllowList> {
        &self.allow_list
    }

    /// Drop every cached compile, including cached failures
    pub fn clear_cache(&self) {
        self.cache.clear();
        log::debug!("Cleared compiled-expression cache");
    }

    /// Cache counters
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Pool counters of a script backend
    pub fn pool_stats(&self, backend: Backend) -> PoolStats {
        self.pool.stats(backend)
    }

    /// Reset the engine pool of a script backend
    pub fn reset_pool(&self, backend: Backend) {
        self.pool.reset(backend);
    }
}

impl Default for ExpressionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExpressionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpressionEngine")
            .field("config", &*self.config.read())
            .field("cache", &self.cache)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ExpressionEngine`]
#[derive(Default)]
pub struct ExpressionEngineBuilder {
    config: EngineConfig,
    policy: Option<SandboxPolicy>,
    registry: Option<Arc<TypeRegistry>>,
    config_resolver: Option<Arc<dyn ConfigResolver>>,
    functions: Vec<Arc<dyn UtilityFunction>>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl ExpressionEngineBuilder {
    /// Use a configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Initial sandbox policy
    pub fn sandbox_policy(mut self, policy: SandboxPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Share a type registry
    pub fn type_registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Resolver behind `resolveConfig`
    ///
    /// Defaults to an empty map, so expressions see no configuration values
    /// until one is supplied here.
    pub fn config_resolver(mut self, resolver: Arc<dyn ConfigResolver>) -> Self {
        self.config_resolver = Some(resolver);
        self
    }

    /// Add a utility function
    pub fn function(mut self, function: impl UtilityFunction + 'static) -> Self {
        self.functions.push(Arc::new(function));
        self
    }

    /// Metrics sink for compile and evaluate timers
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Assemble the engine
    pub fn build(self) -> ExpressionEngine {
        let config = self.config;
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(TypeRegistry::with_builtins()));
        let sandbox = Arc::new(Sandbox::new(self.policy.unwrap_or_default()));

        let resolver = self
            .config_resolver
            .unwrap_or_else(|| Arc::new(MapConfigResolver::new()));
        let mut functions = create_standard_registry(resolver);
        for function in self.functions {
            functions.register_arc(function);
        }
        let functions = Arc::new(functions);

        let allow_list = Arc::new(TypeAllowList::new(
            Arc::clone(&sandbox),
            Arc::clone(&registry),
            config.type_memo_capacity,
        ));
        let pool = Arc::new(EnginePool::new(
            Arc::clone(&functions),
            config.max_engines_per_backend,
            config.max_depth,
        ));

        log::debug!(
            "Building expression engine: default backend {}, {} functions, {} types",
            config.default_backend,
            functions.len(),
            registry.len()
        );

        ExpressionEngine {
            open: ResolverSet::open(Arc::clone(&registry)),
            visibility: ResolverSet::visibility(
                Arc::clone(&sandbox),
                Arc::clone(&registry),
                Arc::clone(&allow_list),
            ),
            policy: ResolverSet::policy(
                Arc::clone(&sandbox),
                Arc::clone(&registry),
                Arc::clone(&allow_list),
            ),
            cache: ExpressionCache::new(config.cache_capacity),
            path: PathBackend::new(config.max_depth),
            compiled: CompiledBackend::new(
                Arc::clone(&functions),
                CompilerConfig {
                    max_recursion_depth: config.max_depth,
                    ..CompilerConfig::default()
                },
            ),
            script: ScriptBackend::new(Backend::Script, Arc::clone(&pool)),
            script_expression: ScriptBackend::new(Backend::ScriptExpression, Arc::clone(&pool)),
            metrics: self.metrics.unwrap_or_else(|| Arc::new(LogMetrics)),
            config: RwLock::new(config),
            sandbox,
            registry,
            functions,
            allow_list,
            pool,
        }
    }
}
