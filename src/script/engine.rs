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

//! Pooled Rhai interpreter with per-call limits and utility functions

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rhai::{AST, Dynamic, EvalAltResult, Scope};

use super::convert::{from_dynamic, plain_to_dynamic, to_dynamic};
use crate::backend::{Backend, Invocation};
use crate::error::{EvalError, EvalResult};
use crate::model::Value;
use crate::registry::{FunctionRegistry, UtilityFunction};

/// Highest fixed arity registered for variadic utility functions
const MAX_SCRIPT_ARITY: usize = 3;

/// The deadline is read once every this many operations
const DEADLINE_CHECK_INTERVAL: u64 = 256;

const NO_DEADLINE: u64 = u64::MAX;
const TERMINATED_BY_TIMEOUT: &str = "timeout";
const TERMINATED_BY_OPERATIONS: &str = "operations";

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Limits read by the progress hook, armed for the duration of one call
#[derive(Debug)]
struct ProgressLimits {
    epoch: Instant,
    /// Nanoseconds since `epoch`, or `NO_DEADLINE`
    deadline: AtomicU64,
    /// Zero when unlimited
    max_operations: AtomicU64,
}

impl ProgressLimits {
    fn check(&self, operations: u64) -> Option<Dynamic> {
        let max = self.max_operations.load(Ordering::Relaxed);
        if max > 0 && operations > max {
            return Some(TERMINATED_BY_OPERATIONS.into());
        }
        if operations % DEADLINE_CHECK_INTERVAL == 1 {
            let deadline = self.deadline.load(Ordering::Relaxed);
            if deadline != NO_DEADLINE && self.epoch.elapsed().as_nanos() >= u128::from(deadline) {
                return Some(TERMINATED_BY_TIMEOUT.into());
            }
        }
        None
    }
}

/// A Rhai engine owned by the pool or created as overflow
pub struct ScriptEngine {
    id: u64,
    engine: rhai::Engine,
    limits: Arc<ProgressLimits>,
}

impl ScriptEngine {
    /// Wrap a raw engine, installing the progress hook and utility functions
    pub fn new(mut engine: rhai::Engine, functions: &FunctionRegistry, max_depth: usize) -> Self {
        let limits = Arc::new(ProgressLimits {
            epoch: Instant::now(),
            deadline: AtomicU64::new(NO_DEADLINE),
            max_operations: AtomicU64::new(0),
        });

        let hook = Arc::clone(&limits);
        engine.on_progress(move |operations| hook.check(operations));
        engine.set_max_expr_depths(max_depth, max_depth);
        engine.disable_symbol("eval");

        for function in functions.iter() {
            register_utility(&mut engine, Arc::clone(function));
        }

        Self {
            id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            engine,
            limits,
        }
    }

    /// Process-unique engine id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The wrapped engine
    pub fn engine(&self) -> &rhai::Engine {
        &self.engine
    }

    /// Parse a script for `backend`
    pub fn compile(&self, backend: Backend, source: &str) -> Result<AST, rhai::ParseError> {
        match backend {
            Backend::ScriptExpression => self.engine.compile_expression(source),
            _ => self.engine.compile(source),
        }
    }

    /// Run a script, from its parsed form when available
    pub fn run(
        &self,
        backend: Backend,
        source: &str,
        ast: Option<&AST>,
        invocation: &Invocation<'_>,
    ) -> EvalResult<Value> {
        let mut scope = self.scope(invocation);
        let _armed = self.arm(invocation.limits.timeout, invocation.limits.max_operations);
        let started = Instant::now();

        let result = match (ast, backend) {
            (Some(ast), _) => self.engine.eval_ast_with_scope::<Dynamic>(&mut scope, ast),
            (None, Backend::ScriptExpression) => {
                self.engine.eval_expression_with_scope::<Dynamic>(&mut scope, source)
            }
            (None, _) => self.engine.eval_with_scope::<Dynamic>(&mut scope, source),
        };

        result
            .map(from_dynamic)
            .map_err(|err| map_error(*err, started.elapsed(), invocation.limits.max_operations))
    }

    /// Bind `root`, each top-level root entry and every variable
    ///
    /// Later bindings shadow earlier ones, so a root entry named `root`
    /// wins over the root itself.
    fn scope(&self, invocation: &Invocation<'_>) -> Scope<'static> {
        let resolvers = invocation.resolvers;
        let root = invocation.root();
        let mut scope = Scope::new();
        scope.push_dynamic("root", to_dynamic(root, resolvers));

        let entries = match root {
            Value::Map(map) => Some(map.clone()),
            Value::Object(_) => resolvers.project(root),
            _ => None,
        };
        for (name, value) in entries.iter().flatten() {
            scope.push_dynamic(name.as_str(), to_dynamic(value, resolvers));
        }
        for (name, value) in invocation.context.variables() {
            scope.push_dynamic(name.as_str(), to_dynamic(value, resolvers));
        }
        scope
    }

    fn arm(&self, timeout: Option<Duration>, max_operations: u64) -> Disarm<'_> {
        let deadline = timeout
            .map(|timeout| {
                let at = self.limits.epoch.elapsed() + timeout;
                u64::try_from(at.as_nanos()).unwrap_or(NO_DEADLINE - 1)
            })
            .unwrap_or(NO_DEADLINE);
        self.limits.deadline.store(deadline, Ordering::Relaxed);
        self.limits
            .max_operations
            .store(max_operations, Ordering::Relaxed);
        Disarm(&self.limits)
    }
}

impl std::fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEngine").field("id", &self.id).finish()
    }
}

/// Clears the limits when the call ends
struct Disarm<'a>(&'a ProgressLimits);

impl Drop for Disarm<'_> {
    fn drop(&mut self) {
        self.0.deadline.store(NO_DEADLINE, Ordering::Relaxed);
        self.0.max_operations.store(0, Ordering::Relaxed);
    }
}

type NativeResult = Result<Dynamic, Box<EvalAltResult>>;

fn call_utility(function: &dyn UtilityFunction, args: Vec<Dynamic>) -> NativeResult {
    let args: Vec<Value> = args.into_iter().map(from_dynamic).collect();
    function
        .validate_args(&args)
        .and_then(|()| function.call(&args))
        .map(|value| plain_to_dynamic(&value))
        .map_err(|err| err.to_string().into())
}

fn register_utility(engine: &mut rhai::Engine, function: Arc<dyn UtilityFunction>) {
    let name = function.name().to_string();
    let (min, max) = function.arity();
    let max = max.unwrap_or(MAX_SCRIPT_ARITY).min(MAX_SCRIPT_ARITY);

    for arity in min..=max {
        let f = Arc::clone(&function);
        match arity {
            0 => {
                engine.register_fn(name.as_str(), move || call_utility(f.as_ref(), vec![]));
            }
            1 => {
                engine.register_fn(name.as_str(), move |a: Dynamic| {
                    call_utility(f.as_ref(), vec![a])
                });
            }
            2 => {
                engine.register_fn(name.as_str(), move |a: Dynamic, b: Dynamic| {
                    call_utility(f.as_ref(), vec![a, b])
                });
            }
            _ => {
                engine.register_fn(name.as_str(), move |a: Dynamic, b: Dynamic, c: Dynamic| {
                    call_utility(f.as_ref(), vec![a, b, c])
                });
            }
        }
    }
}

fn map_error(err: EvalAltResult, elapsed: Duration, max_operations: u64) -> EvalError {
    match err {
        EvalAltResult::ErrorTerminated(token, _) => {
            if token.to_string() == TERMINATED_BY_OPERATIONS {
                EvalError::OperationLimit {
                    limit: max_operations,
                }
            } else {
                EvalError::Timeout {
                    elapsed_ms: elapsed.as_millis() as u64,
                }
            }
        }
        EvalAltResult::ErrorVariableNotFound(name, _) => EvalError::UnknownVariable { name },
        EvalAltResult::ErrorFunctionNotFound(signature, _) => {
            // Property access on unit surfaces as a missing getter `get$name (())`
            match signature.strip_prefix("get$") {
                Some(rest) if rest.contains("()") => EvalError::NullIntermediate {
                    property: rest.split_whitespace().next().unwrap_or(rest).to_string(),
                },
                _ => EvalError::UnknownFunction { name: signature },
            }
        }
        EvalAltResult::ErrorPropertyNotFound(property, _) => EvalError::UnknownProperty {
            property,
            type_name: "lang.Map".to_string(),
        },
        EvalAltResult::ErrorInFunctionCall(name, _, inner, _) => match *inner {
            EvalAltResult::ErrorRuntime(message, _) => EvalError::function(name, message.to_string()),
            other => map_error(other, elapsed, max_operations),
        },
        EvalAltResult::ErrorArithmetic(message, _) => EvalError::Arithmetic { message },
        EvalAltResult::ErrorMismatchDataType(expected, actual, _)
        | EvalAltResult::ErrorMismatchOutputType(expected, actual, _) => {
            EvalError::type_mismatch(format!("expected {expected}, got {actual}"))
        }
        EvalAltResult::ErrorArrayBounds(size, index, _) => EvalError::IndexOutOfBounds { index, size },
        other => EvalError::script(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EvaluationContext;
    use crate::evaluator::EvaluationLimits;
    use crate::model::TypeRegistry;
    use crate::registry::functions::register_builtin_functions;
    use crate::sandbox::ResolverSet;

    fn engine() -> (ScriptEngine, Arc<FunctionRegistry>) {
        let mut functions = FunctionRegistry::new();
        register_builtin_functions(&mut functions);
        let functions = Arc::new(functions);
        (ScriptEngine::new(rhai::Engine::new(), &functions, 64), functions)
    }

    fn run(source: &str, root: Value, limits: EvaluationLimits) -> EvalResult<Value> {
        let (engine, functions) = engine();
        let context = EvaluationContext::new(root, functions).with_variable("factor", Value::from(3));
        let resolvers = ResolverSet::open(Arc::new(TypeRegistry::with_builtins()));
        let invocation = Invocation {
            context: &context,
            resolvers: &resolvers,
            limits,
            sandboxed: false,
        };
        engine.run(Backend::Script, source, None, &invocation)
    }

    #[test]
    fn test_root_entries_and_variables_are_bound() {
        let root = Value::map([("price", Value::from(5))]);
        assert_eq!(
            run("price * factor + root.price", root, EvaluationLimits::default()).unwrap(),
            Value::Integer(20)
        );
    }

    #[test]
    fn test_utility_functions_registered() {
        assert_eq!(
            run("sum([1, 2, 3]) + count(1, 2)", Value::Null, EvaluationLimits::default()).unwrap(),
            Value::Integer(8)
        );
    }

    #[test]
    fn test_operation_limit_terminates_loop() {
        let limits = EvaluationLimits {
            max_operations: 500,
            ..EvaluationLimits::default()
        };
        assert_eq!(
            run("let n = 0; loop { n += 1; }", Value::Null, limits),
            Err(EvalError::OperationLimit { limit: 500 })
        );
    }

    #[test]
    fn test_deadline_terminates_loop() {
        let limits = EvaluationLimits {
            timeout: Some(Duration::from_millis(20)),
            max_operations: 0,
            ..EvaluationLimits::default()
        };
        assert!(matches!(
            run("let n = 0; loop { n += 1; }", Value::Null, limits),
            Err(EvalError::Timeout { .. })
        ));
    }

    #[test]
    fn test_limits_disarmed_after_call() {
        let (engine, functions) = engine();
        let context = EvaluationContext::new(Value::Null, functions);
        let resolvers = ResolverSet::open(Arc::new(TypeRegistry::with_builtins()));
        let invocation = Invocation {
            context: &context,
            resolvers: &resolvers,
            limits: EvaluationLimits {
                max_operations: 10,
                ..EvaluationLimits::default()
            },
            sandboxed: false,
        };
        let _ = engine.run(Backend::Script, "1 + 1", None, &invocation);
        assert_eq!(engine.limits.max_operations.load(Ordering::Relaxed), 0);
        assert_eq!(engine.limits.deadline.load(Ordering::Relaxed), NO_DEADLINE);
    }
}
