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

//! Script engine pool bounds and reuse

use expr_sandbox::script::EnginePool;
use expr_sandbox::{Backend, EngineConfig, ExpressionSource, FunctionRegistry, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

mod utils;
use utils::engine_with;

#[test]
fn max_two_serves_third_holder_from_overflow() {
    let pool = EnginePool::new(Arc::new(FunctionRegistry::new()), 2, 32);

    let held = (0..3).map(|_| pool.acquire(Backend::Script)).collect::<Vec<_>>();
    let owned = held.iter().filter(|engine| engine.is_pool_owned()).count();
    assert_eq!(owned, 2);
    assert_eq!(held.len() - owned, 1);

    let stats = pool.stats(Backend::Script);
    assert_eq!((stats.owned, stats.live, stats.overflows), (2, 2, 1));

    let mut held = held;
    let overflow = held.pop().unwrap();
    assert!(!overflow.is_pool_owned());
    drop(overflow);
    assert_eq!(pool.stats(Backend::Script).idle, 0);

    let released = held.pop().unwrap();
    let released_id = released.id();
    drop(released);
    assert_eq!(pool.stats(Backend::Script).idle, 1);
    assert_eq!(pool.acquire(Backend::Script).id(), released_id);
}

#[test]
fn resizing_resets_the_pool() {
    let engine = engine_with(EngineConfig::testing());
    let run = || {
        engine.evaluate_with_exception(
            ExpressionSource::text("40 + 2", Backend::ScriptExpression),
            Value::Null,
            false,
        )
    };
    assert_eq!(run(), Ok(Value::Integer(42)));
    assert_eq!(engine.pool_stats(Backend::ScriptExpression).idle, 1);

    engine.set_max_engines(Backend::ScriptExpression, 1);
    let stats = engine.pool_stats(Backend::ScriptExpression);
    assert_eq!((stats.idle, stats.owned, stats.max), (0, 0, 1));

    assert_eq!(run(), Ok(Value::Integer(42)));
    assert_eq!(engine.pool_stats(Backend::ScriptExpression).owned, 1);
}

#[test]
fn custom_factory_configures_new_engines() {
    let engine = engine_with(EngineConfig::testing());
    let built = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&built);
    engine.set_engine_factory(
        Backend::Script,
        Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut raw = rhai::Engine::new();
            raw.register_fn("triple", |x: i64| x * 3);
            raw
        })),
    );

    let result = engine.evaluate_with_exception(
        ExpressionSource::text("triple(qty)", Backend::Script),
        Value::map([("qty", Value::from(4))]),
        false,
    );
    assert_eq!(result, Ok(Value::Integer(12)));
    assert_eq!(built.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_load_never_exceeds_pool_size() {
    let engine = Arc::new(engine_with(EngineConfig::testing()));
    let handles = (0..8)
        .map(|i| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                (0..20)
                    .map(|j| {
                        engine.evaluate_with_exception(
                            ExpressionSource::text("let s = 0; for x in 0..n { s += x; } s", Backend::Script),
                            Value::map([("n", Value::from(i * 20 + j))]),
                            false,
                        )
                    })
                    .filter(Result::is_ok)
                    .count()
            })
        })
        .collect::<Vec<_>>();

    let succeeded: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(succeeded, 160);

    let stats = engine.pool_stats(Backend::Script);
    assert!(stats.owned <= 2);
    assert!(stats.idle <= 2);
    assert_eq!(stats.hits + stats.misses + stats.overflows, 160);
}
