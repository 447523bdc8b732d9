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

use criterion::{Criterion, criterion_group, criterion_main};
use expr_sandbox::{
    Backend, CompileOptions, EngineConfig, Expression, ExpressionEngine, Value, ValueMap,
};
use std::hint::black_box;

fn root() -> Value {
    Value::map([
        ("price", Value::from(12)),
        ("qty", Value::from(3)),
        (
            "items",
            Value::from(vec![Value::from(1), Value::from(2), Value::from(3)]),
        ),
    ])
}

fn benchmark_backends(c: &mut Criterion) {
    let engine = ExpressionEngine::with_config(EngineConfig::high_performance());
    let mut group = c.benchmark_group("evaluate");

    for backend in Backend::ALL {
        let compiled = engine
            .compile("price * qty + sum(items)", backend, false, CompileOptions::precompiled())
            .expect("benchmark expression compiles");
        group.bench_function(backend.as_str(), |b| {
            b.iter(|| black_box(engine.evaluate_with_exception(&compiled, root(), false)))
        });
    }
    group.finish();
}

fn benchmark_sandboxed(c: &mut Criterion) {
    let engine = ExpressionEngine::with_config(EngineConfig::high_performance());
    let mut group = c.benchmark_group("sandboxed");

    for backend in [Backend::Path, Backend::Compiled] {
        let compiled = engine
            .compile("'x'.length() + price", backend, true, CompileOptions::default())
            .expect("benchmark expression compiles");
        group.bench_function(backend.as_str(), |b| {
            b.iter(|| black_box(engine.evaluate_with_exception(&compiled, root(), true)))
        });
    }
    group.finish();
}

fn benchmark_cache_hit(c: &mut Criterion) {
    let engine = ExpressionEngine::with_config(EngineConfig::high_performance());
    let _ = engine.compile("price * qty", Backend::Path, false, CompileOptions::default());

    c.bench_function("cache_hit", |b| {
        b.iter(|| {
            black_box(engine.compile(
                black_box("price * qty"),
                Backend::Path,
                false,
                CompileOptions::default(),
            ))
        })
    });
}

fn benchmark_batch(c: &mut Criterion) {
    let engine = ExpressionEngine::with_config(EngineConfig::high_performance());
    let expressions = vec![
        Expression::new("subtotal", "root.price * root.qty"),
        Expression::new("tax", "result.subtotal / 10").with_backend(Backend::Compiled),
        Expression::new("total", "result.subtotal + result.tax")
            .with_backend(Backend::ScriptExpression),
        Expression::merged("{count: count(root.items)}"),
    ];
    let context = ValueMap::new();

    c.bench_function("batch_four_expressions", |b| {
        b.iter(|| black_box(engine.evaluate_batch(&expressions, &root(), false, &context)))
    });
}

criterion_group!(
    benches,
    benchmark_backends,
    benchmark_sandboxed,
    benchmark_cache_hit,
    benchmark_batch
);
criterion_main!(benches);
