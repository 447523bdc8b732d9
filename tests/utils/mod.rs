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

//! Shared fixtures for integration tests

#![allow(dead_code)]

use expr_sandbox::error::InvokeError;
use expr_sandbox::{EngineConfig, ExpressionEngine, HostObject, HostType, Value, Visibility};
use std::any::Any;
use std::sync::Arc;

/// Host object used across the sandbox tests
#[derive(Debug)]
pub struct Order {
    pub id: String,
    pub total: i64,
}

impl HostObject for Order {
    fn type_name(&self) -> &str {
        "shop.Order"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// `shop.Order` with a public `total`, a private `margin`, a public
/// `discount(pct)` method and a public constructor
pub fn order_type() -> HostType {
    HostType::builder("shop.Order")
        .property("id", Visibility::Public, |o: &Order| o.id.clone().into())
        .property("total", Visibility::Public, |o: &Order| o.total.into())
        .property("margin", Visibility::Private, |o: &Order| (o.total / 4).into())
        .method("discount", Visibility::Public, |o: &Order, args| {
            InvokeError::check_arity(args, 1)?;
            let pct = args[0]
                .as_i64()
                .ok_or_else(|| InvokeError::argument(0, "expected an integer"))?;
            Ok(Value::Integer(o.total - o.total * pct / 100))
        })
        .constructor(Visibility::Public, |args| {
            let total = args.first().and_then(Value::as_i64).unwrap_or(0);
            Ok(Value::object(Order {
                id: "new".to_string(),
                total,
            }))
        })
        .build()
}

/// Engine with test limits and `shop.Order` registered
pub fn engine() -> ExpressionEngine {
    engine_with(EngineConfig::testing())
}

/// Engine with a given configuration and `shop.Order` registered
pub fn engine_with(config: EngineConfig) -> ExpressionEngine {
    let _ = env_logger::builder().is_test(true).try_init();
    let engine = ExpressionEngine::with_config(config);
    engine.register_type(order_type());
    engine
}

/// `{order: <shop.Order total>}`
pub fn order_root(total: i64) -> Value {
    Value::map([(
        "order",
        Value::object(Order {
            id: format!("o-{total}"),
            total,
        }),
    )])
}

/// Shared engine for concurrency tests
pub fn shared_engine() -> Arc<ExpressionEngine> {
    Arc::new(engine())
}
