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

//! Batch output evaluation: ordering, placement and failure handling

use expr_sandbox::{Backend, Expression, ExpressionError, Value, ValueMap};
use pretty_assertions::assert_eq;
use serde_json::json;

mod utils;
use utils::{engine, order_root};

fn to_json(map: ValueMap) -> serde_json::Value {
    serde_json::Value::from(&Value::Map(map))
}

#[test]
fn later_expressions_observe_earlier_output() {
    let expressions = vec![
        Expression::new("a", "1+1"),
        Expression::new("b", "result.a * 10"),
    ];
    let result = engine().evaluate_batch(&expressions, &Value::Null, false, &ValueMap::new());
    assert_eq!(to_json(result), json!({"a": 2, "b": 20}));
}

#[test]
fn backends_share_the_accumulating_result() {
    let expressions = vec![
        Expression::new("a", "1 + 1").with_backend(Backend::Compiled),
        Expression::new("b", "result.a * 10").with_backend(Backend::ScriptExpression),
        Expression::new("c", "let x = result.b; x + root.bonus").with_backend(Backend::Script),
    ];
    let root = Value::map([("bonus", Value::from(5))]);
    let result = engine().evaluate_batch(&expressions, &root, false, &ValueMap::new());
    assert_eq!(to_json(result), json!({"a": 2, "b": 20, "c": 25}));
}

#[test]
fn map_merge_contributes_top_level_keys() {
    let expressions = vec![
        Expression {
            path: Some("ignored".to_string()),
            ..Expression::merged("{'x': 1, 'y': 2}")
        },
        Expression::new("z", "result.x + result.y"),
    ];
    let result = engine().evaluate_batch(&expressions, &Value::Null, false, &ValueMap::new());
    assert_eq!(to_json(result), json!({"x": 1, "y": 2, "z": 3}));
}

#[test]
fn map_merge_of_host_object_uses_public_properties() {
    let expressions = vec![Expression::merged("root.order")];
    let result = engine().evaluate_batch(&expressions, &order_root(12), false, &ValueMap::new());
    assert_eq!(to_json(result), json!({"id": "o-12", "total": 12}));
}

#[test]
fn dotted_paths_create_nested_maps() {
    let expressions = vec![
        Expression::new("summary.total", "root.order.total"),
        Expression::new("summary.discounted", "root.order.discount(10)"),
        Expression::new("summary.fee", "context.fee"),
    ];
    let context = Value::map([("fee", Value::from(3))]);
    let result = engine().evaluate_batch(
        &expressions,
        &order_root(50),
        false,
        context.as_map().unwrap(),
    );
    assert_eq!(
        to_json(result),
        json!({"summary": {"total": 50, "discounted": 45, "fee": 3}})
    );
}

fn five_with_one_invalid() -> Vec<Expression> {
    vec![
        Expression::new("a", "1"),
        Expression::new("b", "2"),
        Expression::new("c", ""),
        Expression::new("d", "4"),
        Expression::new("e", "5"),
    ]
}

#[test]
fn fail_soft_batch_omits_invalid_expression() {
    let result =
        engine().evaluate_batch(&five_with_one_invalid(), &Value::Null, false, &ValueMap::new());
    assert_eq!(to_json(result), json!({"a": 1, "b": 2, "d": 4, "e": 5}));
}

#[test]
fn exception_batch_aborts_on_invalid_expression() {
    let err = engine()
        .evaluate_batch_with_exception(&five_with_one_invalid(), &Value::Null, false, &ValueMap::new())
        .unwrap_err();
    assert!(matches!(err, ExpressionError::Validation { field: "source", .. }));
}

#[test]
fn failing_evaluations_are_skipped_or_propagated() {
    let expressions = vec![
        Expression::new("a", "1"),
        Expression::new("b", "root.order.total"),
        Expression::new("c", "1 +"),
        Expression::new("d", "result.a + 1"),
    ];
    let engine = engine();

    let result = engine.evaluate_batch(&expressions, &Value::Null, false, &ValueMap::new());
    assert_eq!(to_json(result), json!({"a": 1, "d": 2}));

    let err = engine
        .evaluate_batch_with_exception(&expressions, &Value::Null, false, &ValueMap::new())
        .unwrap_err();
    assert!(matches!(err, ExpressionError::Compile { backend: Backend::Path, .. }));
}

#[test]
fn expressions_load_from_json() {
    let root = Value::map([("qty", Value::from(7))]);
    let expressions: Vec<Expression> = serde_json::from_value(json!([
        {"source": "root.qty * $scale", "path": "scaled", "variables": {"scale": 3}},
        {"source": "#{doubled: root.qty * 2}", "backend": "script-expression", "merge_map": true}
    ]))
    .unwrap();
    let result = engine().evaluate_batch(&expressions, &root, false, &ValueMap::new());
    assert_eq!(to_json(result), json!({"scaled": 21, "doubled": 14}));
}
