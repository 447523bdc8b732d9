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

//! Operator semantics shared by the tree walker and the bytecode VM

use std::cmp::Ordering;

use crate::ast::{BinaryOperator, LiteralValue, UnaryOperator};
use crate::error::{EvalError, EvalResult};
use crate::model::Value;
use crate::registry::functions::compare_values;

/// Value of a literal node
pub fn literal(literal: &LiteralValue) -> EvalResult<Value> {
    Ok(match literal {
        LiteralValue::Null => Value::Null,
        LiteralValue::Boolean(b) => Value::Boolean(*b),
        LiteralValue::Integer(i) => Value::Integer(*i),
        LiteralValue::Decimal(text) => Value::Decimal(
            text.parse()
                .map_err(|_| EvalError::type_mismatch(format!("invalid decimal literal '{text}'")))?,
        ),
        LiteralValue::String(s) => Value::String(s.clone()),
    })
}

/// Truth value of a condition operand
///
/// Null counts as false. Anything other than a boolean is a type error.
pub fn truthy(value: &Value) -> EvalResult<bool> {
    match value {
        Value::Boolean(b) => Ok(*b),
        Value::Null => Ok(false),
        other => Err(EvalError::type_mismatch(format!(
            "expected lang.Boolean condition, got {}",
            other.type_name()
        ))),
    }
}

/// Apply a unary operator
pub fn unary(op: UnaryOperator, operand: &Value) -> EvalResult<Value> {
    match op {
        UnaryOperator::Not => Ok(Value::Boolean(!truthy(operand)?)),
        UnaryOperator::Negate => match operand {
            Value::Integer(i) => i
                .checked_neg()
                .map(Value::Integer)
                .ok_or_else(|| EvalError::arithmetic("integer overflow in negation")),
            Value::Decimal(d) => Ok(Value::Decimal(-d)),
            other => Err(EvalError::type_mismatch(format!(
                "cannot negate {}",
                other.type_name()
            ))),
        },
    }
}

/// Apply a strict (non short-circuit) binary operator
///
/// `and`/`or` evaluated here see both operands already computed.
pub fn binary(op: BinaryOperator, left: &Value, right: &Value) -> EvalResult<Value> {
    match op {
        BinaryOperator::Add => add(left, right),
        BinaryOperator::Subtract => arithmetic(op, left, right, i64::checked_sub, |a, b| a - b),
        BinaryOperator::Multiply => arithmetic(op, left, right, i64::checked_mul, |a, b| a * b),
        BinaryOperator::Divide => {
            ensure_nonzero(right)?;
            arithmetic(op, left, right, i64::checked_div, |a, b| a / b)
        }
        BinaryOperator::Modulo => {
            ensure_nonzero(right)?;
            arithmetic(op, left, right, i64::checked_rem, |a, b| a % b)
        }
        BinaryOperator::Equal => Ok(Value::Boolean(left == right)),
        BinaryOperator::NotEqual => Ok(Value::Boolean(left != right)),
        BinaryOperator::LessThan => compare(op, left, right, |o| o == Ordering::Less),
        BinaryOperator::LessThanOrEqual => compare(op, left, right, |o| o != Ordering::Greater),
        BinaryOperator::GreaterThan => compare(op, left, right, |o| o == Ordering::Greater),
        BinaryOperator::GreaterThanOrEqual => compare(op, left, right, |o| o != Ordering::Less),
        BinaryOperator::And => Ok(Value::Boolean(truthy(left)? && truthy(right)?)),
        BinaryOperator::Or => Ok(Value::Boolean(truthy(left)? || truthy(right)?)),
        BinaryOperator::In => contains(right, left).map(Value::Boolean),
    }
}

fn mismatch(op: BinaryOperator, left: &Value, right: &Value) -> EvalError {
    EvalError::type_mismatch(format!(
        "operator '{}' not applicable to {} and {}",
        op.symbol(),
        left.type_name(),
        right.type_name()
    ))
}

fn add(left: &Value, right: &Value) -> EvalResult<Value> {
    match (left, right) {
        (Value::String(a), b) => Ok(Value::String(format!("{a}{b}"))),
        (a, Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
        (Value::List(a), Value::List(b)) => Ok(Value::List(a.iter().chain(b).cloned().collect())),
        _ => arithmetic(BinaryOperator::Add, left, right, i64::checked_add, |a, b| a + b),
    }
}

fn arithmetic(
    op: BinaryOperator,
    left: &Value,
    right: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> EvalResult<Value> {
    match (left, right) {
        (Value::Integer(a), Value::Integer(b)) => int_op(*a, *b)
            .map(Value::Integer)
            .ok_or_else(|| EvalError::arithmetic(format!("integer overflow in '{}'", op.symbol()))),
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => Ok(Value::Decimal(float_op(a, b))),
            _ => Err(mismatch(op, left, right)),
        },
    }
}

fn ensure_nonzero(divisor: &Value) -> EvalResult<()> {
    if divisor.as_f64() == Some(0.0) {
        Err(EvalError::arithmetic("division by zero"))
    } else {
        Ok(())
    }
}

fn compare(
    op: BinaryOperator,
    left: &Value,
    right: &Value,
    accept: fn(Ordering) -> bool,
) -> EvalResult<Value> {
    compare_values(left, right)
        .map(|ordering| Value::Boolean(accept(ordering)))
        .ok_or_else(|| mismatch(op, left, right))
}

fn contains(container: &Value, item: &Value) -> EvalResult<bool> {
    match (container, item) {
        (Value::List(items), item) => Ok(items.contains(item)),
        (Value::Map(map), Value::String(key)) => Ok(map.contains_key(key)),
        (Value::String(haystack), Value::String(needle)) => Ok(haystack.contains(needle.as_str())),
        (Value::Null, _) => Ok(false),
        (container, item) => Err(mismatch(BinaryOperator::In, item, container)),
    }
}

/// Index into a list, map or string
pub fn index(base: &Value, index: &Value) -> EvalResult<Value> {
    match (base, index) {
        (Value::Null, _) => Err(EvalError::NullIntermediate {
            property: format!("[{index}]"),
        }),
        (Value::List(items), Value::Integer(i)) => usize::try_from(*i)
            .ok()
            .and_then(|i| items.get(i))
            .cloned()
            .ok_or(EvalError::IndexOutOfBounds {
                index: *i,
                size: items.len(),
            }),
        (Value::Map(map), Value::String(key)) => Ok(map.get(key).cloned().unwrap_or_default()),
        (Value::String(s), Value::Integer(i)) => usize::try_from(*i)
            .ok()
            .and_then(|i| s.chars().nth(i))
            .map(|c| Value::String(c.to_string()))
            .ok_or(EvalError::IndexOutOfBounds {
                index: *i,
                size: s.chars().count(),
            }),
        (base, index) => Err(EvalError::type_mismatch(format!(
            "cannot index {} with {}",
            base.type_name(),
            index.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(BinaryOperator::Add, Value::from(1), Value::from(1), Value::from(2))]
    #[case(BinaryOperator::Add, Value::from(1), Value::from(0.5), Value::from(1.5))]
    #[case(BinaryOperator::Add, Value::from("a"), Value::from(1), Value::from("a1"))]
    #[case(BinaryOperator::Divide, Value::from(7), Value::from(2), Value::from(3))]
    #[case(BinaryOperator::Divide, Value::from(7.0), Value::from(2), Value::from(3.5))]
    #[case(BinaryOperator::Modulo, Value::from(7), Value::from(4), Value::from(3))]
    #[case(BinaryOperator::Equal, Value::from(2), Value::from(2.0), Value::from(true))]
    #[case(BinaryOperator::LessThan, Value::from("a"), Value::from("b"), Value::from(true))]
    #[case(BinaryOperator::GreaterThanOrEqual, Value::from(2), Value::from(2.5), Value::from(false))]
    #[case(BinaryOperator::In, Value::from("k"), Value::map([("k", Value::Null)]), Value::from(true))]
    fn test_binary(
        #[case] op: BinaryOperator,
        #[case] left: Value,
        #[case] right: Value,
        #[case] expected: Value,
    ) {
        assert_eq!(binary(op, &left, &right).unwrap(), expected);
    }

    #[test]
    fn test_arithmetic_errors() {
        assert!(matches!(
            binary(BinaryOperator::Divide, &Value::from(1), &Value::from(0)),
            Err(EvalError::Arithmetic { .. })
        ));
        assert!(matches!(
            binary(BinaryOperator::Multiply, &Value::from(i64::MAX), &Value::from(2)),
            Err(EvalError::Arithmetic { .. })
        ));
        assert!(matches!(
            binary(BinaryOperator::Subtract, &Value::Null, &Value::from(2)),
            Err(EvalError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_truthiness() {
        assert!(!truthy(&Value::Null).unwrap());
        assert!(truthy(&Value::from(true)).unwrap());
        assert!(truthy(&Value::from(1)).is_err());
    }

    #[test]
    fn test_index() {
        let list = Value::List(vec![Value::from("a"), Value::from("b")]);
        assert_eq!(index(&list, &Value::from(1)).unwrap(), Value::from("b"));
        assert_eq!(
            index(&list, &Value::from(-1)),
            Err(EvalError::IndexOutOfBounds { index: -1, size: 2 })
        );
        assert_eq!(index(&Value::from("xyz"), &Value::from(2)).unwrap(), Value::from("z"));
        assert!(matches!(
            index(&Value::Null, &Value::from(0)),
            Err(EvalError::NullIntermediate { .. })
        ));
    }
}
