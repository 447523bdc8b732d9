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

//! Aggregate helpers: sum(), avg(), min(), max(), count()
//!
//! Each accepts either one list argument or the values themselves, so
//! `sum(items)` and `sum(1, 2, 3)` are equivalent. Nulls are skipped.

use std::cmp::Ordering;

use crate::model::Value;
use crate::registry::function::{FunctionError, FunctionResult, UtilityFunction};

/// Values an aggregate runs over
pub(crate) fn aggregate_items(args: &[Value]) -> impl Iterator<Item = &Value> {
    let items = match args {
        [Value::List(items)] => items.as_slice(),
        other => other,
    };
    items.iter().filter(|item| !item.is_null())
}

fn not_numeric(name: &str, item: &Value) -> FunctionError {
    FunctionError::InvalidArgumentType {
        name: name.to_string(),
        index: 0,
        expected: "Number".to_string(),
        actual: item.type_name().to_string(),
    }
}

/// sum() function - sums numeric values
pub struct SumFunction;

impl UtilityFunction for SumFunction {
    fn name(&self) -> &str {
        "sum"
    }

    fn arity(&self) -> (usize, Option<usize>) {
        (0, None)
    }

    fn call(&self, args: &[Value]) -> FunctionResult<Value> {
        let mut int_sum: i64 = 0;
        let mut decimal_sum: Option<f64> = None;

        for item in aggregate_items(args) {
            match item {
                Value::Integer(i) => match decimal_sum.as_mut() {
                    Some(sum) => *sum += *i as f64,
                    None => {
                        int_sum = int_sum.checked_add(*i).ok_or_else(|| {
                            FunctionError::EvaluationError {
                                name: self.name().to_string(),
                                message: "integer overflow".to_string(),
                            }
                        })?
                    }
                },
                Value::Decimal(d) => {
                    let sum = decimal_sum.get_or_insert(int_sum as f64);
                    *sum += d;
                }
                other => return Err(not_numeric(self.name(), other)),
            }
        }

        Ok(match decimal_sum {
            Some(sum) => Value::Decimal(sum),
            None => Value::Integer(int_sum),
        })
    }
}

/// avg() function - arithmetic mean, null for no values
pub struct AvgFunction;

impl UtilityFunction for AvgFunction {
    fn name(&self) -> &str {
        "avg"
    }

    fn arity(&self) -> (usize, Option<usize>) {
        (0, None)
    }

    fn call(&self, args: &[Value]) -> FunctionResult<Value> {
        let mut total = 0.0;
        let mut count = 0usize;
        for item in aggregate_items(args) {
            total += item.as_f64().ok_or_else(|| not_numeric(self.name(), item))?;
            count += 1;
        }
        if count == 0 {
            return Ok(Value::Null);
        }
        Ok(Value::Decimal(total / count as f64))
    }
}

/// Order two values of the same comparable kind
pub(crate) fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
    }
}

fn extreme(name: &str, args: &[Value], wanted: Ordering) -> FunctionResult<Value> {
    let mut best: Option<&Value> = None;
    for item in aggregate_items(args) {
        best = match best {
            None => Some(item),
            Some(current) => match compare_values(item, current) {
                Some(order) if order == wanted => Some(item),
                Some(_) => Some(current),
                None => {
                    return Err(FunctionError::InvalidArgumentType {
                        name: name.to_string(),
                        index: 0,
                        expected: current.type_name().to_string(),
                        actual: item.type_name().to_string(),
                    });
                }
            },
        };
    }
    Ok(best.cloned().unwrap_or_default())
}

/// min() function - smallest value
pub struct MinFunction;

impl UtilityFunction for MinFunction {
    fn name(&self) -> &str {
        "min"
    }

    fn arity(&self) -> (usize, Option<usize>) {
        (0, None)
    }

    fn call(&self, args: &[Value]) -> FunctionResult<Value> {
        extreme(self.name(), args, Ordering::Less)
    }
}

/// max() function - largest value
pub struct MaxFunction;

impl UtilityFunction for MaxFunction {
    fn name(&self) -> &str {
        "max"
    }

    fn arity(&self) -> (usize, Option<usize>) {
        (0, None)
    }

    fn call(&self, args: &[Value]) -> FunctionResult<Value> {
        extreme(self.name(), args, Ordering::Greater)
    }
}

/// count() function - number of non-null values
pub struct CountFunction;

impl UtilityFunction for CountFunction {
    fn name(&self) -> &str {
        "count"
    }

    fn arity(&self) -> (usize, Option<usize>) {
        (0, None)
    }

    fn call(&self, args: &[Value]) -> FunctionResult<Value> {
        Ok(Value::from(aggregate_items(args).count()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: Vec<Value>) -> Vec<Value> {
        vec![Value::List(items)]
    }

    #[test]
    fn test_sum_widens_to_decimal() {
        let ints = list(vec![1.into(), 2.into(), Value::Null, 3.into()]);
        assert_eq!(SumFunction.call(&ints).unwrap(), Value::Integer(6));

        let mixed = [Value::from(1), Value::from(0.5)];
        assert_eq!(SumFunction.call(&mixed).unwrap(), Value::Decimal(1.5));

        assert!(SumFunction.call(&[Value::from("x")]).is_err());
        assert!(SumFunction.call(&[Value::from(i64::MAX), Value::from(1)]).is_err());
    }

    #[test]
    fn test_avg() {
        assert_eq!(
            AvgFunction.call(&list(vec![1.into(), 2.into()])).unwrap(),
            Value::Decimal(1.5)
        );
        assert_eq!(AvgFunction.call(&list(vec![])).unwrap(), Value::Null);
    }

    #[test]
    fn test_min_max_count() {
        let values = list(vec![3.into(), 1.5.into(), 7.into()]);
        assert_eq!(MinFunction.call(&values).unwrap(), Value::Decimal(1.5));
        assert_eq!(MaxFunction.call(&values).unwrap(), Value::Integer(7));
        assert_eq!(CountFunction.call(&values).unwrap(), Value::Integer(3));

        let words = [Value::from("pear"), Value::from("apple")];
        assert_eq!(MinFunction.call(&words).unwrap(), Value::from("apple"));
        assert!(MaxFunction.call(&[Value::from("a"), Value::from(1)]).is_err());
    }
}
