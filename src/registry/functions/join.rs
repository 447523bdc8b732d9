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

//! join() function - joins values into one string

use crate::model::Value;
use crate::registry::function::{FunctionError, FunctionResult, UtilityFunction};

/// join(items[, separator]) - separator defaults to `,`
pub struct JoinFunction;

impl UtilityFunction for JoinFunction {
    fn name(&self) -> &str {
        "join"
    }

    fn arity(&self) -> (usize, Option<usize>) {
        (1, Some(2))
    }

    fn call(&self, args: &[Value]) -> FunctionResult<Value> {
        let separator = match args.get(1) {
            Some(Value::String(s)) => s.as_str(),
            Some(other) => {
                return Err(FunctionError::InvalidArgumentType {
                    name: self.name().to_string(),
                    index: 1,
                    expected: "lang.String".to_string(),
                    actual: other.type_name().to_string(),
                });
            }
            None => ",",
        };

        let items = match &args[0] {
            Value::List(items) => items.as_slice(),
            Value::Null => return Ok(Value::from("")),
            single => std::slice::from_ref(single),
        };
        let joined = items
            .iter()
            .filter(|item| !item.is_null())
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join(separator);
        Ok(Value::String(joined))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join() {
        let items = Value::List(vec!["a".into(), Value::Null, 1.into()]);
        assert_eq!(JoinFunction.call(&[items.clone()]).unwrap(), Value::from("a,1"));
        assert_eq!(
            JoinFunction.call(&[items, " | ".into()]).unwrap(),
            Value::from("a | 1")
        );
        assert_eq!(JoinFunction.call(&[Value::Null]).unwrap(), Value::from(""));
    }
}
