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

//! Builtin `lang` types describing the members of plain values

use once_cell::sync::Lazy;
use std::sync::Arc;

use super::host::{HostType, Visibility};
use super::value::{Value, ValueMap};
use crate::error::InvokeError;

static BUILTIN_TYPES: Lazy<Vec<Arc<HostType>>> = Lazy::new(|| {
    vec![
        Arc::new(string_type()),
        Arc::new(integer_type()),
        Arc::new(double_type()),
        Arc::new(boolean_type()),
        Arc::new(list_type()),
        Arc::new(map_type()),
    ]
});

/// Builtin types shared by every registry
pub(crate) fn builtin_types() -> &'static [Arc<HostType>] {
    &BUILTIN_TYPES
}

fn receiver_str(receiver: &Value) -> Result<&str, InvokeError> {
    receiver.as_str().ok_or_else(|| InvokeError::WrongReceiver {
        expected: "lang.String".into(),
    })
}

fn receiver_list(receiver: &Value) -> Result<&[Value], InvokeError> {
    receiver.as_list().ok_or_else(|| InvokeError::WrongReceiver {
        expected: "lang.List".into(),
    })
}

fn receiver_map(receiver: &Value) -> Result<&ValueMap, InvokeError> {
    receiver.as_map().ok_or_else(|| InvokeError::WrongReceiver {
        expected: "lang.Map".into(),
    })
}

fn arg_str(args: &[Value], index: usize) -> Result<&str, InvokeError> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| InvokeError::argument(index, "expected a string"))
}

fn arg_index(args: &[Value], index: usize) -> Result<i64, InvokeError> {
    args.get(index)
        .and_then(Value::as_i64)
        .ok_or_else(|| InvokeError::argument(index, "expected an integer"))
}

fn clamp_char_index(text: &str, index: i64) -> usize {
    let len = text.chars().count();
    usize::try_from(index.max(0)).unwrap_or(usize::MAX).min(len)
}

fn string_type() -> HostType {
    HostType::builder("lang.String")
        .constructor(Visibility::Public, |args| {
            Ok(Value::String(
                args.first().map(ToString::to_string).unwrap_or_default(),
            ))
        })
        .value_method("length", Visibility::Public, |receiver, args| {
            InvokeError::check_arity(args, 0)?;
            Ok(receiver_str(receiver)?.chars().count().into())
        })
        .value_method("isEmpty", Visibility::Public, |receiver, args| {
            InvokeError::check_arity(args, 0)?;
            Ok(receiver_str(receiver)?.is_empty().into())
        })
        .value_method("toUpperCase", Visibility::Public, |receiver, args| {
            InvokeError::check_arity(args, 0)?;
            Ok(receiver_str(receiver)?.to_uppercase().into())
        })
        .value_method("toLowerCase", Visibility::Public, |receiver, args| {
            InvokeError::check_arity(args, 0)?;
            Ok(receiver_str(receiver)?.to_lowercase().into())
        })
        .value_method("trim", Visibility::Public, |receiver, args| {
            InvokeError::check_arity(args, 0)?;
            Ok(receiver_str(receiver)?.trim().into())
        })
        .value_method("startsWith", Visibility::Public, |receiver, args| {
            InvokeError::check_arity(args, 1)?;
            Ok(receiver_str(receiver)?.starts_with(arg_str(args, 0)?).into())
        })
        .value_method("endsWith", Visibility::Public, |receiver, args| {
            InvokeError::check_arity(args, 1)?;
            Ok(receiver_str(receiver)?.ends_with(arg_str(args, 0)?).into())
        })
        .value_method("contains", Visibility::Public, |receiver, args| {
            InvokeError::check_arity(args, 1)?;
            Ok(receiver_str(receiver)?.contains(arg_str(args, 0)?).into())
        })
        .value_method("replace", Visibility::Public, |receiver, args| {
            InvokeError::check_arity(args, 2)?;
            Ok(receiver_str(receiver)?
                .replace(arg_str(args, 0)?, arg_str(args, 1)?)
                .into())
        })
        .value_method("split", Visibility::Public, |receiver, args| {
            InvokeError::check_arity(args, 1)?;
            let parts = receiver_str(receiver)?
                .split(arg_str(args, 0)?)
                .map(Value::from)
                .collect::<Vec<_>>();
            Ok(Value::List(parts))
        })
        .value_method("substring", Visibility::Public, |receiver, args| {
            let text = receiver_str(receiver)?;
            let start = clamp_char_index(text, arg_index(args, 0)?);
            let end = match args.len() {
                1 => text.chars().count(),
                2 => clamp_char_index(text, arg_index(args, 1)?),
                actual => return Err(InvokeError::Arity { expected: 2, actual }),
            };
            let result: String = text
                .chars()
                .skip(start)
                .take(end.saturating_sub(start))
                .collect();
            Ok(result.into())
        })
        .build()
}

fn integer_type() -> HostType {
    HostType::builder("lang.Integer")
        .constructor(Visibility::Public, |args| {
            InvokeError::check_arity(args, 1)?;
            match &args[0] {
                Value::Integer(i) => Ok(Value::Integer(*i)),
                Value::Decimal(d) => Ok(Value::Integer(d.trunc() as i64)),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::Integer)
                    .map_err(|e| InvokeError::argument(0, e.to_string())),
                other => Err(InvokeError::argument(
                    0,
                    format!("cannot convert {} to lang.Integer", other.type_name()),
                )),
            }
        })
        .value_method("abs", Visibility::Public, |receiver, args| {
            InvokeError::check_arity(args, 0)?;
            receiver
                .as_i64()
                .map(|i| Value::Integer(i.saturating_abs()))
                .ok_or_else(|| InvokeError::WrongReceiver {
                    expected: "lang.Integer".into(),
                })
        })
        .build()
}

fn double_type() -> HostType {
    fn unary(name: &'static str, op: fn(f64) -> f64) -> impl Fn(&Value, &[Value]) -> Result<Value, InvokeError> {
        move |receiver, args| {
            InvokeError::check_arity(args, 0)?;
            receiver
                .as_f64()
                .map(|d| Value::Decimal(op(d)))
                .ok_or_else(|| InvokeError::Failed(format!("{name} expects a number")))
        }
    }

    HostType::builder("lang.Double")
        .constructor(Visibility::Public, |args| {
            InvokeError::check_arity(args, 1)?;
            match &args[0] {
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Decimal)
                    .map_err(|e| InvokeError::argument(0, e.to_string())),
                other => other.as_f64().map(Value::Decimal).ok_or_else(|| {
                    InvokeError::argument(
                        0,
                        format!("cannot convert {} to lang.Double", other.type_name()),
                    )
                }),
            }
        })
        .value_method("abs", Visibility::Public, unary("abs", f64::abs))
        .value_method("floor", Visibility::Public, unary("floor", f64::floor))
        .value_method("ceil", Visibility::Public, unary("ceil", f64::ceil))
        .value_method("round", Visibility::Public, unary("round", f64::round))
        .build()
}

fn boolean_type() -> HostType {
    HostType::builder("lang.Boolean")
        .constructor(Visibility::Public, |args| {
            InvokeError::check_arity(args, 1)?;
            match &args[0] {
                Value::Boolean(b) => Ok(Value::Boolean(*b)),
                Value::String(s) => Ok(Value::Boolean(s.eq_ignore_ascii_case("true"))),
                other => Err(InvokeError::argument(
                    0,
                    format!("cannot convert {} to lang.Boolean", other.type_name()),
                )),
            }
        })
        .build()
}

fn list_type() -> HostType {
    HostType::builder("lang.List")
        .constructor(Visibility::Public, |args| Ok(Value::List(args.to_vec())))
        .value_method("size", Visibility::Public, |receiver, args| {
            InvokeError::check_arity(args, 0)?;
            Ok(receiver_list(receiver)?.len().into())
        })
        .value_method("isEmpty", Visibility::Public, |receiver, args| {
            InvokeError::check_arity(args, 0)?;
            Ok(receiver_list(receiver)?.is_empty().into())
        })
        .value_method("contains", Visibility::Public, |receiver, args| {
            InvokeError::check_arity(args, 1)?;
            Ok(receiver_list(receiver)?.contains(&args[0]).into())
        })
        .value_method("get", Visibility::Public, |receiver, args| {
            InvokeError::check_arity(args, 1)?;
            let items = receiver_list(receiver)?;
            let index = arg_index(args, 0)?;
            usize::try_from(index)
                .ok()
                .and_then(|i| items.get(i))
                .cloned()
                .ok_or_else(|| InvokeError::Failed(format!("index {index} out of bounds")))
        })
        .value_method("first", Visibility::Public, |receiver, args| {
            InvokeError::check_arity(args, 0)?;
            Ok(receiver_list(receiver)?.first().cloned().unwrap_or_default())
        })
        .value_method("last", Visibility::Public, |receiver, args| {
            InvokeError::check_arity(args, 0)?;
            Ok(receiver_list(receiver)?.last().cloned().unwrap_or_default())
        })
        .build()
}

fn map_type() -> HostType {
    HostType::builder("lang.Map")
        .constructor(Visibility::Public, |args| {
            InvokeError::check_arity(args, 0)?;
            Ok(Value::Map(ValueMap::new()))
        })
        .value_method("size", Visibility::Public, |receiver, args| {
            InvokeError::check_arity(args, 0)?;
            Ok(receiver_map(receiver)?.len().into())
        })
        .value_method("isEmpty", Visibility::Public, |receiver, args| {
            InvokeError::check_arity(args, 0)?;
            Ok(receiver_map(receiver)?.is_empty().into())
        })
        .value_method("containsKey", Visibility::Public, |receiver, args| {
            InvokeError::check_arity(args, 1)?;
            Ok(receiver_map(receiver)?.contains_key(arg_str(args, 0)?).into())
        })
        .value_method("get", Visibility::Public, |receiver, args| {
            InvokeError::check_arity(args, 1)?;
            Ok(receiver_map(receiver)?
                .get(arg_str(args, 0)?)
                .cloned()
                .unwrap_or_default())
        })
        .value_method("keys", Visibility::Public, |receiver, args| {
            InvokeError::check_arity(args, 0)?;
            Ok(Value::List(
                receiver_map(receiver)?.keys().map(|k| Value::from(k.as_str())).collect(),
            ))
        })
        .value_method("values", Visibility::Public, |receiver, args| {
            InvokeError::check_arity(args, 0)?;
            Ok(Value::List(receiver_map(receiver)?.values().cloned().collect()))
        })
        .build()
}
