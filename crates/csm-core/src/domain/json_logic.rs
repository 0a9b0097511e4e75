//! JSON-logic rule evaluation for structured transition guards.

use serde_json::Value;

use crate::domain::coercion::{compare, loose_eq, number_value, strict_eq, to_display_string, to_number};
use crate::error::{CoreError, CoreResult};
use crate::types::lookup_value_path;

/// JSON-logic truthiness: like expression truthiness, but an empty array is false
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Array(items) => !items.is_empty(),
        other => crate::domain::coercion::truthy(Some(other)),
    }
}

/// Apply a rule to data
pub fn apply(rule: &Value, data: &Value) -> CoreResult<Value> {
    let (op, raw_args) = match rule {
        Value::Object(map) if map.len() == 1 => match map.iter().next() {
            Some((op, args)) => (op.as_str(), args),
            None => return Ok(rule.clone()),
        },
        Value::Array(items) => {
            return items
                .iter()
                .map(|item| apply(item, data))
                .collect::<CoreResult<Vec<_>>>()
                .map(Value::Array)
        }
        _ => return Ok(rule.clone()),
    };

    let args: Vec<&Value> = match raw_args {
        Value::Array(items) => items.iter().collect(),
        single => vec![single],
    };

    match op {
        "if" | "?:" => apply_if(&args, data),
        "and" => {
            let mut last = Value::Bool(true);
            for arg in &args {
                last = apply(arg, data)?;
                if !truthy(&last) {
                    return Ok(last);
                }
            }
            Ok(last)
        }
        "or" => {
            let mut last = Value::Bool(false);
            for arg in &args {
                last = apply(arg, data)?;
                if truthy(&last) {
                    return Ok(last);
                }
            }
            Ok(last)
        }
        "map" | "filter" | "all" | "some" | "none" => apply_array_op(op, &args, data),
        _ => {
            let values = args
                .iter()
                .map(|arg| apply(arg, data))
                .collect::<CoreResult<Vec<_>>>()?;
            apply_eager(op, &values, data)
        }
    }
}

fn apply_if(args: &[&Value], data: &Value) -> CoreResult<Value> {
    let mut index = 0;
    while index + 1 < args.len() {
        if truthy(&apply(args[index], data)?) {
            return apply(args[index + 1], data);
        }
        index += 2;
    }
    match args.get(index) {
        Some(otherwise) => apply(otherwise, data),
        None => Ok(Value::Null),
    }
}

fn apply_array_op(op: &str, args: &[&Value], data: &Value) -> CoreResult<Value> {
    let items = match args.first() {
        Some(source) => match apply(source, data)? {
            Value::Array(items) => items,
            _ => Vec::new(),
        },
        None => Vec::new(),
    };
    let scoped = args.get(1).copied().unwrap_or(&Value::Null);

    match op {
        "map" => items
            .iter()
            .map(|item| apply(scoped, item))
            .collect::<CoreResult<Vec<_>>>()
            .map(Value::Array),
        "filter" => {
            let mut kept = Vec::new();
            for item in items {
                if truthy(&apply(scoped, &item)?) {
                    kept.push(item);
                }
            }
            Ok(Value::Array(kept))
        }
        "all" => {
            if items.is_empty() {
                return Ok(Value::Bool(false));
            }
            for item in &items {
                if !truthy(&apply(scoped, item)?) {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }
        "some" | "none" => {
            let mut found = false;
            for item in &items {
                if truthy(&apply(scoped, item)?) {
                    found = true;
                    break;
                }
            }
            Ok(Value::Bool(if op == "some" { found } else { !found }))
        }
        _ => Err(CoreError::ConditionEvaluationError(format!("Unrecognized operation {}", op))),
    }
}

fn var(data: &Value, path: Option<&Value>, default: Option<&Value>) -> Value {
    let path = match path {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => to_display_string(Some(other)),
    };
    lookup_value_path(data, &path)
        .cloned()
        .or_else(|| default.cloned())
        .unwrap_or(Value::Null)
}

fn is_missing(data: &Value, key: &Value) -> bool {
    matches!(var(data, Some(key), None), Value::Null) || var(data, Some(key), None) == Value::String(String::new())
}

fn apply_eager(op: &str, args: &[Value], data: &Value) -> CoreResult<Value> {
    let arg = |index: usize| args.get(index);
    let num = |index: usize| to_number(arg(index));

    let value = match op {
        "var" => var(data, arg(0), arg(1)),
        "missing" => {
            let keys: Vec<Value> = match arg(0) {
                Some(Value::Array(keys)) => keys.clone(),
                _ => args.to_vec(),
            };
            Value::Array(keys.into_iter().filter(|key| is_missing(data, key)).collect())
        }
        "missing_some" => {
            let needed = num(0);
            let keys = match arg(1) {
                Some(Value::Array(keys)) => keys.clone(),
                _ => Vec::new(),
            };
            let missing: Vec<Value> = keys.iter().filter(|key| is_missing(data, key)).cloned().collect();
            let present = (keys.len() - missing.len()) as f64;
            if present >= needed {
                Value::Array(Vec::new())
            } else {
                Value::Array(missing)
            }
        }
        "==" => Value::Bool(loose_eq(arg(0), arg(1))),
        "!=" => Value::Bool(!loose_eq(arg(0), arg(1))),
        "===" => Value::Bool(strict_eq(arg(0), arg(1))),
        "!==" => Value::Bool(!strict_eq(arg(0), arg(1))),
        "!" => Value::Bool(!arg(0).map(truthy).unwrap_or(false)),
        "!!" => Value::Bool(arg(0).map(truthy).unwrap_or(false)),
        ">" => Value::Bool(ordered(arg(0), arg(1), |o| o.is_gt())),
        ">=" => Value::Bool(ordered(arg(0), arg(1), |o| o.is_ge())),
        "<" | "<=" => {
            let check = |o: std::cmp::Ordering| if op == "<" { o.is_lt() } else { o.is_le() };
            if args.len() >= 3 {
                Value::Bool(ordered(arg(0), arg(1), check) && ordered(arg(1), arg(2), check))
            } else {
                Value::Bool(ordered(arg(0), arg(1), check))
            }
        }
        "+" => number_value(args.iter().map(|v| to_number(Some(v))).sum()),
        "*" => number_value(args.iter().map(|v| to_number(Some(v))).product()),
        "-" => {
            if args.len() == 1 {
                number_value(-num(0))
            } else {
                number_value(num(0) - num(1))
            }
        }
        "/" => number_value(num(0) / num(1)),
        "%" => number_value(num(0) % num(1)),
        "min" | "max" => {
            let numbers: Vec<f64> = args.iter().map(|v| to_number(Some(v))).collect();
            if numbers.is_empty() {
                Value::Null
            } else if op == "min" {
                number_value(numbers.into_iter().fold(f64::INFINITY, f64::min))
            } else {
                number_value(numbers.into_iter().fold(f64::NEG_INFINITY, f64::max))
            }
        }
        "in" => match arg(1) {
            Some(Value::String(haystack)) => Value::Bool(haystack.contains(&to_display_string(arg(0)))),
            Some(Value::Array(items)) => Value::Bool(items.iter().any(|item| strict_eq(Some(item), arg(0)))),
            _ => Value::Bool(false),
        },
        "cat" => Value::String(args.iter().map(|v| to_display_string(Some(v))).collect()),
        "substr" => {
            let source: Vec<char> = to_display_string(arg(0)).chars().collect();
            let len = source.len() as i64;
            let start = num(1) as i64;
            let start = if start < 0 { (len + start).max(0) } else { start.min(len) };
            let end = match arg(2) {
                Some(count) => {
                    let count = to_number(Some(count)) as i64;
                    if count < 0 {
                        (len + count).max(start)
                    } else {
                        (start + count).min(len)
                    }
                }
                None => len,
            };
            Value::String(source[start as usize..end as usize].iter().collect())
        }
        "merge" => Value::Array(
            args.iter()
                .flat_map(|v| match v {
                    Value::Array(items) => items.clone(),
                    other => vec![other.clone()],
                })
                .collect(),
        ),
        _ => {
            return Err(CoreError::ConditionEvaluationError(format!(
                "Unrecognized operation {}",
                op
            )))
        }
    };

    Ok(value)
}

fn ordered(left: Option<&Value>, right: Option<&Value>, check: impl Fn(std::cmp::Ordering) -> bool) -> bool {
    compare(left, right).map(check).unwrap_or(false)
}
