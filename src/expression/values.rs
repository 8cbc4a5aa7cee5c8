//! Runtime semantics of operators over `serde_json::Value`
//!
//! `null` is the absent value. Every operator has a fixed answer for absent
//! operands:
//!
//! | operation            | null, null | null, x   | x, null |
//! |----------------------|------------|-----------|---------|
//! | `+`                  | 0          | x         | x       |
//! | `-`                  | 0          | -x        | x       |
//! | `*`                  | 0          | 0         | 0       |
//! | `/`                  | 0          | 0         | x       |
//! | `==`                 | true       | false     | false   |
//! | `<` `>` `<=` `>=`    | false      | false     | false   |
//! | contains/starts/ends | true       | false     | true    |
//! | matches              | false      | false     | false   |
//!
//! Unary: `-null` is null, `length(null)` is 0, `is_empty(null)` is true,
//! `as_string(null)` is null.

use std::cmp::Ordering;

use regex::Regex;
use serde_json::Value;

use super::ast::{BinaryOp, UnaryOp};
use super::errors::{ExpressionError, ExpressionResult};

/// Apply a unary operator
pub fn apply_unary(op: UnaryOp, value: &Value) -> ExpressionResult<Value> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!truthy(value)?)),
        UnaryOp::Negate => negate(value),
        UnaryOp::IsNull => Ok(Value::Bool(value.is_null())),
        UnaryOp::IsNotNull => Ok(Value::Bool(!value.is_null())),
        UnaryOp::AsString => Ok(match value {
            Value::Null => Value::Null,
            other => Value::String(display_string(other)),
        }),
        UnaryOp::Length => match value {
            Value::Null => Ok(Value::from(0)),
            Value::String(s) => Ok(Value::from(s.chars().count() as i64)),
            other => Err(type_error("length", "string", other)),
        },
        UnaryOp::IsEmpty => match value {
            Value::Null => Ok(Value::Bool(true)),
            Value::String(s) => Ok(Value::Bool(s.is_empty())),
            Value::Array(items) => Ok(Value::Bool(items.is_empty())),
            other => Err(type_error("is_empty", "string or list", other)),
        },
        UnaryOp::ToLower => map_string(value, "to_lower", |s| s.to_lowercase()),
        UnaryOp::ToUpper => map_string(value, "to_upper", |s| s.to_uppercase()),
        UnaryOp::Trim => map_string(value, "trim", |s| s.trim().to_string()),
        UnaryOp::Count => match value {
            Value::Null => Ok(Value::from(0)),
            Value::Array(items) => Ok(Value::from(items.len() as i64)),
            other => Err(type_error("count", "list", other)),
        },
        UnaryOp::Any => match value {
            Value::Null => Ok(Value::Bool(false)),
            Value::Array(items) => {
                for item in items {
                    if truthy(item)? {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            other => Err(type_error("any", "list", other)),
        },
        UnaryOp::All => match value {
            Value::Null => Ok(Value::Bool(true)),
            Value::Array(items) => {
                for item in items {
                    if !truthy(item)? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            other => Err(type_error("all", "list", other)),
        },
    }
}

/// Apply a binary operator to evaluated operands.
///
/// `And` and `Or` are short-circuited by the compiler and only reach this
/// function with both sides evaluated. `Matches` with a constant pattern is
/// also handled by the compiler, which precompiles the pattern.
pub fn apply_binary(op: BinaryOp, left: &Value, right: &Value) -> ExpressionResult<Value> {
    match op {
        BinaryOp::Add => add(left, right),
        BinaryOp::Subtract => subtract(left, right),
        BinaryOp::Multiply => multiply(left, right),
        BinaryOp::Divide => divide(left, right),
        BinaryOp::Equals => Ok(Value::Bool(values_equal(left, right))),
        BinaryOp::GreaterThan => ordered(left, right, |o| o == Ordering::Greater),
        BinaryOp::GreaterOrEqual => ordered(left, right, |o| o != Ordering::Less),
        BinaryOp::LessThan => ordered(left, right, |o| o == Ordering::Less),
        BinaryOp::LessOrEqual => ordered(left, right, |o| o != Ordering::Greater),
        BinaryOp::And => Ok(Value::Bool(truthy(left)? && truthy(right)?)),
        BinaryOp::Or => Ok(Value::Bool(truthy(left)? || truthy(right)?)),
        BinaryOp::Contains => contains(left, right),
        BinaryOp::StartsWith => string_test(left, right, "starts_with", |s, p| s.starts_with(p)),
        BinaryOp::EndsWith => string_test(left, right, "ends_with", |s, p| s.ends_with(p)),
        BinaryOp::Matches => match (left, right) {
            (Value::Null, _) | (_, Value::Null) => Ok(Value::Bool(false)),
            (_, Value::String(pattern)) => {
                let regex = compile_pattern(pattern)?;
                regex_test(&regex, left)
            }
            (_, other) => Err(type_error("matches", "string pattern", other)),
        },
        BinaryOp::Concat => Ok(Value::String(format!(
            "{}{}",
            concat_part(left),
            concat_part(right)
        ))),
        BinaryOp::In => match right {
            Value::Null => Ok(Value::Bool(false)),
            Value::Array(items) => Ok(Value::Bool(items.iter().any(|i| values_equal(left, i)))),
            other => Err(type_error("in", "list", other)),
        },
    }
}

/// Boolean reading of a value; absent reads as false
pub fn truthy(value: &Value) -> ExpressionResult<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        other => Err(type_error("condition", "boolean", other)),
    }
}

/// Compile a regular expression
pub fn compile_pattern(pattern: &str) -> ExpressionResult<Regex> {
    Regex::new(pattern).map_err(|e| ExpressionError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Unanchored regex search; absent input never matches
pub fn regex_test(regex: &Regex, value: &Value) -> ExpressionResult<Value> {
    match value {
        Value::Null => Ok(Value::Bool(false)),
        Value::String(s) => Ok(Value::Bool(regex.is_match(s))),
        other => Err(type_error("matches", "string", other)),
    }
}

/// Equality with numeric promotion; null equals only null
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => {
            compare_values(left, right) == Some(Ordering::Equal)
        }
        (a, b) => a == b,
    }
}

/// Natural order between two present scalars of compatible kinds
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Sort order with absent values first
pub fn sort_order(left: &Value, right: &Value) -> ExpressionResult<Ordering> {
    match (left, right) {
        (Value::Null, Value::Null) => Ok(Ordering::Equal),
        (Value::Null, _) => Ok(Ordering::Less),
        (_, Value::Null) => Ok(Ordering::Greater),
        (a, b) => compare_values(a, b).ok_or_else(|| {
            ExpressionError::TypeError(format!("cannot order {} against {}", kind(a), kind(b)))
        }),
    }
}

fn ordered(
    left: &Value,
    right: &Value,
    test: impl Fn(Ordering) -> bool,
) -> ExpressionResult<Value> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Bool(false));
    }
    match compare_values(left, right) {
        Some(ordering) => Ok(Value::Bool(test(ordering))),
        None => Err(ExpressionError::TypeError(format!(
            "cannot compare {} with {}",
            kind(left),
            kind(right)
        ))),
    }
}

// ==================
// Arithmetic
// ==================

enum Numeric {
    Int(i64),
    Float(f64),
}

fn numeric(op: &str, value: &Value) -> ExpressionResult<Numeric> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(Numeric::Int(i)),
            None => n
                .as_f64()
                .map(Numeric::Float)
                .ok_or_else(|| type_error(op, "number", value)),
        },
        other => Err(type_error(op, "number", other)),
    }
}

fn as_float(n: &Numeric) -> f64 {
    match n {
        Numeric::Int(i) => *i as f64,
        Numeric::Float(f) => *f,
    }
}

fn float_value(op: &str, f: f64) -> ExpressionResult<Value> {
    if f.is_finite() {
        Ok(Value::from(f))
    } else {
        Err(ExpressionError::Overflow(op.to_string()))
    }
}

fn arithmetic(
    op: &str,
    left: &Value,
    right: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> ExpressionResult<Value> {
    let l = numeric(op, left)?;
    let r = numeric(op, right)?;
    match (&l, &r) {
        (Numeric::Int(a), Numeric::Int(b)) => int_op(*a, *b)
            .map(Value::from)
            .ok_or_else(|| ExpressionError::Overflow(op.to_string())),
        _ => float_value(op, float_op(as_float(&l), as_float(&r))),
    }
}

fn add(left: &Value, right: &Value) -> ExpressionResult<Value> {
    match (left, right) {
        (Value::Null, Value::Null) => Ok(Value::from(0)),
        (Value::Null, x) | (x, Value::Null) => Ok(x.clone()),
        (a, b) => arithmetic("+", a, b, i64::checked_add, |x, y| x + y),
    }
}

fn subtract(left: &Value, right: &Value) -> ExpressionResult<Value> {
    match (left, right) {
        (Value::Null, Value::Null) => Ok(Value::from(0)),
        (Value::Null, x) => negate(x),
        (x, Value::Null) => Ok(x.clone()),
        (a, b) => arithmetic("-", a, b, i64::checked_sub, |x, y| x - y),
    }
}

fn multiply(left: &Value, right: &Value) -> ExpressionResult<Value> {
    match (left, right) {
        (Value::Null, _) | (_, Value::Null) => Ok(Value::from(0)),
        (a, b) => arithmetic("*", a, b, i64::checked_mul, |x, y| x * y),
    }
}

fn divide(left: &Value, right: &Value) -> ExpressionResult<Value> {
    match (left, right) {
        (Value::Null, _) => Ok(Value::from(0)),
        (x, Value::Null) => Ok(x.clone()),
        (a, b) => {
            let l = numeric("/", a)?;
            let r = numeric("/", b)?;
            match (&l, &r) {
                (Numeric::Int(_), Numeric::Int(0)) => Err(ExpressionError::DivisionByZero),
                (Numeric::Int(x), Numeric::Int(y)) => x
                    .checked_div(*y)
                    .map(Value::from)
                    .ok_or_else(|| ExpressionError::Overflow("/".to_string())),
                _ => {
                    let divisor = as_float(&r);
                    if divisor == 0.0 {
                        return Err(ExpressionError::DivisionByZero);
                    }
                    float_value("/", as_float(&l) / divisor)
                }
            }
        }
    }
}

fn negate(value: &Value) -> ExpressionResult<Value> {
    match value {
        Value::Null => Ok(Value::Null),
        other => match numeric("-", other)? {
            Numeric::Int(i) => i
                .checked_neg()
                .map(Value::from)
                .ok_or_else(|| ExpressionError::Overflow("-".to_string())),
            Numeric::Float(f) => float_value("-", -f),
        },
    }
}

// ==================
// Strings
// ==================

fn contains(left: &Value, right: &Value) -> ExpressionResult<Value> {
    match left {
        Value::Array(items) => Ok(Value::Bool(items.iter().any(|i| values_equal(i, right)))),
        _ => string_test(left, right, "contains", |s, p| s.contains(p)),
    }
}

fn string_test(
    left: &Value,
    right: &Value,
    op: &str,
    test: impl Fn(&str, &str) -> bool,
) -> ExpressionResult<Value> {
    match (left, right) {
        (Value::Null, Value::Null) => Ok(Value::Bool(true)),
        (Value::Null, _) => Ok(Value::Bool(false)),
        (_, Value::Null) => Ok(Value::Bool(true)),
        (Value::String(s), Value::String(p)) => Ok(Value::Bool(test(s, p))),
        (Value::String(_), other) | (other, _) => Err(type_error(op, "string", other)),
    }
}

fn map_string(value: &Value, op: &str, f: impl Fn(&str) -> String) -> ExpressionResult<Value> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::String(s) => Ok(Value::String(f(s))),
        other => Err(type_error(op, "string", other)),
    }
}

fn concat_part(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        other => display_string(other),
    }
}

fn display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "entity",
    }
}

fn type_error(op: &str, expected: &str, found: &Value) -> ExpressionError {
    ExpressionError::TypeError(format!("{} expects {}, found {}", op, expected, kind(found)))
}
