//! Aggregations over query results

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::expression::values::compare_values;
use crate::expression::{compile, Expression, ExpressionError, ExpressionResult};

/// Aggregate function over the (projected) results of a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fn", content = "of", rename_all = "lowercase")]
pub enum Aggregator {
    Count,
    Sum(Expression),
    Min(Expression),
    Max(Expression),
    Average(Expression),
}

impl Aggregator {
    /// Aggregate `items`; absent values are skipped.
    ///
    /// Returns `None` for min/max/average over no present values and a
    /// number otherwise. Count and sum of nothing are 0.
    pub fn apply(&self, items: &[Value]) -> ExpressionResult<Option<Value>> {
        match self {
            Aggregator::Count => Ok(Some(Value::from(items.len() as u64))),
            Aggregator::Sum(expr) => {
                let values = present_values(expr, items)?;
                sum(&values).map(Some)
            }
            Aggregator::Average(expr) => {
                let values = present_values(expr, items)?;
                if values.is_empty() {
                    return Ok(None);
                }
                let total = values
                    .iter()
                    .map(|v| v.as_f64().ok_or_else(|| not_numeric(v)))
                    .sum::<ExpressionResult<f64>>()?;
                Ok(Some(Value::from(total / values.len() as f64)))
            }
            Aggregator::Min(expr) => extreme(expr, items, Ordering::Less),
            Aggregator::Max(expr) => extreme(expr, items, Ordering::Greater),
        }
    }
}

fn present_values(expr: &Expression, items: &[Value]) -> ExpressionResult<Vec<Value>> {
    let compiled = compile(expr)?;
    let mut values = Vec::with_capacity(items.len());
    for item in items {
        let value = compiled.evaluate(item)?;
        if !value.is_null() {
            values.push(value);
        }
    }
    Ok(values)
}

fn sum(values: &[Value]) -> ExpressionResult<Value> {
    if values.iter().all(|v| v.is_i64()) {
        let mut total: i64 = 0;
        for v in values {
            let n = v.as_i64().unwrap_or_default();
            total = total
                .checked_add(n)
                .ok_or_else(|| ExpressionError::Overflow("sum".into()))?;
        }
        return Ok(Value::from(total));
    }
    let mut total = 0.0;
    for v in values {
        total += v.as_f64().ok_or_else(|| not_numeric(v))?;
    }
    Ok(Value::from(total))
}

fn extreme(expr: &Expression, items: &[Value], wanted: Ordering) -> ExpressionResult<Option<Value>> {
    let mut best: Option<Value> = None;
    for value in present_values(expr, items)? {
        best = match best {
            None => Some(value),
            Some(current) => match compare_values(&value, &current) {
                Some(ordering) if ordering == wanted => Some(value),
                Some(_) => Some(current),
                None => {
                    return Err(ExpressionError::TypeError(format!(
                        "cannot compare {} with {}",
                        value, current
                    )))
                }
            },
        };
    }
    Ok(best)
}

fn not_numeric(value: &Value) -> ExpressionError {
    ExpressionError::TypeError(format!("aggregate expects numbers, found {}", value))
}
