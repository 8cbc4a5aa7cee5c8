//! Expression compiler
//!
//! Turns a validated expression tree into a closure tree that evaluates one
//! instance at a time. Compilation happens once per query; evaluation is
//! per notification, so regex patterns given as constants are compiled here.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::ast::{BinaryOp, Expression, ValueType};
use super::errors::{ExpressionError, ExpressionResult};
use super::values::{apply_binary, apply_unary, compile_pattern, regex_test, sort_order, truthy};

type EvalFn = Arc<dyn Fn(&Value) -> ExpressionResult<Value> + Send + Sync>;

/// Executable form of an expression
#[derive(Clone)]
pub struct CompiledExpression {
    expression: Arc<Expression>,
    eval: EvalFn,
}

impl CompiledExpression {
    /// Evaluate against one instance
    pub fn evaluate(&self, instance: &Value) -> ExpressionResult<Value> {
        (self.eval)(instance)
    }

    /// The source expression
    pub fn expression(&self) -> &Expression {
        &self.expression
    }
}

impl fmt::Debug for CompiledExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledExpression")
            .field("expression", &self.expression.to_string())
            .finish()
    }
}

/// Compile an expression; fails with a validation error on ill-typed trees
pub fn compile(expr: &Expression) -> ExpressionResult<CompiledExpression> {
    expr.validate()?;
    Ok(CompiledExpression {
        expression: Arc::new(expr.clone()),
        eval: build(expr),
    })
}

fn build(expr: &Expression) -> EvalFn {
    match expr {
        Expression::Argument { .. } => Arc::new(|instance| Ok(instance.clone())),

        Expression::Constant { value, .. } => {
            let value = value.clone();
            Arc::new(move |_| Ok(value.clone()))
        }

        Expression::Property { source, name, .. } => {
            let source = build(source);
            let name = name.clone();
            Arc::new(move |instance| match source(instance)? {
                Value::Null => Ok(Value::Null),
                Value::Object(mut map) => Ok(map.remove(&name).unwrap_or(Value::Null)),
                other => Err(ExpressionError::TypeError(format!(
                    "property '{}' read from non-entity value {}",
                    name, other
                ))),
            })
        }

        Expression::Unary { op, operand } => {
            let op = *op;
            let operand = build(operand);
            Arc::new(move |instance| apply_unary(op, &operand(instance)?))
        }

        Expression::Binary {
            op: BinaryOp::And,
            left,
            right,
        } => {
            let (left, right) = (build(left), build(right));
            Arc::new(move |instance| {
                if !truthy(&left(instance)?)? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&right(instance)?)?))
            })
        }

        Expression::Binary {
            op: BinaryOp::Or,
            left,
            right,
        } => {
            let (left, right) = (build(left), build(right));
            Arc::new(move |instance| {
                if truthy(&left(instance)?)? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&right(instance)?)?))
            })
        }

        Expression::Binary { op, left, right } => {
            if let (BinaryOp::Matches, Expression::Constant { value: Value::String(p), .. }) =
                (op, right.as_ref())
            {
                return build_constant_match(left, p);
            }
            let op = *op;
            let (left, right) = (build(left), build(right));
            Arc::new(move |instance| apply_binary(op, &left(instance)?, &right(instance)?))
        }

        Expression::Conditional {
            test,
            then,
            otherwise,
        } => {
            let (test, then, otherwise) = (build(test), build(then), build(otherwise));
            Arc::new(move |instance| {
                if truthy(&test(instance)?)? {
                    then(instance)
                } else {
                    otherwise(instance)
                }
            })
        }

        Expression::Composed { outer, inner } => {
            let (outer, inner) = (build(outer), build(inner));
            Arc::new(move |instance| match outer(instance)? {
                Value::Null => Ok(Value::Null),
                Value::Array(items) => items
                    .iter()
                    .map(|item| inner(item))
                    .collect::<ExpressionResult<Vec<_>>>()
                    .map(Value::Array),
                single => inner(&single),
            })
        }
    }
}

fn build_constant_match(subject: &Expression, pattern: &str) -> EvalFn {
    let pattern = compile_pattern(pattern);
    let subject = build(subject);
    // An invalid constant pattern surfaces at evaluation, like a dynamic one
    Arc::new(move |instance| {
        let value = subject(instance)?;
        match &pattern {
            Ok(regex) => regex_test(regex, &value),
            Err(_) if value.is_null() => Ok(Value::Bool(false)),
            Err(e) => Err(e.clone()),
        }
    })
}

/// Compiled boolean expression
#[derive(Clone, Debug)]
pub struct CompiledPredicate {
    inner: CompiledExpression,
}

impl CompiledPredicate {
    /// Test one instance; an absent result does not match
    pub fn test(&self, instance: &Value) -> ExpressionResult<bool> {
        truthy(&self.inner.evaluate(instance)?)
    }

    pub fn expression(&self) -> &Expression {
        self.inner.expression()
    }
}

/// Compile a predicate; the expression must be boolean-typed
pub fn compile_predicate(expr: &Expression) -> ExpressionResult<CompiledPredicate> {
    expr.validate_predicate()?;
    Ok(CompiledPredicate {
        inner: compile(expr)?,
    })
}

/// Multi-key comparator.
///
/// Keys are compared left to right; the first non-equal key decides. Absent
/// keys sort before present ones in ascending order and after them in
/// descending order.
#[derive(Clone, Debug)]
pub struct CompiledComparator {
    keys: Vec<(CompiledExpression, bool)>,
}

impl CompiledComparator {
    /// Compare two instances
    pub fn compare(&self, a: &Value, b: &Value) -> ExpressionResult<Ordering> {
        for (key, ascending) in &self.keys {
            let ordering = sort_order(&key.evaluate(a)?, &key.evaluate(b)?)?;
            let ordering = if *ascending { ordering } else { ordering.reverse() };
            if ordering != Ordering::Equal {
                return Ok(ordering);
            }
        }
        Ok(Ordering::Equal)
    }

    /// Stable sort of arbitrary items by the value each one exposes.
    ///
    /// Keys are evaluated once per item before sorting.
    pub fn sort_by<T>(&self, items: &mut Vec<T>, value_of: impl Fn(&T) -> &Value) -> ExpressionResult<()> {
        if self.keys.is_empty() || items.len() < 2 {
            return Ok(());
        }

        let mut keys = Vec::with_capacity(items.len());
        for item in items.iter() {
            let row = self
                .keys
                .iter()
                .map(|(key, _)| key.evaluate(value_of(item)))
                .collect::<ExpressionResult<Vec<_>>>()?;
            keys.push(row);
        }

        let mut failure = None;
        let mut order: Vec<usize> = (0..items.len()).collect();
        order.sort_by(|&a, &b| {
            for ((x, y), (_, ascending)) in keys[a].iter().zip(keys[b].iter()).zip(self.keys.iter()) {
                let ordering = match sort_order(x, y) {
                    Ok(o) => o,
                    Err(e) => {
                        failure.get_or_insert(e);
                        Ordering::Equal
                    }
                };
                let ordering = if *ascending { ordering } else { ordering.reverse() };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
        if let Some(e) = failure {
            return Err(e);
        }

        let mut slots: Vec<Option<T>> = items.drain(..).map(Some).collect();
        items.extend(order.into_iter().filter_map(|i| slots[i].take()));
        Ok(())
    }

    /// Stable sort of instances
    pub fn sort(&self, items: &mut Vec<Value>) -> ExpressionResult<()> {
        self.sort_by(items, |v| v)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Compile a comparator from `(key, ascending)` pairs; keys must be comparable
pub fn compile_comparator<'a>(
    keys: impl IntoIterator<Item = (&'a Expression, bool)>,
) -> ExpressionResult<CompiledComparator> {
    let mut compiled = Vec::new();
    for (expr, ascending) in keys {
        let value_type = expr.validate()?;
        if !value_type.is_comparable() {
            return Err(ExpressionError::NotComparable(value_type.to_string()));
        }
        compiled.push((compile(expr)?, ascending));
    }
    Ok(CompiledComparator { keys: compiled })
}

/// Check that an expression can serve as a sort key
pub fn ensure_comparable(expr: &Expression) -> ExpressionResult<ValueType> {
    let value_type = expr.validate()?;
    if value_type.is_comparable() {
        Ok(value_type)
    } else {
        Err(ExpressionError::NotComparable(value_type.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn product() -> Expression {
        Expression::entity("Product")
    }

    fn number() -> Expression {
        product().property("number", ValueType::Integer)
    }

    fn text() -> Expression {
        product().property("text", ValueType::String)
    }

    #[test]
    fn test_property_access_and_missing_field() {
        let compiled = compile(&number()).unwrap();
        assert_eq!(compiled.evaluate(&json!({"number": 3})).unwrap(), json!(3));
        assert_eq!(compiled.evaluate(&json!({})).unwrap(), Value::Null);
    }

    #[test]
    fn test_and_short_circuits() {
        // Right side divides by zero
        let guard = number().is_not_null().and((number() / 0).greater_than(1));
        let predicate = compile_predicate(&guard).unwrap();
        assert!(!predicate.test(&json!({})).unwrap());
        assert!(predicate.test(&json!({"number": 1})).is_err());
    }

    #[test]
    fn test_constant_pattern_is_precompiled() {
        let predicate = compile_predicate(&text().matches("^Ent")).unwrap();
        assert!(predicate.test(&json!({"text": "Entity"})).unwrap());
        assert!(!predicate.test(&json!({"text": "entity"})).unwrap());
    }

    #[test]
    fn test_invalid_pattern_raised_at_evaluation() {
        let predicate = compile_predicate(&text().matches("[")).unwrap();
        let err = predicate.test(&json!({"text": "x"})).unwrap_err();
        assert!(matches!(err, ExpressionError::InvalidPattern { .. }));
        assert!(!predicate.test(&json!({})).unwrap());
    }

    #[test]
    fn test_conditional() {
        let expr = number().greater_than(2).when("big", "small");
        let compiled = compile(&expr).unwrap();
        assert_eq!(compiled.evaluate(&json!({"number": 3})).unwrap(), json!("big"));
        assert_eq!(compiled.evaluate(&json!({})).unwrap(), json!("small"));
    }

    #[test]
    fn test_composed_maps_list() {
        let tags = product().property("tags", ValueType::list(ValueType::String));
        let upper = super::super::compose(&tags, &Expression::argument(ValueType::String).to_upper())
            .unwrap();
        let compiled = compile(&upper).unwrap();
        assert_eq!(
            compiled.evaluate(&json!({"tags": ["a", "b"]})).unwrap(),
            json!(["A", "B"])
        );
        assert_eq!(compiled.evaluate(&json!({})).unwrap(), Value::Null);
    }

    #[test]
    fn test_predicate_must_be_boolean() {
        let err = compile_predicate(&number()).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_comparator_multi_key() {
        let comparator =
            compile_comparator([(&number(), true), (&text(), false)]).unwrap();
        let mut items = vec![
            json!({"number": 2, "text": "a"}),
            json!({"number": 1, "text": "a"}),
            json!({"number": 2, "text": "b"}),
            json!({"text": "z"}),
        ];
        comparator.sort(&mut items).unwrap();
        assert_eq!(
            items,
            vec![
                json!({"text": "z"}),
                json!({"number": 1, "text": "a"}),
                json!({"number": 2, "text": "b"}),
                json!({"number": 2, "text": "a"}),
            ]
        );
    }

    #[test]
    fn test_descending_puts_nulls_last() {
        let comparator = compile_comparator([(&number(), false)]).unwrap();
        let ordering = comparator
            .compare(&json!({}), &json!({"number": 1}))
            .unwrap();
        assert_eq!(ordering, Ordering::Greater);
    }

    #[test]
    fn test_comparator_rejects_entities() {
        let vendor = product().property("vendor", ValueType::entity("Vendor"));
        let err = compile_comparator([(&vendor, true)]).unwrap_err();
        assert!(matches!(err, ExpressionError::NotComparable(_)));
    }
}
