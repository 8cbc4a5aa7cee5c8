//! # Filter Translation
//!
//! Turns a declarative filter into a predicate over a typed argument. Only
//! fields that are present contribute; they are conjoined in a fixed order
//! so that equal filters translate to structurally equal expressions.

use std::collections::HashSet;

use serde_json::Value;

use crate::expression::{compose, Expression, ExpressionError, ExpressionResult, ValueType};
use crate::schema::SchemaRegistry;

use super::model::{BooleanFilter, ComparableFilter, Filter, ObjectFilter, StringFilter};

/// Translate `filter` into a predicate over `argument`.
///
/// Returns `None` when the filter sets no field.
pub fn to_expression(
    registry: &SchemaRegistry,
    filter: &Filter,
    argument: &Expression,
) -> ExpressionResult<Option<Expression>> {
    match filter {
        Filter::Comparable(f) => Ok(comparable(f, argument)),
        Filter::String(f) => Ok(string(f, argument)),
        Filter::Boolean(f) => Ok(boolean(f, argument)),
        Filter::Object(f) => object(registry, f, argument),
    }
}

/// Free-text search: any searchable property (as text) contains `text`.
///
/// Entity-typed searchable properties are searched through their own
/// searchable properties. Returns `None` when nothing is searchable.
pub fn search_text(
    registry: &SchemaRegistry,
    argument: &Expression,
    text: &str,
) -> ExpressionResult<Option<Expression>> {
    let mut visited = HashSet::new();
    search_in(registry, argument, text, &mut visited)
}

fn search_in(
    registry: &SchemaRegistry,
    target: &Expression,
    text: &str,
    visited: &mut HashSet<String>,
) -> ExpressionResult<Option<Expression>> {
    let entity = match target.value_type() {
        ValueType::Entity { entity } => entity,
        other => {
            return Err(ExpressionError::mismatch("search", "entity", other));
        }
    };
    if !visited.insert(entity.clone()) {
        return Ok(None);
    }
    let descriptor = registry
        .get(&entity)
        .ok_or_else(|| ExpressionError::UnknownEntity(entity.clone()))?;

    let mut alternatives = Vec::new();
    for property in descriptor.searchable_properties() {
        let value = target
            .clone()
            .property(&property.name, property.value_type.clone());
        let term = match &property.value_type {
            ValueType::String => Some(value.contains(text)),
            ValueType::Entity { .. } => search_in(registry, &value, text, visited)?,
            _ => Some(value.as_string().contains(text)),
        };
        alternatives.extend(term);
    }
    visited.remove(&entity);

    Ok(alternatives.into_iter().reduce(|a, b| a.or(b)))
}

fn conjoin(terms: Vec<Expression>) -> Option<Expression> {
    terms.into_iter().reduce(|a, b| a.and(b))
}

fn typed(value: &Value, value_type: &ValueType) -> Expression {
    Expression::typed_constant(value.clone(), value_type.clone())
}

fn comparable_terms(f: &ComparableFilter, arg: &Expression) -> Vec<Expression> {
    let t = arg.value_type();
    let mut terms = Vec::new();
    if let Some(v) = &f.eq {
        terms.push(arg.clone().equal_to(typed(v, &t)));
    }
    if let Some(v) = &f.not_eq {
        terms.push(arg.clone().not_equal_to(typed(v, &t)));
    }
    if let Some(v) = &f.gt {
        terms.push(arg.clone().greater_than(typed(v, &t)));
    }
    if let Some(v) = &f.lt {
        terms.push(arg.clone().less_than(typed(v, &t)));
    }
    if let Some(v) = &f.gte {
        terms.push(arg.clone().greater_or_equal(typed(v, &t)));
    }
    if let Some(v) = &f.lte {
        terms.push(arg.clone().less_or_equal(typed(v, &t)));
    }
    if let Some(range) = &f.between {
        terms.push(arg.clone().between(typed(&range.min, &t), typed(&range.max, &t)));
    }
    if let Some(range) = &f.between_exclusive {
        terms.push(
            arg.clone()
                .between_exclusive(typed(&range.min, &t), typed(&range.max, &t)),
        );
    }
    if let Some(values) = &f.eq_any {
        let list = Expression::typed_constant(Value::Array(values.clone()), ValueType::list(t.clone()));
        terms.push(arg.clone().is_in(list));
    }
    if let Some(is_null) = f.is_null {
        terms.push(null_test(arg, is_null));
    }
    terms
}

fn null_test(arg: &Expression, is_null: bool) -> Expression {
    if is_null {
        arg.clone().is_null()
    } else {
        arg.clone().is_not_null()
    }
}

fn comparable(f: &ComparableFilter, arg: &Expression) -> Option<Expression> {
    conjoin(comparable_terms(f, arg))
}

fn string(f: &StringFilter, arg: &Expression) -> Option<Expression> {
    let mut terms = comparable_terms(&f.comparable, arg);
    if let Some(s) = &f.contains {
        terms.push(arg.clone().contains(s.as_str()));
    }
    if let Some(s) = &f.starts_with {
        terms.push(arg.clone().starts_with(s.as_str()));
    }
    if let Some(s) = &f.ends_with {
        terms.push(arg.clone().ends_with(s.as_str()));
    }
    if let Some(pattern) = &f.matches {
        terms.push(arg.clone().matches(pattern.as_str()));
    }
    if let Some(is_empty) = f.is_empty {
        let empty = arg.clone().is_empty();
        terms.push(if is_empty { empty } else { !empty });
    }
    conjoin(terms)
}

fn boolean(f: &BooleanFilter, arg: &Expression) -> Option<Expression> {
    let mut terms = Vec::new();
    if let Some(v) = f.eq {
        terms.push(arg.clone().equal_to(v));
    }
    if let Some(v) = f.not_eq {
        terms.push(arg.clone().not_equal_to(v));
    }
    if let Some(is_null) = f.is_null {
        terms.push(null_test(arg, is_null));
    }
    conjoin(terms)
}

fn object(
    registry: &SchemaRegistry,
    f: &ObjectFilter,
    arg: &Expression,
) -> ExpressionResult<Option<Expression>> {
    let t = arg.value_type();
    let mut terms = Vec::new();

    if !f.properties.is_empty() {
        let entity = t
            .entity_name()
            .ok_or_else(|| ExpressionError::mismatch("object filter", "entity", &t))?;
        let descriptor = registry
            .get(entity)
            .ok_or_else(|| ExpressionError::UnknownEntity(entity.to_string()))?;

        for (name, nested) in &f.properties {
            let property = descriptor
                .property(name)
                .ok_or_else(|| ExpressionError::PathResolution {
                    entity: entity.to_string(),
                    path: name.clone(),
                    segment: name.clone(),
                })?;
            if !property.capabilities.filterable {
                return Err(ExpressionError::NotFilterable {
                    entity: entity.to_string(),
                    property: name.clone(),
                });
            }

            let element = Expression::argument(property.value_type.clone());
            if let Some(predicate) = to_expression(registry, nested, &element)? {
                let target = arg.clone().property(name, property.value_type.clone());
                terms.push(compose(&target, &predicate)?);
            }
        }
    }

    if let Some(v) = &f.equals_to {
        terms.push(arg.clone().equal_to(typed(v, &t)));
    }
    if let Some(v) = &f.not_equals_to {
        terms.push(arg.clone().not_equal_to(typed(v, &t)));
    }
    if let Some(values) = &f.equals_to_any {
        let list = Expression::typed_constant(Value::Array(values.clone()), ValueType::list(t.clone()));
        terms.push(arg.clone().is_in(list));
    }
    if let Some(is_null) = f.is_null {
        terms.push(null_test(arg, is_null));
    }
    if let Some(text) = &f.search_text {
        terms.extend(search_text(registry, arg, text)?);
    }

    Ok(conjoin(terms))
}
