//! Expression composition
//!
//! `compose(outer, inner)` produces `inner ∘ outer`: `inner` applied to the
//! value `outer` produces. When `outer` produces a list whose element type
//! matches `inner`'s argument, the result maps `inner` over the elements.

use super::ast::{Expression, ValueType};
use super::errors::{ExpressionError, ExpressionResult};

/// Compose `inner` over the result of `outer`
pub fn compose(outer: &Expression, inner: &Expression) -> ExpressionResult<Expression> {
    let outer_type = outer.validate()?;
    let argument = match inner.argument_type()? {
        Some(argument) => argument,
        // Closed expression: nothing to substitute
        None => return Ok(inner.clone()),
    };

    if argument_accepts(&argument, &outer_type) {
        return Ok(substitute(inner, outer));
    }

    if let ValueType::List { element } = &outer_type {
        if argument_accepts(&argument, element) {
            return Ok(Expression::Composed {
                outer: Box::new(outer.clone()),
                inner: Box::new(inner.clone()),
            });
        }
    }

    Err(ExpressionError::mismatch(
        "composition",
        argument.to_string(),
        outer_type,
    ))
}

fn argument_accepts(argument: &ValueType, value: &ValueType) -> bool {
    match (argument, value) {
        (ValueType::Entity { entity: a }, ValueType::Entity { entity: b }) => a == b,
        (a, b) => a.is_compatible(b),
    }
}

/// Replace every argument of the current scope with `replacement`
fn substitute(expr: &Expression, replacement: &Expression) -> Expression {
    match expr {
        Expression::Argument { .. } => replacement.clone(),
        Expression::Constant { .. } => expr.clone(),
        Expression::Property {
            source,
            name,
            value_type,
        } => Expression::Property {
            source: Box::new(substitute(source, replacement)),
            name: name.clone(),
            value_type: value_type.clone(),
        },
        Expression::Unary { op, operand } => Expression::Unary {
            op: *op,
            operand: Box::new(substitute(operand, replacement)),
        },
        Expression::Binary { op, left, right } => Expression::Binary {
            op: *op,
            left: Box::new(substitute(left, replacement)),
            right: Box::new(substitute(right, replacement)),
        },
        Expression::Conditional {
            test,
            then,
            otherwise,
        } => Expression::Conditional {
            test: Box::new(substitute(test, replacement)),
            then: Box::new(substitute(then, replacement)),
            otherwise: Box::new(substitute(otherwise, replacement)),
        },
        // The inner scope keeps its own argument
        Expression::Composed { outer, inner } => Expression::Composed {
            outer: Box::new(substitute(outer, replacement)),
            inner: inner.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product() -> Expression {
        Expression::entity("Product")
    }

    #[test]
    fn test_compose_substitutes_argument() {
        let vendor = product().property("vendor", ValueType::entity("Vendor"));
        let name_is = Expression::entity("Vendor")
            .property("name", ValueType::String)
            .equal_to("acme");

        let composed = compose(&vendor, &name_is).unwrap();
        let direct = product()
            .property("vendor", ValueType::entity("Vendor"))
            .property("name", ValueType::String)
            .equal_to("acme");
        assert_eq!(composed, direct);
    }

    #[test]
    fn test_compose_with_scalar_argument() {
        let number = product().property("number", ValueType::Integer);
        let lt = Expression::argument(ValueType::Integer).less_than(5);

        let composed = compose(&number, &lt).unwrap();
        assert_eq!(composed, number.less_than(5));
    }

    #[test]
    fn test_compose_over_list_maps_elements() {
        let tags = product().property("tags", ValueType::list(ValueType::String));
        let upper = Expression::argument(ValueType::String).to_upper();

        let composed = compose(&tags, &upper).unwrap();
        assert!(matches!(composed, Expression::Composed { .. }));
        assert_eq!(
            composed.value_type(),
            ValueType::list(ValueType::String)
        );
    }

    #[test]
    fn test_compose_type_mismatch() {
        let text = product().property("text", ValueType::String);
        let vendor_name = Expression::entity("Vendor").property("name", ValueType::String);

        let err = compose(&text, &vendor_name).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_compose_keeps_inner_scope() {
        let tags = product().property("tags", ValueType::list(ValueType::String));
        let mapped = compose(&tags, &Expression::argument(ValueType::String).trim()).unwrap();
        let count = Expression::argument(ValueType::list(ValueType::String)).count();

        let counted = compose(&mapped, &count).unwrap();
        if let Expression::Unary { operand, .. } = &counted {
            assert_eq!(**operand, mapped);
        } else {
            panic!("expected unary count, got {:?}", counted);
        }
    }
}
