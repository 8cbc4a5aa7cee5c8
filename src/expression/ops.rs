//! Operator overloads and literal conversions for building expressions

use std::ops::{Add, Div, Mul, Neg, Not, Sub};

use serde_json::Value;

use super::ast::{BinaryOp, Expression, UnaryOp};

impl<T: Into<Expression>> Add<T> for Expression {
    type Output = Expression;

    fn add(self, rhs: T) -> Expression {
        Expression::binary(BinaryOp::Add, self, rhs.into())
    }
}

impl<T: Into<Expression>> Sub<T> for Expression {
    type Output = Expression;

    fn sub(self, rhs: T) -> Expression {
        Expression::binary(BinaryOp::Subtract, self, rhs.into())
    }
}

impl<T: Into<Expression>> Mul<T> for Expression {
    type Output = Expression;

    fn mul(self, rhs: T) -> Expression {
        Expression::binary(BinaryOp::Multiply, self, rhs.into())
    }
}

impl<T: Into<Expression>> Div<T> for Expression {
    type Output = Expression;

    fn div(self, rhs: T) -> Expression {
        Expression::binary(BinaryOp::Divide, self, rhs.into())
    }
}

impl Neg for Expression {
    type Output = Expression;

    fn neg(self) -> Expression {
        self.unary(UnaryOp::Negate)
    }
}

impl Not for Expression {
    type Output = Expression;

    fn not(self) -> Expression {
        self.unary(UnaryOp::Not)
    }
}

impl From<i64> for Expression {
    fn from(v: i64) -> Self {
        Expression::constant(v)
    }
}

impl From<i32> for Expression {
    fn from(v: i32) -> Self {
        Expression::constant(v)
    }
}

impl From<f64> for Expression {
    fn from(v: f64) -> Self {
        Expression::constant(v)
    }
}

impl From<bool> for Expression {
    fn from(v: bool) -> Self {
        Expression::constant(v)
    }
}

impl From<&str> for Expression {
    fn from(v: &str) -> Self {
        Expression::constant(v)
    }
}

impl From<String> for Expression {
    fn from(v: String) -> Self {
        Expression::constant(v)
    }
}

impl From<Value> for Expression {
    fn from(v: Value) -> Self {
        Expression::constant(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::ValueType;

    #[test]
    fn test_operators_build_binary_nodes() {
        let n = Expression::entity("Product").property("number", ValueType::Integer);
        let expr = (n.clone() + 1) * 2;
        assert_eq!(
            expr,
            Expression::binary(
                BinaryOp::Multiply,
                Expression::binary(BinaryOp::Add, n, Expression::constant(1)),
                Expression::constant(2),
            )
        );
    }

    #[test]
    fn test_not_wraps_operand() {
        let flag = Expression::entity("Product").property("active", ValueType::Boolean);
        assert!(matches!(
            !flag,
            Expression::Unary {
                op: UnaryOp::Not,
                ..
            }
        ));
    }
}
