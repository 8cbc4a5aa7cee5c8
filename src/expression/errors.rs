//! Expression errors
//!
//! Validation errors are raised while an expression tree is built, composed
//! or compiled. Evaluation errors are raised by a compiled function while it
//! runs against one instance.

use thiserror::Error;

/// Result type for expression operations
pub type ExpressionResult<T> = Result<T, ExpressionError>;

/// Expression errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    // Validation
    /// An operand has a type the operator does not accept
    #[error("Type mismatch in {context}: expected {expected}, found {found}")]
    TypeMismatch {
        context: String,
        expected: String,
        found: String,
    },

    /// A dotted property path does not resolve against the schema
    #[error("Cannot resolve '{path}' on {entity}: no property '{segment}'")]
    PathResolution {
        entity: String,
        path: String,
        segment: String,
    },

    /// Two expressions cannot be composed
    #[error("Invalid composition: {0}")]
    InvalidComposition(String),

    /// Ordering was requested on a non-comparable expression
    #[error("Expression of type {0} is not comparable")]
    NotComparable(String),

    /// A filter names a property that is not flagged filterable
    #[error("Property '{property}' of {entity} is not filterable")]
    NotFilterable { entity: String, property: String },

    /// Entity type not known to the schema registry
    #[error("Unknown entity type: {0}")]
    UnknownEntity(String),

    // Evaluation
    /// A regular expression failed to compile
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Division by zero
    #[error("Division by zero")]
    DivisionByZero,

    /// Integer arithmetic left the 64-bit range
    #[error("Arithmetic overflow in {0}")]
    Overflow(String),

    /// A runtime value did not have the shape its static type promised
    #[error("Type error: {0}")]
    TypeError(String),
}

impl ExpressionError {
    /// Returns true for errors raised at build time
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ExpressionError::TypeMismatch { .. }
                | ExpressionError::PathResolution { .. }
                | ExpressionError::InvalidComposition(_)
                | ExpressionError::NotComparable(_)
                | ExpressionError::NotFilterable { .. }
                | ExpressionError::UnknownEntity(_)
        )
    }

    pub(crate) fn mismatch(
        context: impl Into<String>,
        expected: impl Into<String>,
        found: impl std::fmt::Display,
    ) -> Self {
        ExpressionError::TypeMismatch {
            context: context.into(),
            expected: expected.into(),
            found: found.to_string(),
        }
    }
}
