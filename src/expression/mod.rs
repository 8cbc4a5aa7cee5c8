//! # Expressions
//!
//! Typed expression trees over entity instances and the compiler that turns
//! them into predicates, selectors and comparators.
//!
//! Instances are `serde_json::Value` objects; a missing field or a JSON
//! `null` is the absent value. Absent operands never raise errors: every
//! operator has a fixed result for them (see [`values`]).
//!
//! ```ignore
//! let product = Expression::entity("Product");
//! let number = product.clone().property("number", ValueType::Integer);
//! let predicate = compile_predicate(&number.less_than(5))?;
//! assert!(predicate.test(&json!({"number": 3}))?);
//! ```

mod ast;
mod compiler;
mod compose;
mod errors;
mod ops;
mod path;
pub mod values;

pub use ast::{BinaryOp, Expression, UnaryOp, ValueType};
pub use compiler::{
    compile, compile_comparator, compile_predicate, ensure_comparable, CompiledComparator,
    CompiledExpression, CompiledPredicate,
};
pub use compose::compose;
pub use errors::{ExpressionError, ExpressionResult};
pub use path::resolve_path;
