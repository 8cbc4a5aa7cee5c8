//! # Filters
//!
//! Declarative per-domain filters (comparable, string, boolean, object) and
//! their translation into typed predicates.

mod model;
mod translate;

pub use model::{BooleanFilter, ComparableFilter, Filter, ObjectFilter, Range, StringFilter};
pub use translate::{search_text, to_expression};
