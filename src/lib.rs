//! aerorepo - typed object repository with live queries
//!
//! Typed expressions and filters compile into predicates, selectors and
//! comparators; an entity-set facade turns them into one-shot and live
//! queries against a pluggable backend.

pub mod cache;
pub mod config;
pub mod errors;
pub mod expression;
pub mod filter;
pub mod live;
pub mod memory;
pub mod observability;
pub mod query;
pub mod scheduling;
pub mod schema;

pub use config::RepositoryConfig;
pub use errors::{RepoError, RepoResult};
pub use expression::{Expression, ValueType};
pub use query::{EntitySet, Repository};
