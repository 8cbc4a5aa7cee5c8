//! In-memory reference backend
//!
//! Used by the test suites and by embedders that want a repository
//! without an external store.

mod paths;
mod provider;

pub use provider::MemoryQueryProvider;
