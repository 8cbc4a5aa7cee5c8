//! Entity schema for aerorepo
//!
//! Descriptors for every entity type the repository handles: the key
//! property, typed properties and their filter/search capabilities.
//! Property paths in queries resolve against this registry at build time.

mod errors;
mod loader;
mod registry;
mod types;

pub use errors::{SchemaError, SchemaErrorCode, SchemaResult};
pub use loader::SchemaLoader;
pub use registry::SchemaRegistry;
pub use types::{canonical_key, Capabilities, EntityDescriptor, PropertyDescriptor};
