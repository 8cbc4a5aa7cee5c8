//! Referenced-object cache, its class-level listener multiplexer, and the
//! provider decorator that resolves links through it

mod listeners;
mod referenced;
mod resolving;

pub use referenced::{
    CacheStats, Identity, LoadedReference, ReferenceChange, ReferenceLoader, ReferencedObjectCache,
};
pub use resolving::{ReferenceResolver, ResolvingQueryProvider};
