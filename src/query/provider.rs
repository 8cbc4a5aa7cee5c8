//! # Query Provider Boundary
//!
//! The contract a storage backend implements. Calls are synchronous and may
//! block; the repository moves them onto its worker pools. `live_query`
//! must register its subscription before returning, so that a snapshot
//! taken afterwards cannot miss a change made in between.

use serde_json::Value;

use crate::errors::RepoResult;
use crate::live::LiveStream;
use crate::schema::EntityDescriptor;

use super::aggregator::Aggregator;
use super::info::{DeleteInfo, QueryInfo, UpdateInfo};
use super::notification::Notification;

/// Read-modify-write callback for a single entity.
///
/// Receives the stored value (or `None`) and returns the value to store;
/// returning `None` leaves the store untouched.
pub type EntityUpdater = Box<dyn FnOnce(Option<Value>) -> Option<Value> + Send>;

/// Storage backend
pub trait QueryProvider: Send + Sync {
    /// Store an entity; with `recursive`, entity-typed properties holding
    /// whole instances are stored as well. Returns the stored value.
    fn insert_or_update(
        &self,
        descriptor: &EntityDescriptor,
        entity: Value,
        recursive: bool,
    ) -> RepoResult<Value>;

    /// Atomically update the entity with `key`.
    ///
    /// Returns the value stored afterwards, or `None` if there is none.
    fn insert_or_update_with(
        &self,
        descriptor: &EntityDescriptor,
        key: &Value,
        recursive: bool,
        updater: EntityUpdater,
    ) -> RepoResult<Option<Value>>;

    /// Set-based update; returns the number of changed entities
    fn update(&self, info: &UpdateInfo) -> RepoResult<u64>;

    /// Set-based delete; returns the number of removed entities
    fn delete(&self, info: &DeleteInfo) -> RepoResult<u64>;

    /// One-shot query; every notification is a create holding one result row
    fn query(&self, info: &QueryInfo) -> RepoResult<Vec<Notification>>;

    /// Raw change feed for entities matching the query predicate.
    ///
    /// A change is delivered when the old or the new value matches.
    fn live_query(&self, info: &QueryInfo) -> RepoResult<LiveStream<Notification>>;

    /// One-shot aggregate over the (projected) query results
    fn aggregate(&self, info: &QueryInfo, aggregator: &Aggregator) -> RepoResult<Option<Value>>;
}
