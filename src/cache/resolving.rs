//! # Link Resolution
//!
//! Backends store references between entities as links. Everything the
//! repository hands out is materialized: each link is replaced by the
//! referenced entity, resolved through the `ReferencedObjectCache`. A link
//! whose target is gone reads as absent (`null`, or left out of a list).
//!
//! For entity types that declare references, `ResolvingQueryProvider`
//! evaluates predicates, order, paging and aggregates in-process over the
//! materialized rows, so a change to a referenced entity is visible through
//! every entity that links to it. Types without references go to the
//! backend unchanged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::runtime::Handle;

use crate::errors::{RepoError, RepoResult};
use crate::expression::{compile_predicate, CompiledPredicate, Expression, ValueType};
use crate::live::{live_channel, LiveStream};
use crate::query::{
    Aggregator, CompiledQuery, DeleteInfo, EntityUpdater, Notification, QueryInfo, QueryProvider,
    UpdateInfo,
};
use crate::schema::{canonical_key, EntityDescriptor, PropertyDescriptor, SchemaRegistry};

use super::referenced::{Identity, ReferencedObjectCache};

/// Links followed below one entity; deeper links are returned as stored
const MAX_LINK_DEPTH: usize = 8;

/// Replaces links with the entities they name
#[derive(Clone)]
pub struct ReferenceResolver {
    schema: Arc<SchemaRegistry>,
    cache: ReferencedObjectCache,
}

impl ReferenceResolver {
    pub fn new(schema: Arc<SchemaRegistry>, cache: ReferencedObjectCache) -> Self {
        Self { schema, cache }
    }

    pub fn cache(&self) -> &ReferencedObjectCache {
        &self.cache
    }

    /// True if instances of `entity_type` can hold links
    pub fn has_references(&self, entity_type: &str) -> bool {
        self.schema
            .get(entity_type)
            .is_some_and(|descriptor| descriptor.properties.iter().any(|p| self.target_of(p).is_some()))
    }

    /// Resolve every link in `value`, following nested references
    pub fn materialize(&self, descriptor: &EntityDescriptor, value: Value) -> RepoResult<Value> {
        self.materialize_at(descriptor, value, 0)
    }

    pub fn materialize_notification(
        &self,
        descriptor: &EntityDescriptor,
        notification: Notification,
    ) -> RepoResult<Notification> {
        let old_value = notification
            .old_value
            .clone()
            .map(|v| self.materialize(descriptor, v))
            .transpose()?;
        let new_value = notification
            .new_value
            .clone()
            .map(|v| self.materialize(descriptor, v))
            .transpose()?;
        Ok(Notification {
            old_value,
            new_value,
            ..notification
        })
    }

    /// Evict what a write of `stored` may have made stale
    pub fn forget(&self, descriptor: &EntityDescriptor, stored: &Value, recursive: bool) {
        if let Some(identity) = Identity::of(descriptor, stored) {
            self.cache.invalidate(&identity);
        }
        if !recursive {
            return;
        }
        for property in &descriptor.properties {
            if self.target_of(property).is_none() {
                continue;
            }
            let links: Vec<&Value> = match stored.get(&property.name) {
                Some(Value::Array(items)) => items.iter().collect(),
                Some(value) => vec![value],
                None => Vec::new(),
            };
            for identity in links.into_iter().filter_map(Identity::from_link) {
                self.cache.invalidate(&identity);
            }
        }
    }

    fn target_of(&self, property: &PropertyDescriptor) -> Option<Arc<EntityDescriptor>> {
        let value_type = &property.value_type;
        value_type
            .entity_name()
            .or_else(|| value_type.element().and_then(ValueType::entity_name))
            .and_then(|name| self.schema.get(name))
    }

    fn materialize_at(&self, descriptor: &EntityDescriptor, mut value: Value, depth: usize) -> RepoResult<Value> {
        if depth >= MAX_LINK_DEPTH {
            return Ok(value);
        }
        if let Some(fields) = value.as_object_mut() {
            for property in &descriptor.properties {
                let Some(target) = self.target_of(property) else {
                    continue;
                };
                let Some(field) = fields.get_mut(&property.name) else {
                    continue;
                };
                *field = match field.take() {
                    Value::Array(items) => {
                        let mut resolved = Vec::with_capacity(items.len());
                        for item in items {
                            if let Some(item) = self.resolve_item(&target, item, depth)? {
                                resolved.push(item);
                            }
                        }
                        Value::Array(resolved)
                    }
                    item => self.resolve_item(&target, item, depth)?.unwrap_or(Value::Null),
                };
            }
        }
        Ok(value)
    }

    /// `None` for a link whose target no longer exists
    fn resolve_item(&self, target: &EntityDescriptor, item: Value, depth: usize) -> RepoResult<Option<Value>> {
        let item = match Identity::from_link(&item) {
            Some(identity) => match self.cache.resolve(&identity)? {
                Some(value) => value,
                None => return Ok(None),
            },
            None => item,
        };
        if item.is_object() {
            return self.materialize_at(target, item, depth + 1).map(Some);
        }
        Ok(Some(item))
    }
}

/// A change matters to a subscriber if either side passes its predicate
fn relevant(predicate: Option<&CompiledPredicate>, notification: &Notification) -> RepoResult<bool> {
    let Some(predicate) = predicate else {
        return Ok(true);
    };
    for value in [&notification.old_value, &notification.new_value].into_iter().flatten() {
        if predicate.test(value)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Query over every stored instance of a type
fn scan(descriptor: &EntityDescriptor) -> QueryInfo {
    QueryInfo::new(descriptor.name.clone(), descriptor.key_type())
}

fn key_expression(descriptor: &EntityDescriptor) -> Expression {
    descriptor
        .argument()
        .property(descriptor.key_property.clone(), descriptor.key_type())
}

/// Provider decorator that materializes links
pub struct ResolvingQueryProvider {
    provider: Arc<dyn QueryProvider>,
    resolver: ReferenceResolver,
    live: Handle,
}

impl ResolvingQueryProvider {
    pub fn new(provider: Arc<dyn QueryProvider>, resolver: ReferenceResolver, live: Handle) -> Self {
        Self {
            provider,
            resolver,
            live,
        }
    }

    pub fn resolver(&self) -> &ReferenceResolver {
        &self.resolver
    }

    /// Descriptor of `entity_type` if its instances can hold links
    fn linked(&self, entity_type: &str) -> Option<Arc<EntityDescriptor>> {
        if !self.resolver.has_references(entity_type) {
            return None;
        }
        self.resolver.schema.get(entity_type)
    }

    /// Every instance of the type, materialized, and the snapshot sequence
    fn resolved_rows(&self, descriptor: &EntityDescriptor) -> RepoResult<(Vec<Value>, u64)> {
        let raw = self.provider.query(&scan(descriptor))?;
        let sequence = raw.iter().map(|n| n.sequence).max().unwrap_or(0);
        let rows = raw
            .into_iter()
            .filter_map(|n| n.new_value)
            .map(|v| self.resolver.materialize(descriptor, v))
            .collect::<RepoResult<Vec<_>>>()?;
        Ok((rows, sequence))
    }

    /// Predicate selecting, by key, the entities that match `predicate`
    /// once materialized; `None` if nothing matches
    fn keys_matching(
        &self,
        descriptor: &EntityDescriptor,
        predicate: &Expression,
        limit: Option<u64>,
    ) -> RepoResult<Option<Expression>> {
        let predicate = compile_predicate(predicate)?;
        let (rows, _) = self.resolved_rows(descriptor)?;
        let mut keys = Vec::new();
        for row in &rows {
            if limit.is_some_and(|limit| keys.len() as u64 >= limit) {
                break;
            }
            if predicate.test(row)? {
                if let Some(key) = descriptor.key_of(row) {
                    keys.push(key.clone());
                }
            }
        }
        if keys.is_empty() {
            return Ok(None);
        }
        let keys = Expression::typed_constant(Value::Array(keys), ValueType::list(descriptor.key_type()));
        Ok(Some(key_expression(descriptor).is_in(keys)))
    }
}

impl QueryProvider for ResolvingQueryProvider {
    fn insert_or_update(
        &self,
        descriptor: &EntityDescriptor,
        entity: Value,
        recursive: bool,
    ) -> RepoResult<Value> {
        let stored = self.provider.insert_or_update(descriptor, entity, recursive)?;
        self.resolver.forget(descriptor, &stored, recursive);
        self.resolver.materialize(descriptor, stored)
    }

    /// The updater sees the materialized entity. The raw value it was
    /// derived from must still be stored when the write happens, otherwise
    /// the update is rejected as a concurrent modification.
    fn insert_or_update_with(
        &self,
        descriptor: &EntityDescriptor,
        key: &Value,
        recursive: bool,
        updater: EntityUpdater,
    ) -> RepoResult<Option<Value>> {
        let stored = if self.resolver.has_references(&descriptor.name) {
            let by_key = scan(descriptor)
                .with_predicate(Some(key_expression(descriptor).equal_to(Expression::typed_constant(
                    key.clone(),
                    descriptor.key_type(),
                ))))
                .with_limit(Some(1));
            let raw = self
                .provider
                .query(&by_key)?
                .into_iter()
                .find_map(|n| n.new_value);
            let current = raw
                .clone()
                .map(|v| self.resolver.materialize(descriptor, v))
                .transpose()?;

            let conflict = Arc::new(AtomicBool::new(false));
            let seen = conflict.clone();
            let guarded: EntityUpdater = Box::new(move |stored: Option<Value>| {
                if stored != raw {
                    seen.store(true, Ordering::SeqCst);
                    return None;
                }
                updater(current)
            });
            let stored = self
                .provider
                .insert_or_update_with(descriptor, key, recursive, guarded)?;
            if conflict.load(Ordering::SeqCst) {
                return Err(RepoError::ConcurrentModification(format!(
                    "{} '{}' changed during update",
                    descriptor.name,
                    canonical_key(key)
                )));
            }
            stored
        } else {
            self.provider
                .insert_or_update_with(descriptor, key, recursive, updater)?
        };

        match stored {
            Some(stored) => {
                self.resolver.forget(descriptor, &stored, recursive);
                self.resolver.materialize(descriptor, stored).map(Some)
            }
            None => Ok(None),
        }
    }

    fn update(&self, info: &UpdateInfo) -> RepoResult<u64> {
        let changed = match (self.linked(&info.entity_type), &info.predicate) {
            (Some(descriptor), Some(predicate)) => {
                match self.keys_matching(&descriptor, predicate, info.limit)? {
                    Some(by_key) => self.provider.update(&UpdateInfo {
                        predicate: Some(by_key),
                        limit: None,
                        ..info.clone()
                    })?,
                    None => 0,
                }
            }
            _ => self.provider.update(info)?,
        };
        if changed > 0 {
            self.resolver.cache.invalidate_class(&info.entity_type);
        }
        Ok(changed)
    }

    fn delete(&self, info: &DeleteInfo) -> RepoResult<u64> {
        let removed = match (self.linked(&info.entity_type), &info.predicate) {
            (Some(descriptor), Some(predicate)) => {
                match self.keys_matching(&descriptor, predicate, info.limit)? {
                    Some(by_key) => self.provider.delete(&DeleteInfo {
                        predicate: Some(by_key),
                        limit: None,
                        ..info.clone()
                    })?,
                    None => 0,
                }
            }
            _ => self.provider.delete(info)?,
        };
        if removed > 0 {
            self.resolver.cache.invalidate_class(&info.entity_type);
        }
        Ok(removed)
    }

    fn query(&self, info: &QueryInfo) -> RepoResult<Vec<Notification>> {
        let Some(descriptor) = self.linked(&info.entity_type) else {
            return self.provider.query(info);
        };
        let query = CompiledQuery::new(info)?;
        let (rows, sequence) = self.resolved_rows(&descriptor)?;
        Ok(query
            .run(&rows)?
            .into_iter()
            .map(|row| Notification::create(row, sequence))
            .collect())
    }

    /// Opens the backend feed over the whole type and filters the
    /// materialized changes here.
    fn live_query(&self, info: &QueryInfo) -> RepoResult<LiveStream<Notification>> {
        let Some(descriptor) = self.linked(&info.entity_type) else {
            return self.provider.live_query(info);
        };
        let predicate = info.predicate.as_ref().map(compile_predicate).transpose()?;
        let (mut changes, upstream) = self.provider.live_query(&scan(&descriptor))?.into_parts();
        let (sender, stream) = live_channel();

        let resolver = self.resolver.clone();
        let out = sender.clone();
        let task = self.live.spawn(async move {
            while let Some(change) = changes.recv().await {
                let forwarded = change.and_then(|change| {
                    let change = resolver.materialize_notification(&descriptor, change)?;
                    Ok(relevant(predicate.as_ref(), &change)?.then_some(change))
                });
                match forwarded {
                    Ok(Some(change)) => {
                        if !out.send(change) {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(error) => {
                        out.error(error);
                        return;
                    }
                }
            }
        });
        sender.on_cancel(move || {
            task.abort();
            drop(upstream);
        });
        Ok(stream)
    }

    fn aggregate(&self, info: &QueryInfo, aggregator: &Aggregator) -> RepoResult<Option<Value>> {
        let Some(descriptor) = self.linked(&info.entity_type) else {
            return self.provider.aggregate(info, aggregator);
        };
        let query = CompiledQuery::new(info)?;
        let (rows, _) = self.resolved_rows(&descriptor)?;
        Ok(aggregator.apply(&query.run(&rows)?)?)
    }
}
