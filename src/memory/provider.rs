//! # In-Memory Provider
//!
//! Reference backend that keeps every entity type in an ordered map keyed
//! by the canonical key. Every write that changes a stored value is
//! published, under the write lock, to the live subscribers of its type
//! with a store-wide increasing sequence number. Writes that store an
//! identical value publish nothing.
//!
//! Recursive writes store referenced entities in their own tables and keep
//! a link in the parent. Links are returned as stored; resolving them is
//! the repository's job.
//!
//! Fault injection for live subscriptions and writes lets tests exercise
//! retry and conflict handling.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::cache::{Identity, LoadedReference, ReferenceChange, ReferenceLoader};
use crate::errors::{RepoError, RepoResult};
use crate::expression::{compile, compile_predicate, CompiledPredicate, ValueType};
use crate::live::{live_channel, LiveSender, LiveStream};
use crate::query::{
    Aggregator, CompiledQuery, DeleteInfo, EntityUpdater, Notification, QueryInfo, QueryProvider,
    UpdateInfo,
};
use crate::schema::{canonical_key, EntityDescriptor, SchemaRegistry};

use super::paths::{edit_list, set_path};

enum Sink {
    Query {
        predicate: Option<CompiledPredicate>,
        sender: LiveSender<Notification>,
    },
    References {
        sender: LiveSender<ReferenceChange>,
    },
}

struct Subscriber {
    id: u64,
    entity_type: String,
    sink: Sink,
}

impl Subscriber {
    fn is_closed(&self) -> bool {
        match &self.sink {
            Sink::Query { sender, .. } => sender.is_closed(),
            Sink::References { sender } => sender.is_closed(),
        }
    }
}

#[derive(Default)]
struct Store {
    tables: HashMap<String, BTreeMap<String, Value>>,
    subscribers: Vec<Subscriber>,
}

#[derive(Default)]
struct Faults {
    rejected_live_queries: u32,
    live_error: Option<RepoError>,
    rejected_writes: u32,
    write_error: Option<RepoError>,
}

/// In-process `QueryProvider` and `ReferenceLoader`
pub struct MemoryQueryProvider {
    schema: Arc<SchemaRegistry>,
    store: Arc<RwLock<Store>>,
    sequence: AtomicU64,
    next_subscriber: AtomicU64,
    live_queries_opened: AtomicUsize,
    faults: Mutex<Faults>,
}

impl MemoryQueryProvider {
    pub fn new(schema: Arc<SchemaRegistry>) -> Self {
        Self {
            schema,
            store: Arc::new(RwLock::new(Store::default())),
            sequence: AtomicU64::new(0),
            next_subscriber: AtomicU64::new(1),
            live_queries_opened: AtomicUsize::new(0),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Fail the next `count` live subscriptions with `error`
    pub fn reject_next_live_queries(&self, count: u32, error: RepoError) {
        let mut faults = self.faults.lock();
        faults.rejected_live_queries = count;
        faults.live_error = Some(error);
    }

    /// Fail the next `count` writes with `error`
    pub fn reject_next_writes(&self, count: u32, error: RepoError) {
        let mut faults = self.faults.lock();
        faults.rejected_writes = count;
        faults.write_error = Some(error);
    }

    /// Deliver `error` to every open live query and detach them
    pub fn fail_live_subscriptions(&self, error: RepoError) {
        let mut store = self.store.write();
        let subscribers = std::mem::take(&mut store.subscribers);
        for subscriber in subscribers {
            match &subscriber.sink {
                Sink::Query { sender, .. } => {
                    sender.error(error.clone());
                }
                Sink::References { .. } => store.subscribers.push(subscriber),
            }
        }
    }

    /// Open live queries
    pub fn live_subscription_count(&self) -> usize {
        self.count_subscribers(|sink| matches!(sink, Sink::Query { .. }))
    }

    /// Open class subscriptions
    pub fn reference_subscription_count(&self) -> usize {
        self.count_subscribers(|sink| matches!(sink, Sink::References { .. }))
    }

    /// Live queries opened since creation
    pub fn live_queries_opened(&self) -> usize {
        self.live_queries_opened.load(Ordering::SeqCst)
    }

    /// Number of stored entities of a type
    pub fn len(&self, entity_type: &str) -> usize {
        self.store
            .read()
            .tables
            .get(entity_type)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    fn count_subscribers(&self, kind: impl Fn(&Sink) -> bool) -> usize {
        self.store
            .read()
            .subscribers
            .iter()
            .filter(|s| !s.is_closed() && kind(&s.sink))
            .count()
    }

    fn check_write_fault(&self) -> RepoResult<()> {
        let mut faults = self.faults.lock();
        if faults.rejected_writes > 0 {
            faults.rejected_writes -= 1;
            if let Some(error) = faults.write_error.clone() {
                return Err(error);
            }
        }
        Ok(())
    }

    fn check_live_fault(&self) -> RepoResult<()> {
        let mut faults = self.faults.lock();
        if faults.rejected_live_queries > 0 {
            faults.rejected_live_queries -= 1;
            if let Some(error) = faults.live_error.clone() {
                return Err(error);
            }
        }
        Ok(())
    }

    fn register(&self, entity_type: &str, sink: Sink) -> u64 {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.store.write().subscribers.push(Subscriber {
            id,
            entity_type: entity_type.to_string(),
            sink,
        });
        id
    }

    fn unregister_on_cancel<T>(&self, sender: &LiveSender<T>, id: u64) {
        let store: Weak<RwLock<Store>> = Arc::downgrade(&self.store);
        sender.on_cancel(move || {
            if let Some(store) = store.upgrade() {
                store.write().subscribers.retain(|s| s.id != id);
            }
        });
    }

    /// Store one entity.
    ///
    /// With `recursive`, embedded entities are stored as well and replaced
    /// by links; otherwise they are kept inline as given.
    fn put(
        &self,
        store: &mut Store,
        descriptor: &EntityDescriptor,
        mut entity: Value,
        recursive: bool,
    ) -> RepoResult<Value> {
        let key = descriptor.key_string(&entity).ok_or_else(|| {
            RepoError::backend(format!(
                "{} instance without key property '{}'",
                descriptor.name, descriptor.key_property
            ))
        })?;

        if recursive {
            for property in &descriptor.properties {
                let target = property
                    .value_type
                    .entity_name()
                    .or_else(|| property.value_type.element().and_then(ValueType::entity_name));
                let Some(target) = target.and_then(|name| self.schema.get(name)) else {
                    continue;
                };
                match entity.get_mut(&property.name) {
                    Some(Value::Array(items)) => {
                        for item in items.iter_mut() {
                            self.link(store, &target, item)?;
                        }
                    }
                    Some(field) => self.link(store, &target, field)?,
                    None => {}
                }
            }
        }

        let old = store
            .tables
            .entry(descriptor.name.clone())
            .or_default()
            .insert(key.clone(), entity.clone());
        if old.as_ref() != Some(&entity) {
            self.publish(store, &descriptor.name, &key, old, Some(entity.clone()));
        }
        Ok(entity)
    }

    /// Store an embedded entity and leave a link in its place
    fn link(&self, store: &mut Store, target: &EntityDescriptor, field: &mut Value) -> RepoResult<()> {
        if !field.is_object() || Identity::from_link(field).is_some() {
            return Ok(());
        }
        let embedded = field.take();
        let identity = Identity::of(target, &embedded);
        self.put(store, target, embedded, true)?;
        if let Some(identity) = identity {
            *field = identity.to_link();
        }
        Ok(())
    }

    fn remove(&self, store: &mut Store, entity_type: &str, key: &str) {
        let old = store.tables.get_mut(entity_type).and_then(|t| t.remove(key));
        if old.is_some() {
            self.publish(store, entity_type, key, old, None);
        }
    }

    fn publish(
        &self,
        store: &mut Store,
        entity_type: &str,
        key: &str,
        old_value: Option<Value>,
        new_value: Option<Value>,
    ) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let notification = Notification::of(old_value, new_value, sequence);
        store.subscribers.retain(|s| !s.is_closed());

        for subscriber in store.subscribers.iter().filter(|s| s.entity_type == entity_type) {
            match &subscriber.sink {
                Sink::Query { predicate, sender } => match relevant(predicate.as_ref(), &notification) {
                    Ok(true) => {
                        sender.send(notification.clone());
                    }
                    Ok(false) => {}
                    Err(error) => {
                        sender.error(error);
                    }
                },
                Sink::References { sender } => {
                    if let Some(kind) = notification.kind() {
                        sender.send(ReferenceChange {
                            kind,
                            identity: Identity::new(format!("{}/{}", entity_type, key)),
                        });
                    }
                }
            }
        }
    }

    fn rows(&self, info: &QueryInfo) -> RepoResult<Vec<Value>> {
        let query = CompiledQuery::new(info)?;
        let store = self.store.read();
        match store.tables.get(&info.entity_type) {
            Some(table) => query.run(table.values()),
            None => Ok(Vec::new()),
        }
    }

    /// Keys of the entities matching `predicate`, at most `limit`
    fn matching_keys(
        store: &Store,
        entity_type: &str,
        predicate: Option<&CompiledPredicate>,
        limit: Option<u64>,
    ) -> RepoResult<Vec<String>> {
        let Some(table) = store.tables.get(entity_type) else {
            return Ok(Vec::new());
        };
        let mut keys = Vec::new();
        for (key, entity) in table {
            if limit.is_some_and(|limit| keys.len() as u64 >= limit) {
                break;
            }
            let matches = match predicate {
                Some(predicate) => predicate.test(entity)?,
                None => true,
            };
            if matches {
                keys.push(key.clone());
            }
        }
        Ok(keys)
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

impl QueryProvider for MemoryQueryProvider {
    fn insert_or_update(
        &self,
        descriptor: &EntityDescriptor,
        entity: Value,
        recursive: bool,
    ) -> RepoResult<Value> {
        self.check_write_fault()?;
        let mut store = self.store.write();
        self.put(&mut store, descriptor, entity, recursive)
    }

    fn insert_or_update_with(
        &self,
        descriptor: &EntityDescriptor,
        key: &Value,
        recursive: bool,
        updater: EntityUpdater,
    ) -> RepoResult<Option<Value>> {
        self.check_write_fault()?;
        let mut store = self.store.write();
        let current = store
            .tables
            .get(&descriptor.name)
            .and_then(|t| t.get(&canonical_key(key)))
            .cloned();

        match updater(current.clone()) {
            None => Ok(current),
            Some(mut next) => {
                if descriptor.key_of(&next).is_none() {
                    set_path(&mut next, &descriptor.key_property, key.clone())?;
                }
                if descriptor.key_string(&next) != Some(canonical_key(key)) {
                    return Err(RepoError::backend(format!(
                        "updater changed the key of {} '{}'",
                        descriptor.name,
                        canonical_key(key)
                    )));
                }
                self.put(&mut store, descriptor, next, recursive).map(Some)
            }
        }
    }

    fn update(&self, info: &UpdateInfo) -> RepoResult<u64> {
        self.check_write_fault()?;
        let descriptor = self.schema.require(&info.entity_type)?;
        let predicate = info.predicate.as_ref().map(compile_predicate).transpose()?;
        let assignments = info
            .assignments
            .iter()
            .map(|a| Ok::<_, RepoError>((a.path.as_str(), compile(&a.value)?)))
            .collect::<RepoResult<Vec<_>>>()?;

        let mut store = self.store.write();
        let keys = Self::matching_keys(&store, &info.entity_type, predicate.as_ref(), info.limit)?;
        let mut changed = 0;
        for key in keys {
            let Some(old) = store.tables.get(&info.entity_type).and_then(|t| t.get(&key)).cloned() else {
                continue;
            };
            let mut next = old.clone();
            for (path, value) in &assignments {
                set_path(&mut next, path, value.evaluate(&old)?)?;
            }
            for collection in &info.collections {
                edit_list(&mut next, &collection.path, &collection.add, &collection.remove)?;
            }
            if next != old {
                self.put(&mut store, &descriptor, next, false)?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn delete(&self, info: &DeleteInfo) -> RepoResult<u64> {
        self.check_write_fault()?;
        let predicate = info.predicate.as_ref().map(compile_predicate).transpose()?;
        let mut store = self.store.write();
        let keys = Self::matching_keys(&store, &info.entity_type, predicate.as_ref(), info.limit)?;
        for key in &keys {
            self.remove(&mut store, &info.entity_type, key);
        }
        Ok(keys.len() as u64)
    }

    fn query(&self, info: &QueryInfo) -> RepoResult<Vec<Notification>> {
        let sequence = self.sequence.load(Ordering::SeqCst);
        Ok(self
            .rows(info)?
            .into_iter()
            .map(|row| Notification::create(row, sequence))
            .collect())
    }

    fn live_query(&self, info: &QueryInfo) -> RepoResult<LiveStream<Notification>> {
        self.check_live_fault()?;
        let predicate = info.predicate.as_ref().map(compile_predicate).transpose()?;
        let (sender, stream) = live_channel();
        let id = self.register(
            &info.entity_type,
            Sink::Query {
                predicate,
                sender: sender.clone(),
            },
        );
        self.unregister_on_cancel(&sender, id);
        self.live_queries_opened.fetch_add(1, Ordering::SeqCst);
        Ok(stream)
    }

    fn aggregate(&self, info: &QueryInfo, aggregator: &Aggregator) -> RepoResult<Option<Value>> {
        Ok(aggregator.apply(&self.rows(info)?)?)
    }
}

impl ReferenceLoader for MemoryQueryProvider {
    fn load(&self, identity: &Identity) -> RepoResult<Option<LoadedReference>> {
        let Some((class_name, key)) = identity.split() else {
            return Ok(None);
        };
        let store = self.store.read();
        Ok(store
            .tables
            .get(class_name)
            .and_then(|t| t.get(key))
            .map(|value| LoadedReference {
                class_name: class_name.to_string(),
                value: value.clone(),
            }))
    }

    fn subscribe_class(&self, class_name: &str) -> RepoResult<LiveStream<ReferenceChange>> {
        let (sender, stream) = live_channel();
        let id = self.register(
            class_name,
            Sink::References {
                sender: sender.clone(),
            },
        );
        self.unregister_on_cancel(&sender, id);
        Ok(stream)
    }
}
