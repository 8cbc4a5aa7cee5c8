//! # Referenced-Object Cache
//!
//! Memoizes entities reached through references, keyed by identity, with
//! expiry after a period without access.
//!
//! - A miss loads through the `ReferenceLoader`; concurrent misses on the
//!   same identity share one load.
//! - Every cached entry holds one reference on the listener of its class.
//!   Evicting the entry drops that reference.
//! - A modify or delete event for a cached identity evicts it. Entries are
//!   never refreshed in place.
//! - An identity that no longer resolves is an absent value, not an error,
//!   and is not cached.
//!
//! Stored entities point at the entities they reference through links, a
//! one-field object `{"$ref": "<Type>/<key>"}`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::errors::{RepoError, RepoResult};
use crate::live::LiveStream;
use crate::observability::{log_event_with_fields, Event};
use crate::query::NotificationKind;
use crate::schema::EntityDescriptor;

use super::listeners::{ClassListeners, Invalidate, Invalidation};

/// Backend identity of a stored entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity(String);

const LINK_FIELD: &str = "$ref";

impl Identity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    /// Identity of a stored instance of `descriptor`, if it carries a key
    pub fn of(descriptor: &EntityDescriptor, entity: &Value) -> Option<Self> {
        descriptor
            .key_string(entity)
            .map(|key| Self(format!("{}/{}", descriptor.name, key)))
    }

    /// Identity named by a link value
    pub fn from_link(value: &Value) -> Option<Self> {
        match value {
            Value::Object(fields) if fields.len() == 1 => {
                fields.get(LINK_FIELD).and_then(Value::as_str).map(Self::new)
            }
            _ => None,
        }
    }

    /// Link value pointing at this identity
    pub fn to_link(&self) -> Value {
        let mut fields = serde_json::Map::new();
        fields.insert(LINK_FIELD.to_string(), Value::String(self.0.clone()));
        Value::Object(fields)
    }

    /// Entity type and key
    pub fn split(&self) -> Option<(&str, &str)> {
        self.0.split_once('/')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entity loaded by identity
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedReference {
    pub class_name: String,
    pub value: Value,
}

/// Change event of a class listener
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceChange {
    pub kind: NotificationKind,
    pub identity: Identity,
}

/// Backend access for referenced entities
pub trait ReferenceLoader: Send + Sync {
    /// Load by identity; `None` if nothing is stored under it
    fn load(&self, identity: &Identity) -> RepoResult<Option<LoadedReference>>;

    /// Change feed over every entity of a class
    fn subscribe_class(&self, class_name: &str) -> RepoResult<LiveStream<ReferenceChange>>;
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub evictions: u64,
    pub entries: usize,
    pub listeners: usize,
}

#[derive(Default)]
struct EntryState {
    evicted: bool,
    /// Class reference held by this entry
    class_name: Option<String>,
}

struct CacheEntry {
    value: OnceCell<Value>,
    state: Mutex<EntryState>,
    last_access: Mutex<Instant>,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            value: OnceCell::new(),
            state: Mutex::new(EntryState::default()),
            last_access: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    fn is_expired(&self, expiration: Duration) -> bool {
        self.last_access.lock().elapsed() >= expiration
    }
}

enum LoadFailure {
    Missing,
    Failed(RepoError),
}

impl From<RepoError> for LoadFailure {
    fn from(error: RepoError) -> Self {
        LoadFailure::Failed(error)
    }
}

struct CacheInner {
    loader: Arc<dyn ReferenceLoader>,
    entries: DashMap<Identity, Arc<CacheEntry>>,
    listeners: ClassListeners,
    expiration: Duration,
    live: Handle,
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    evictions: AtomicU64,
}

impl CacheInner {
    /// Remove `entry` if it is still the one cached for `identity`
    fn evict(&self, identity: &Identity, entry: &Arc<CacheEntry>) -> bool {
        let removed = self
            .entries
            .remove_if(identity, |_, current| Arc::ptr_eq(current, entry))
            .is_some();
        if !removed {
            return false;
        }
        let class_name = {
            let mut state = entry.state.lock();
            state.evicted = true;
            state.class_name.take()
        };
        if let Some(class_name) = class_name {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.listeners.release(&class_name);
        }
        true
    }

    fn invalidate(&self, identity: &Identity) -> bool {
        let Some(entry) = self.entries.get(identity).map(|e| e.value().clone()) else {
            return false;
        };
        let evicted = self.evict(identity, &entry);
        if evicted {
            log_event_with_fields(Event::ReferenceInvalidated, &[("identity", identity.as_str())]);
        }
        evicted
    }

    /// Evict every loaded entry holding a reference on `class_name`
    fn invalidate_class(&self, class_name: &str) -> usize {
        let held: Vec<(Identity, Arc<CacheEntry>)> = self
            .entries
            .iter()
            .filter(|e| e.value().state.lock().class_name.as_deref() == Some(class_name))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        held.iter()
            .filter(|(identity, entry)| self.evict(identity, entry))
            .count()
    }
}

/// Reference cache with class-level invalidation
#[derive(Clone)]
pub struct ReferencedObjectCache {
    inner: Arc<CacheInner>,
}

impl ReferencedObjectCache {
    pub fn new(loader: Arc<dyn ReferenceLoader>, expiration: Duration, live: Handle) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                loader,
                entries: DashMap::new(),
                listeners: ClassListeners::new(),
                expiration,
                live,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                loads: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    /// Resolve an identity; `Ok(None)` when it no longer exists
    pub fn resolve(&self, identity: &Identity) -> RepoResult<Option<Value>> {
        let inner = &self.inner;
        let entry = loop {
            let entry = inner
                .entries
                .entry(identity.clone())
                .or_insert_with(|| Arc::new(CacheEntry::new()))
                .value()
                .clone();
            if entry.value.get().is_some() && entry.is_expired(inner.expiration) {
                inner.evict(identity, &entry);
                continue;
            }
            break entry;
        };
        entry.touch();

        if let Some(value) = entry.value.get() {
            inner.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(value.clone()));
        }

        let loaded = entry.value.get_or_try_init(|| {
            inner.misses.fetch_add(1, Ordering::Relaxed);
            let reference = inner.loader.load(identity)?.ok_or(LoadFailure::Missing)?;
            inner.loads.fetch_add(1, Ordering::Relaxed);

            inner.listeners.acquire(
                &reference.class_name,
                inner.loader.as_ref(),
                &inner.live,
                self.invalidation_hook(),
            )?;
            let mut state = entry.state.lock();
            if state.evicted {
                drop(state);
                inner.listeners.release(&reference.class_name);
            } else {
                state.class_name = Some(reference.class_name.clone());
            }
            log_event_with_fields(
                Event::ReferenceLoaded,
                &[("class", &reference.class_name), ("identity", identity.as_str())],
            );
            Ok::<_, LoadFailure>(reference.value)
        });

        match loaded {
            Ok(value) => Ok(Some(value.clone())),
            Err(LoadFailure::Missing) => {
                inner.evict(identity, &entry);
                Ok(None)
            }
            Err(LoadFailure::Failed(error)) => {
                inner.evict(identity, &entry);
                Err(error)
            }
        }
    }

    /// Evict one identity; returns true if it was cached
    pub fn invalidate(&self, identity: &Identity) -> bool {
        self.inner.invalidate(identity)
    }

    /// Evict every entry idle for longer than the expiration
    pub fn evict_expired(&self) -> usize {
        let expired: Vec<(Identity, Arc<CacheEntry>)> = self
            .inner
            .entries
            .iter()
            .filter(|e| e.value().value.get().is_some() && e.value().is_expired(self.inner.expiration))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        expired
            .iter()
            .filter(|(identity, entry)| self.inner.evict(identity, entry))
            .count()
    }

    /// Evict every entry of one class; returns how many were cached
    pub fn invalidate_class(&self, class_name: &str) -> usize {
        self.inner.invalidate_class(class_name)
    }

    /// Evict everything
    pub fn clear(&self) {
        let all: Vec<(Identity, Arc<CacheEntry>)> = self
            .inner
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (identity, entry) in all {
            self.inner.evict(&identity, &entry);
        }
    }

    /// Periodically evict expired entries until the cache is dropped
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        self.inner.live.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else { return };
                ReferencedObjectCache { inner }.evict_expired();
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        let inner = &self.inner;
        CacheStats {
            hits: inner.hits.load(Ordering::Relaxed),
            misses: inner.misses.load(Ordering::Relaxed),
            loads: inner.loads.load(Ordering::Relaxed),
            evictions: inner.evictions.load(Ordering::Relaxed),
            entries: inner.entries.len(),
            listeners: inner.listeners.len(),
        }
    }

    /// References held on the listener of `class_name`
    pub fn listener_refs(&self, class_name: &str) -> usize {
        self.inner.listeners.refs(class_name)
    }

    fn invalidation_hook(&self) -> Invalidate {
        let inner: Weak<CacheInner> = Arc::downgrade(&self.inner);
        Arc::new(move |invalidation: Invalidation<'_>| {
            let Some(inner) = inner.upgrade() else { return };
            match invalidation {
                Invalidation::Identity(identity) => {
                    inner.invalidate(identity);
                }
                Invalidation::Class(class_name) => {
                    inner.invalidate_class(class_name);
                }
            }
        })
    }
}
