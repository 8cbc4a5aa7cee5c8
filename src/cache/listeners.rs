//! Class-level change listeners
//!
//! One backend subscription per entity class, shared by every cached
//! reference of that class and kept alive by a reference count. The release
//! that takes the count to zero unsubscribes, unless a new acquire slipped
//! in under the map's shard lock first.
//!
//! A feed that fails or ends can no longer invalidate anything, so every
//! cached entry of its class is evicted. That releases the listener, and the
//! next resolve of the class subscribes afresh.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::errors::RepoResult;
use crate::live::CancelGuard;
use crate::observability::{log_event_with_fields, Event};
use crate::query::NotificationKind;

use super::referenced::{Identity, ReferenceLoader};

/// What a class listener asks the cache to evict
pub(crate) enum Invalidation<'a> {
    /// An updated or deleted identity
    Identity(&'a Identity),
    /// Every entry of a class whose feed is gone
    Class(&'a str),
}

pub(crate) type Invalidate = Arc<dyn Fn(Invalidation<'_>) + Send + Sync>;

struct ClassListener {
    refs: AtomicUsize,
    /// Set before teardown, so the end of our own feed is not taken as a failure
    closed: Arc<AtomicBool>,
    subscription: Mutex<Option<(CancelGuard, JoinHandle<()>)>>,
}

impl ClassListener {
    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some((guard, task)) = self.subscription.lock().take() {
            task.abort();
            drop(guard);
        }
    }
}

/// Ref-counted class listeners
pub(crate) struct ClassListeners {
    listeners: DashMap<String, Arc<ClassListener>>,
}

impl ClassListeners {
    pub(crate) fn new() -> Self {
        Self {
            listeners: DashMap::new(),
        }
    }

    /// Take one reference on the listener for `class_name`, subscribing on first use
    pub(crate) fn acquire(
        &self,
        class_name: &str,
        loader: &dyn ReferenceLoader,
        live: &Handle,
        invalidate: Invalidate,
    ) -> RepoResult<()> {
        match self.listeners.entry(class_name.to_string()) {
            Entry::Occupied(entry) => {
                entry.get().refs.fetch_add(1, Ordering::SeqCst);
            }
            Entry::Vacant(entry) => {
                let (mut changes, guard) = loader.subscribe_class(class_name)?.into_parts();
                let class = class_name.to_string();
                let closed = Arc::new(AtomicBool::new(false));
                let feed_closed = closed.clone();
                let task = live.spawn(async move {
                    loop {
                        match changes.recv().await {
                            Some(Ok(change)) => {
                                if matches!(change.kind, NotificationKind::Modify | NotificationKind::Delete) {
                                    invalidate(Invalidation::Identity(&change.identity));
                                }
                            }
                            _ if feed_closed.load(Ordering::SeqCst) => return,
                            Some(Err(error)) => {
                                log_event_with_fields(
                                    Event::LiveFailed,
                                    &[("class", &class), ("code", error.code()), ("error", &error.to_string())],
                                );
                                invalidate(Invalidation::Class(&class));
                                return;
                            }
                            None => {
                                invalidate(Invalidation::Class(&class));
                                return;
                            }
                        }
                    }
                });
                entry.insert(Arc::new(ClassListener {
                    refs: AtomicUsize::new(1),
                    closed,
                    subscription: Mutex::new(Some((guard, task))),
                }));
                log_event_with_fields(Event::ClassListenerCreated, &[("class", class_name)]);
            }
        }
        Ok(())
    }

    /// Drop one reference; the last one unsubscribes
    pub(crate) fn release(&self, class_name: &str) {
        let Some(listener) = self.listeners.get(class_name).map(|l| l.value().clone()) else {
            return;
        };
        if listener.refs.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let removed = self.listeners.remove_if(class_name, |_, current| {
            Arc::ptr_eq(current, &listener) && current.refs.load(Ordering::SeqCst) == 0
        });
        if removed.is_some() {
            listener.shutdown();
            log_event_with_fields(Event::ClassListenerReleased, &[("class", class_name)]);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn refs(&self, class_name: &str) -> usize {
        self.listeners
            .get(class_name)
            .map(|l| l.refs.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}
