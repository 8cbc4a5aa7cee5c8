//! # Live-Statement Multiplexer
//!
//! One backend change feed per distinct statement, shared by every
//! subscriber of that statement. Late subscribers see changes from the
//! moment they attach; there is no replay.
//!
//! Transient feed errors resubscribe upstream, at most `retry_limit` times
//! over the life of the statement. Past the bound every subscriber receives
//! `RetriesExhausted`. Resubscription leaves a gap: changes made while the
//! feed is down are not replayed.
//!
//! Teardown is driven by an atomic subscriber count. Only the release that
//! takes the count to zero removes the statement, and only if no subscriber
//! re-attached in between (both happen under the map's shard lock). The
//! backend is never called with a shard lock held: a new statement connects
//! first and is published afterwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::errors::{RepoError, RepoResult};
use crate::observability::{log_event_with_fields, Event};
use crate::query::{
    Aggregator, DeleteInfo, EntityUpdater, Notification, QueryInfo, QueryProvider, StatementKey,
    UpdateInfo,
};
use crate::schema::EntityDescriptor;

use super::stream::{live_channel, LiveSender, LiveStream};

/// Backend feed shared by all subscribers of one statement
struct SharedStatement {
    key: StatementKey,
    entity_type: String,
    subscribers: Mutex<HashMap<Uuid, LiveSender<Notification>>>,
    refs: AtomicUsize,
    upstream: Mutex<Option<JoinHandle<()>>>,
}

impl SharedStatement {
    fn new(key: StatementKey, entity_type: String) -> Self {
        Self {
            key,
            entity_type,
            subscribers: Mutex::new(HashMap::new()),
            refs: AtomicUsize::new(0),
            upstream: Mutex::new(None),
        }
    }

    fn attach(&self, id: Uuid, sender: LiveSender<Notification>) {
        self.subscribers.lock().insert(id, sender);
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    fn broadcast(&self, notification: &Notification) {
        for subscriber in self.subscribers.lock().values() {
            subscriber.send(notification.clone());
        }
    }

    /// Deliver a terminal error and detach everyone
    fn fail(&self, error: RepoError) {
        let subscribers = std::mem::take(&mut *self.subscribers.lock());
        for subscriber in subscribers.values() {
            subscriber.error(error.clone());
        }
    }

    fn shutdown(&self) {
        if let Some(task) = self.upstream.lock().take() {
            task.abort();
        }
        self.subscribers.lock().clear();
    }
}

struct Inner {
    provider: Arc<dyn QueryProvider>,
    statements: DashMap<StatementKey, Arc<SharedStatement>>,
    live: Handle,
    retry_limit: u32,
}

impl Inner {
    fn release(&self, statement: &Arc<SharedStatement>, id: Uuid) {
        statement.subscribers.lock().remove(&id);
        if statement.refs.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let removed = self.statements.remove_if(&statement.key, |_, current| {
            Arc::ptr_eq(current, statement) && current.refs.load(Ordering::SeqCst) == 0
        });
        if removed.is_some() {
            statement.shutdown();
            log_event_with_fields(Event::LiveUnsubscribed, &[("entity", &statement.entity_type)]);
        }
    }

    /// Drop a statement whose feed ended, unless it was already replaced
    fn forget(&self, statement: &Arc<SharedStatement>) {
        self.statements
            .remove_if(&statement.key, |_, current| Arc::ptr_eq(current, statement));
    }
}

/// Shares backend live subscriptions between structurally equal queries
#[derive(Clone)]
pub struct LiveStatementMultiplexer {
    inner: Arc<Inner>,
}

impl LiveStatementMultiplexer {
    pub fn new(provider: Arc<dyn QueryProvider>, live: Handle, retry_limit: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                statements: DashMap::new(),
                live,
                retry_limit,
            }),
        }
    }

    /// Attach to the shared feed of `info`, opening it if needed.
    ///
    /// The backend subscription exists once this returns.
    pub fn subscribe(&self, info: &QueryInfo) -> RepoResult<LiveStream<Notification>> {
        let key = info.statement_key()?;
        let (sender, stream) = live_channel();
        let id = Uuid::new_v4();

        let statement = match self.attach_existing(&key, id, &sender) {
            Some(statement) => statement,
            None => self.open(key, info, id, &sender)?,
        };

        let inner = Arc::downgrade(&self.inner);
        sender.on_cancel(move || {
            if let Some(inner) = inner.upgrade() {
                inner.release(&statement, id);
            }
        });
        Ok(stream)
    }

    fn attach_existing(
        &self,
        key: &StatementKey,
        id: Uuid,
        sender: &LiveSender<Notification>,
    ) -> Option<Arc<SharedStatement>> {
        // attach under the shard lock, so a racing release sees the new count
        let entry = self.inner.statements.get(key)?;
        entry.attach(id, sender.clone());
        Some(entry.value().clone())
    }

    /// Connect upstream without holding the map, then publish the statement.
    ///
    /// A subscriber that loses the race to publish attaches to the winner
    /// and drops its own feed.
    fn open(
        &self,
        key: StatementKey,
        info: &QueryInfo,
        id: Uuid,
        sender: &LiveSender<Notification>,
    ) -> RepoResult<Arc<SharedStatement>> {
        let mut attempts = 0;
        let feed = connect(
            self.inner.provider.as_ref(),
            info,
            self.inner.retry_limit,
            &mut attempts,
            None,
        )?;

        match self.inner.statements.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let statement = entry.get().clone();
                statement.attach(id, sender.clone());
                drop(entry);
                feed.cancel();
                Ok(statement)
            }
            Entry::Vacant(entry) => {
                let statement = Arc::new(SharedStatement::new(key, info.entity_type.clone()));
                statement.attach(id, sender.clone());
                let task = self.inner.live.spawn(run_upstream(
                    Arc::downgrade(&self.inner),
                    statement.clone(),
                    info.clone(),
                    feed,
                    attempts,
                ));
                *statement.upstream.lock() = Some(task);
                entry.insert(statement.clone());

                log_event_with_fields(Event::LiveSubscribed, &[("entity", &info.entity_type)]);
                Ok(statement)
            }
        }
    }

    /// Number of shared statements currently open
    pub fn active_statements(&self) -> usize {
        self.inner.statements.len()
    }

    /// Subscribers attached to the statement of `info`
    pub fn subscriber_count(&self, info: &QueryInfo) -> usize {
        info.statement_key()
            .ok()
            .and_then(|key| self.inner.statements.get(&key).map(|s| s.refs.load(Ordering::SeqCst)))
            .unwrap_or(0)
    }
}

/// Open a backend feed, retrying transient failures within the bound.
///
/// `last` is the error that caused the reconnect, if any.
fn connect(
    provider: &dyn QueryProvider,
    info: &QueryInfo,
    retry_limit: u32,
    attempts: &mut u32,
    mut last: Option<RepoError>,
) -> RepoResult<LiveStream<Notification>> {
    loop {
        if let Some(error) = last.take() {
            if !error.is_transient() {
                return Err(error);
            }
            if *attempts >= retry_limit {
                return Err(RepoError::RetriesExhausted {
                    attempts: *attempts,
                    last_error: error.to_string(),
                });
            }
            *attempts += 1;
            log_event_with_fields(
                Event::LiveRetry,
                &[
                    ("attempt", &attempts.to_string()),
                    ("entity", &info.entity_type),
                    ("error", &error.to_string()),
                ],
            );
        }
        match provider.live_query(info) {
            Ok(feed) => return Ok(feed),
            Err(error) => last = Some(error),
        }
    }
}

async fn run_upstream(
    inner: Weak<Inner>,
    statement: Arc<SharedStatement>,
    info: QueryInfo,
    mut feed: LiveStream<Notification>,
    mut attempts: u32,
) {
    loop {
        match feed.next().await {
            Some(Ok(notification)) => statement.broadcast(&notification),
            Some(Err(error)) => {
                let Some(owner) = inner.upgrade() else { return };
                let reconnected = connect(
                    owner.provider.as_ref(),
                    &info,
                    owner.retry_limit,
                    &mut attempts,
                    Some(error),
                );
                match reconnected {
                    Ok(next) => feed = next,
                    Err(error) => {
                        log_event_with_fields(
                            Event::LiveFailed,
                            &[("code", error.code()), ("entity", &info.entity_type)],
                        );
                        owner.forget(&statement);
                        statement.fail(error);
                        return;
                    }
                }
            }
            None => {
                if let Some(owner) = inner.upgrade() {
                    owner.forget(&statement);
                }
                statement.subscribers.lock().clear();
                return;
            }
        }
    }
}

/// Provider decorator routing live queries through a multiplexer
pub struct MultiplexingQueryProvider {
    provider: Arc<dyn QueryProvider>,
    multiplexer: LiveStatementMultiplexer,
}

impl MultiplexingQueryProvider {
    pub fn new(provider: Arc<dyn QueryProvider>, live: Handle, retry_limit: u32) -> Self {
        Self {
            multiplexer: LiveStatementMultiplexer::new(provider.clone(), live, retry_limit),
            provider,
        }
    }

    pub fn multiplexer(&self) -> &LiveStatementMultiplexer {
        &self.multiplexer
    }
}

impl QueryProvider for MultiplexingQueryProvider {
    fn insert_or_update(
        &self,
        descriptor: &EntityDescriptor,
        entity: Value,
        recursive: bool,
    ) -> RepoResult<Value> {
        self.provider.insert_or_update(descriptor, entity, recursive)
    }

    fn insert_or_update_with(
        &self,
        descriptor: &EntityDescriptor,
        key: &Value,
        recursive: bool,
        updater: EntityUpdater,
    ) -> RepoResult<Option<Value>> {
        self.provider
            .insert_or_update_with(descriptor, key, recursive, updater)
    }

    fn update(&self, info: &UpdateInfo) -> RepoResult<u64> {
        self.provider.update(info)
    }

    fn delete(&self, info: &DeleteInfo) -> RepoResult<u64> {
        self.provider.delete(info)
    }

    fn query(&self, info: &QueryInfo) -> RepoResult<Vec<Notification>> {
        self.provider.query(info)
    }

    fn live_query(&self, info: &QueryInfo) -> RepoResult<LiveStream<Notification>> {
        self.multiplexer.subscribe(info)
    }

    fn aggregate(&self, info: &QueryInfo, aggregator: &Aggregator) -> RepoResult<Option<Value>> {
        self.provider.aggregate(info, aggregator)
    }
}
