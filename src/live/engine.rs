//! # Live-Query Merge Engine
//!
//! Merges a one-shot snapshot with the backend change feed into one ordered
//! notification stream.
//!
//! Protocol per subscription:
//! 1. Subscribe to the change feed of the observe query, synchronously,
//!    before the snapshot is requested.
//! 2. Emit the retrieve query's rows as creates, then the empty marker.
//! 3. Classify each change against the observe predicate: entering is a
//!    create, staying is a modify, leaving is a delete.
//!
//! Sequence numbers are restamped per subscription. A change made while the
//! snapshot is running can show up both as a snapshot row and as a create;
//! keyed consumers absorb the duplicate.

use std::sync::Arc;

use serde_json::Value;

use crate::config::RepositoryConfig;
use crate::errors::{RepoError, RepoResult};
use crate::expression::{compile, compile_predicate, CompiledExpression, CompiledPredicate, Expression};
use crate::observability::{log_event_with_fields, Event};
use crate::query::{Aggregator, Notification, QueryInfo, QueryProvider};
use crate::scheduling::Schedulers;

use super::debounce::Debouncer;
use super::stream::{live_channel, LiveReceiver, LiveSender, LiveStream};
use super::transformer::QueryTransformer;

/// Running match count of an observe query.
///
/// Starts from the aggregate count; only changes after the end of the
/// initial replay adjust it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountTracker {
    count: u64,
    replayed: bool,
}

impl CountTracker {
    pub fn new(initial: u64) -> Self {
        Self {
            count: initial,
            replayed: false,
        }
    }

    pub fn observe(&mut self, batch: &[Notification]) {
        for notification in batch {
            if notification.is_empty() {
                self.replayed = true;
            } else if !self.replayed {
                continue;
            } else if notification.is_create() {
                self.count += 1;
            } else if notification.is_delete() {
                self.count = self.count.saturating_sub(1);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// True once the end-of-initial marker was seen
    pub fn replayed(&self) -> bool {
        self.replayed
    }
}

/// Membership classification against the observe predicate
struct Classifier {
    predicate: Option<CompiledPredicate>,
    projection: Option<CompiledExpression>,
}

impl Classifier {
    fn new(predicate: Option<&Expression>, projection: Option<&Expression>) -> RepoResult<Self> {
        Ok(Self {
            predicate: predicate.map(compile_predicate).transpose()?,
            projection: projection.map(compile).transpose()?,
        })
    }

    fn matches(&self, value: Option<Value>) -> RepoResult<Option<Value>> {
        match value {
            Some(value) => {
                let keep = match &self.predicate {
                    Some(predicate) => predicate.test(&value)?,
                    None => true,
                };
                Ok(keep.then_some(value))
            }
            None => Ok(None),
        }
    }

    /// Reclassify a raw change; `None` when it never touched the set
    fn classify(&self, change: Notification, sequence: u64) -> RepoResult<Option<Notification>> {
        let old_value = self.matches(change.old_value)?;
        let new_value = self.matches(change.new_value)?;
        if old_value.is_none() && new_value.is_none() {
            return Ok(None);
        }
        let classified = Notification::of(old_value, new_value, sequence);
        match &self.projection {
            Some(projection) => Ok(Some(classified.project(projection)?)),
            None => Ok(Some(classified)),
        }
    }
}

/// Merge engine over one provider
#[derive(Clone)]
pub struct LiveQueryEngine {
    provider: Arc<dyn QueryProvider>,
    schedulers: Schedulers,
    config: RepositoryConfig,
}

impl LiveQueryEngine {
    pub fn new(
        provider: Arc<dyn QueryProvider>,
        schedulers: Schedulers,
        config: RepositoryConfig,
    ) -> Self {
        Self {
            provider,
            schedulers,
            config,
        }
    }

    /// Change feed only, classified against `observe` and projected with
    /// the retrieve projection
    pub fn observe(
        &self,
        retrieve: &QueryInfo,
        observe: &QueryInfo,
    ) -> RepoResult<LiveStream<Notification>> {
        self.merge(retrieve, observe, Replay::None)
    }

    /// Snapshot creates, the empty marker, then classified changes
    pub fn query_and_observe(
        &self,
        retrieve: &QueryInfo,
        observe: &QueryInfo,
    ) -> RepoResult<LiveStream<Notification>> {
        self.merge(retrieve, observe, Replay::Marked)
    }

    /// Snapshot creates followed by classified changes, without the marker
    pub fn query_then_observe(
        &self,
        retrieve: &QueryInfo,
        observe: &QueryInfo,
    ) -> RepoResult<LiveStream<Notification>> {
        self.merge(retrieve, observe, Replay::Unmarked)
    }

    /// Debounced, count-tracked results shaped by `transformer`.
    ///
    /// The snapshot and the feed both come from the unmapped observe query;
    /// the transformer derives the retrieve view in-process.
    pub fn observe_as<R, T>(&self, observe: &QueryInfo, mut transformer: T) -> RepoResult<LiveStream<R>>
    where
        R: Send + 'static,
        T: QueryTransformer<R>,
    {
        let observe = observe.unmapped().unpaged();
        let (receiver, upstream_guard) = self.query_and_observe(&observe, &observe)?.into_parts();
        let (sender, stream) = live_channel();

        let provider = self.provider.clone();
        let schedulers = self.schedulers.clone();
        let window = self.config.debounce_window();
        let max_size = self.config.buffer_max_size;

        let task = self.schedulers.spawn_live(async move {
            let count_query = observe.clone();
            let initial = schedulers
                .run_query(move || provider.aggregate(&count_query, &Aggregator::Count))
                .await
                .map(|count| count.and_then(|c| c.as_u64()).unwrap_or(0));
            let initial = match initial {
                Ok(count) => count,
                Err(error) => {
                    sender.error(error);
                    return;
                }
            };

            let mut tracker = CountTracker::new(initial);
            let mut batches = Debouncer::new(receiver, window, max_size);
            let mut replay: Vec<Notification> = Vec::new();

            while let Some(batch) = batches.next_batch().await {
                let batch = match batch {
                    Ok(batch) => batch,
                    Err(error) => {
                        sender.error(error);
                        return;
                    }
                };
                let was_replayed = tracker.replayed();
                tracker.observe(&batch);

                let changes: Vec<Notification> = batch.into_iter().filter(|n| !n.is_empty()).collect();
                let changes = if was_replayed {
                    changes
                } else {
                    replay.extend(changes);
                    if !tracker.replayed() {
                        continue;
                    }
                    std::mem::take(&mut replay)
                };

                log_event_with_fields(
                    Event::BatchFlushed,
                    &[
                        ("count", &tracker.count().to_string()),
                        ("size", &changes.len().to_string()),
                    ],
                );

                match transformer.transform(&changes, tracker.count()) {
                    Ok(Some(result)) => {
                        if !sender.send(result) {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(error) => {
                        sender.error(error);
                        return;
                    }
                }
            }
        });

        Ok(stream.on_cancel(move || {
            task.abort();
            drop(upstream_guard);
        }))
    }

    fn merge(
        &self,
        retrieve: &QueryInfo,
        observe: &QueryInfo,
        replay: Replay,
    ) -> RepoResult<LiveStream<Notification>> {
        let classifier = Classifier::new(observe.predicate.as_ref(), retrieve.projection.as_ref())?;

        // Subscribe before the snapshot so no change falls between them
        let (feed, feed_guard) = self.provider.live_query(&observe.unmapped())?.into_parts();
        let (sender, stream) = live_channel();

        let provider = self.provider.clone();
        let schedulers = self.schedulers.clone();
        let retrieve = retrieve.clone();

        let task = self.schedulers.spawn_live(async move {
            let mut sequence = 0u64;
            if replay != Replay::None {
                let entity_type = retrieve.entity_type.clone();
                let snapshot = schedulers.run_query(move || provider.query(&retrieve)).await;
                let rows = match snapshot {
                    Ok(rows) => rows,
                    Err(error) => {
                        sender.error(error);
                        return;
                    }
                };
                let size = rows.len();
                for row in rows {
                    let Some(value) = row.new_value else { continue };
                    sequence += 1;
                    if !sender.send(Notification::create(value, sequence)) {
                        return;
                    }
                }
                if replay == Replay::Marked {
                    sequence += 1;
                    if !sender.send(Notification::empty(sequence)) {
                        return;
                    }
                }
                log_event_with_fields(
                    Event::InitialReplayComplete,
                    &[("entity", &entity_type), ("rows", &size.to_string())],
                );
            }

            forward_changes(feed, &classifier, &sender, sequence).await;
        });

        Ok(stream.on_cancel(move || {
            task.abort();
            drop(feed_guard);
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    None,
    Unmarked,
    Marked,
}

async fn forward_changes(
    mut feed: LiveReceiver<Notification>,
    classifier: &Classifier,
    sender: &LiveSender<Notification>,
    mut sequence: u64,
) {
    while let Some(change) = feed.recv().await {
        let change = match change {
            Ok(change) => change,
            Err(error) => {
                sender.error(error);
                return;
            }
        };
        match classifier.classify(change, sequence + 1) {
            Ok(Some(notification)) => {
                sequence += 1;
                if !sender.send(notification) {
                    return;
                }
            }
            Ok(None) => {}
            Err(error) => {
                sender.error(error);
                return;
            }
        }
    }
    if !sender.is_closed() {
        sender.error(RepoError::SubscriptionClosed);
    }
}
