//! # Result Shaping
//!
//! Transformers turn batches of classified notifications over whole
//! entities into the value a live query exposes: the current list, its
//! first element, the match count or an aggregate. The retrieve query's
//! filter, order, paging and projection are recomputed in-process on every
//! batch; the backend is never re-queried per change.
//!
//! Every transformer suppresses results equal to the last one it emitted.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::errors::RepoResult;
use crate::query::{Aggregator, CompiledQuery, Notification, QueryInfo};
use crate::schema::{canonical_key, EntityDescriptor};

/// Shapes batches of notifications into results
pub trait QueryTransformer<R>: Send + 'static {
    /// Fold one batch into the transformer's state.
    ///
    /// `count` is the tracked number of entities matching the observe
    /// query. Returns `None` when nothing observable changed.
    fn transform(&mut self, batch: &[Notification], count: u64) -> RepoResult<Option<R>>;
}

impl<R, F> QueryTransformer<R> for F
where
    F: FnMut(&[Notification], u64) -> RepoResult<Option<R>> + Send + 'static,
{
    fn transform(&mut self, batch: &[Notification], count: u64) -> RepoResult<Option<R>> {
        self(batch, count)
    }
}

/// Keyed set of matching entities plus the compiled retrieve query
struct ResultSet {
    descriptor: Arc<EntityDescriptor>,
    entities: BTreeMap<String, Value>,
    query: CompiledQuery,
}

impl ResultSet {
    fn new(descriptor: Arc<EntityDescriptor>, retrieve: &QueryInfo) -> RepoResult<Self> {
        Ok(Self {
            descriptor,
            entities: BTreeMap::new(),
            query: CompiledQuery::new(retrieve)?,
        })
    }

    fn key_of(&self, entity: &Value) -> String {
        self.descriptor
            .key_string(entity)
            .unwrap_or_else(|| canonical_key(entity))
    }

    fn apply(&mut self, batch: &[Notification]) {
        for notification in batch {
            match (&notification.old_value, &notification.new_value) {
                (_, Some(new_value)) => {
                    let key = self.key_of(new_value);
                    self.entities.insert(key, new_value.clone());
                }
                (Some(old_value), None) => {
                    let key = self.key_of(old_value);
                    self.entities.remove(&key);
                }
                (None, None) => {}
            }
        }
    }

    /// Current retrieve-query view
    fn current(&self) -> RepoResult<Vec<Value>> {
        self.query.run(self.entities.values())
    }
}

/// Remembers the last emitted result
struct Distinct<R> {
    last: Option<R>,
}

impl<R: Clone + PartialEq> Distinct<R> {
    fn new() -> Self {
        Self { last: None }
    }

    fn emit(&mut self, value: R) -> Option<R> {
        if self.last.as_ref() == Some(&value) {
            return None;
        }
        self.last = Some(value.clone());
        Some(value)
    }
}

/// Current sorted, paged and projected result list
pub struct ListTransformer {
    results: ResultSet,
    distinct: Distinct<Vec<Value>>,
}

impl ListTransformer {
    pub fn new(descriptor: Arc<EntityDescriptor>, retrieve: &QueryInfo) -> RepoResult<Self> {
        Ok(Self {
            results: ResultSet::new(descriptor, retrieve)?,
            distinct: Distinct::new(),
        })
    }
}

impl QueryTransformer<Vec<Value>> for ListTransformer {
    fn transform(&mut self, batch: &[Notification], _count: u64) -> RepoResult<Option<Vec<Value>>> {
        self.results.apply(batch);
        Ok(self.distinct.emit(self.results.current()?))
    }
}

/// Current first element, `None` while nothing matches
pub struct FirstTransformer {
    results: ResultSet,
    distinct: Distinct<Option<Value>>,
}

impl FirstTransformer {
    pub fn new(descriptor: Arc<EntityDescriptor>, retrieve: &QueryInfo) -> RepoResult<Self> {
        let first = retrieve.clone().with_limit(Some(1));
        Ok(Self {
            results: ResultSet::new(descriptor, &first)?,
            distinct: Distinct::new(),
        })
    }
}

impl QueryTransformer<Option<Value>> for FirstTransformer {
    fn transform(&mut self, batch: &[Notification], _count: u64) -> RepoResult<Option<Option<Value>>> {
        self.results.apply(batch);
        let first = self.results.current()?.into_iter().next();
        Ok(self.distinct.emit(first))
    }
}

/// Tracked match count
pub struct CountTransformer {
    distinct: Distinct<u64>,
}

impl CountTransformer {
    pub fn new() -> Self {
        Self {
            distinct: Distinct::new(),
        }
    }
}

impl Default for CountTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryTransformer<u64> for CountTransformer {
    fn transform(&mut self, _batch: &[Notification], count: u64) -> RepoResult<Option<u64>> {
        Ok(self.distinct.emit(count))
    }
}

/// Aggregate recomputed over the current result list
pub struct AggregateTransformer {
    results: ResultSet,
    aggregator: Aggregator,
    distinct: Distinct<Option<Value>>,
}

impl AggregateTransformer {
    pub fn new(
        descriptor: Arc<EntityDescriptor>,
        retrieve: &QueryInfo,
        aggregator: Aggregator,
    ) -> RepoResult<Self> {
        Ok(Self {
            results: ResultSet::new(descriptor, retrieve)?,
            aggregator,
            distinct: Distinct::new(),
        })
    }
}

impl QueryTransformer<Option<Value>> for AggregateTransformer {
    fn transform(&mut self, batch: &[Notification], _count: u64) -> RepoResult<Option<Option<Value>>> {
        self.results.apply(batch);
        let value = self.aggregator.apply(&self.results.current()?)?;
        Ok(self.distinct.emit(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{Expression, ValueType};
    use crate::query::SortingInfo;
    use crate::schema::PropertyDescriptor;
    use serde_json::json;

    fn descriptor() -> Arc<EntityDescriptor> {
        Arc::new(
            EntityDescriptor::new("Product", "key", ValueType::String)
                .with_property(PropertyDescriptor::new("number", ValueType::Integer).filterable()),
        )
    }

    fn number() -> Expression {
        Expression::entity("Product").property("number", ValueType::Integer)
    }

    fn product(key: &str, number: i64) -> Value {
        json!({"key": key, "number": number})
    }

    fn retrieve() -> QueryInfo {
        QueryInfo::new("Product", ValueType::String)
            .with_predicate(Some(number().less_than(10)))
            .with_sorting(vec![SortingInfo::new(number(), true)])
    }

    #[test]
    fn test_list_tracks_membership_and_order() {
        let mut list = ListTransformer::new(descriptor(), &retrieve()).unwrap();

        let initial = vec![
            Notification::create(product("a", 5), 1),
            Notification::create(product("b", 2), 2),
        ];
        assert_eq!(
            list.transform(&initial, 2).unwrap(),
            Some(vec![product("b", 2), product("a", 5)])
        );

        let changes = vec![
            Notification::modify(product("b", 2), product("b", 8), 3),
            Notification::delete(product("a", 5), 4),
        ];
        assert_eq!(list.transform(&changes, 1).unwrap(), Some(vec![product("b", 8)]));
    }

    #[test]
    fn test_list_recomputes_predicate_in_process() {
        let mut list = ListTransformer::new(descriptor(), &retrieve()).unwrap();
        let batch = vec![Notification::create(product("a", 50), 1)];
        assert_eq!(list.transform(&batch, 1).unwrap(), Some(vec![]));
    }

    #[test]
    fn test_list_suppresses_unchanged_results() {
        let mut list = ListTransformer::new(descriptor(), &retrieve()).unwrap();
        let batch = vec![Notification::create(product("a", 1), 1)];
        assert!(list.transform(&batch, 1).unwrap().is_some());
        assert_eq!(list.transform(&batch, 1).unwrap(), None);
    }

    #[test]
    fn test_list_pages_and_projects() {
        let query = retrieve()
            .with_skip(Some(1))
            .with_limit(Some(1))
            .with_projection(Some(number()));
        let mut list = ListTransformer::new(descriptor(), &query).unwrap();
        let batch = vec![
            Notification::create(product("a", 3), 1),
            Notification::create(product("b", 1), 2),
            Notification::create(product("c", 2), 3),
        ];
        assert_eq!(list.transform(&batch, 3).unwrap(), Some(vec![json!(2)]));
    }

    #[test]
    fn test_first_reports_empty_set() {
        let mut first = FirstTransformer::new(descriptor(), &retrieve()).unwrap();
        assert_eq!(
            first
                .transform(&[Notification::create(product("a", 4), 1)], 1)
                .unwrap(),
            Some(Some(product("a", 4)))
        );
        assert_eq!(
            first
                .transform(&[Notification::delete(product("a", 4), 2)], 0)
                .unwrap(),
            Some(None)
        );
    }

    #[test]
    fn test_count_distinct_until_changed() {
        let mut count = CountTransformer::new();
        assert_eq!(count.transform(&[], 2).unwrap(), Some(2));
        assert_eq!(count.transform(&[], 2).unwrap(), None);
        assert_eq!(count.transform(&[], 1).unwrap(), Some(1));
    }

    #[test]
    fn test_aggregate_over_current_results() {
        let mut sum =
            AggregateTransformer::new(descriptor(), &retrieve(), Aggregator::Sum(number())).unwrap();
        let batch = vec![
            Notification::create(product("a", 4), 1),
            Notification::create(product("b", 5), 2),
        ];
        assert_eq!(sum.transform(&batch, 2).unwrap(), Some(Some(json!(9))));
    }
}
