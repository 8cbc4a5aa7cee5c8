//! # Query Builders
//!
//! Fluent builders over one entity set. Every step validates eagerly, so a
//! malformed predicate, path or projection fails where it is written and
//! never reaches evaluation.
//!
//! - `where_*` conjoins with the existing predicate
//! - `order_by*` appends a sort key; earlier keys take precedence
//! - terminal calls snapshot the builder into an immutable `QueryInfo`, so
//!   one builder can produce several independent queries

use std::sync::Arc;

use serde_json::Value;

use crate::errors::{RepoError, RepoResult};
use crate::expression::{ensure_comparable, resolve_path, Expression, ExpressionError, ValueType};
use crate::filter::{to_expression, Filter};
use crate::live::{
    AggregateTransformer, CountTransformer, FirstTransformer, ListTransformer, LiveStream,
    QueryTransformer,
};
use crate::observability::{log_event_with_fields, Event};
use crate::schema::EntityDescriptor;

use super::aggregator::Aggregator;
use super::entity_set::RepositoryContext;
use super::info::{CollectionUpdate, DeleteInfo, PropertyUpdate, QueryInfo, SortingInfo, UpdateInfo};
use super::notification::Notification;

/// Check that `expr` ranges over instances of `descriptor` (or nothing)
fn check_scope(descriptor: &EntityDescriptor, context: &str, expr: &Expression) -> RepoResult<()> {
    if let Some(argument) = expr.argument_type()? {
        let expected = descriptor.value_type();
        if !argument.is_compatible(&expected) {
            return Err(ExpressionError::mismatch(context, expected.to_string(), argument).into());
        }
    }
    Ok(())
}

/// AND a validated predicate onto an optional existing one
fn conjoin(
    descriptor: &EntityDescriptor,
    existing: Option<Expression>,
    predicate: Expression,
) -> RepoResult<Option<Expression>> {
    predicate.validate_predicate()?;
    check_scope(descriptor, "where", &predicate)?;
    Ok(Some(match existing {
        Some(existing) => existing.and(predicate),
        None => predicate,
    }))
}

fn translate(
    context: &RepositoryContext,
    descriptor: &EntityDescriptor,
    filter: &Filter,
) -> RepoResult<Option<Expression>> {
    Ok(to_expression(&context.schema, filter, &descriptor.argument())?)
}

/// Builder for select queries
#[derive(Clone)]
pub struct SelectQueryBuilder {
    context: Arc<RepositoryContext>,
    descriptor: Arc<EntityDescriptor>,
    predicate: Option<Expression>,
    sorting: Vec<SortingInfo>,
    limit: Option<u64>,
    skip: Option<u64>,
}

impl SelectQueryBuilder {
    pub(crate) fn new(context: Arc<RepositoryContext>, descriptor: Arc<EntityDescriptor>) -> Self {
        Self {
            context,
            descriptor,
            predicate: None,
            sorting: Vec::new(),
            limit: None,
            skip: None,
        }
    }

    /// Restrict results by a predicate over the entity
    pub fn where_expr(mut self, predicate: Expression) -> RepoResult<Self> {
        self.predicate = conjoin(&self.descriptor, self.predicate.take(), predicate)?;
        Ok(self)
    }

    /// Restrict results by a declarative filter; an empty filter is a no-op
    pub fn where_filter(mut self, filter: &Filter) -> RepoResult<Self> {
        if let Some(predicate) = translate(&self.context, &self.descriptor, filter)? {
            self.predicate = conjoin(&self.descriptor, self.predicate.take(), predicate)?;
        }
        Ok(self)
    }

    /// Sort by a dotted property path
    pub fn order_by(self, path: &str, ascending: bool) -> RepoResult<Self> {
        let key = resolve_path(&self.context.schema, &self.descriptor.argument(), path)?;
        self.order_by_expr(key, ascending)
    }

    pub fn order_by_asc(self, path: &str) -> RepoResult<Self> {
        self.order_by(path, true)
    }

    pub fn order_by_desc(self, path: &str) -> RepoResult<Self> {
        self.order_by(path, false)
    }

    /// Sort by an arbitrary comparable expression
    pub fn order_by_expr(mut self, key: Expression, ascending: bool) -> RepoResult<Self> {
        ensure_comparable(&key)?;
        check_scope(&self.descriptor, "order by", &key)?;
        self.sorting.push(SortingInfo::new(key, ascending));
        Ok(self)
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Snapshot of the accumulated state
    pub fn info(&self) -> QueryInfo {
        QueryInfo::new(self.descriptor.name.clone(), self.descriptor.key_type())
            .with_predicate(self.predicate.clone())
            .with_sorting(self.sorting.clone())
            .with_limit(self.limit)
            .with_skip(self.skip)
    }

    fn projected(&self, projection: Expression, distinct: bool) -> RepoResult<QueryInfo> {
        projection.validate()?;
        check_scope(&self.descriptor, "select", &projection)?;
        Ok(self
            .info()
            .with_projection(Some(projection))
            .with_distinct(distinct))
    }

    /// One-shot query returning whole entities
    pub fn select(&self) -> SelectQuery {
        SelectQuery::new(self.context.clone(), self.descriptor.clone(), self.info())
    }

    /// One-shot query returning `projection` per entity
    pub fn select_as(&self, projection: Expression) -> RepoResult<SelectQuery> {
        let info = self.projected(projection, false)?;
        Ok(SelectQuery::new(self.context.clone(), self.descriptor.clone(), info))
    }

    /// One-shot query returning distinct projected values
    pub fn select_distinct(&self, projection: Expression) -> RepoResult<SelectQuery> {
        let info = self.projected(projection, true)?;
        Ok(SelectQuery::new(self.context.clone(), self.descriptor.clone(), info))
    }

    /// Live query returning whole entities
    pub fn live_select(&self) -> LiveSelectQuery {
        LiveSelectQuery::new(self.context.clone(), self.descriptor.clone(), self.info())
    }

    /// Live query returning `projection` per entity
    pub fn live_select_as(&self, projection: Expression) -> RepoResult<LiveSelectQuery> {
        let info = self.projected(projection, false)?;
        Ok(LiveSelectQuery::new(self.context.clone(), self.descriptor.clone(), info))
    }
}

/// Immutable one-shot query
#[derive(Clone)]
pub struct SelectQuery {
    context: Arc<RepositoryContext>,
    descriptor: Arc<EntityDescriptor>,
    info: QueryInfo,
}

impl SelectQuery {
    fn new(context: Arc<RepositoryContext>, descriptor: Arc<EntityDescriptor>, info: QueryInfo) -> Self {
        Self {
            context,
            descriptor,
            info,
        }
    }

    pub fn info(&self) -> &QueryInfo {
        &self.info
    }

    /// Ask the backend to also fetch these property paths
    pub fn properties(mut self, paths: &[&str]) -> RepoResult<Self> {
        let argument = self.descriptor.argument();
        let resolved = paths
            .iter()
            .map(|path| resolve_path(&self.context.schema, &argument, path))
            .collect::<Result<Vec<_>, _>>()?;
        self.info = self.info.with_properties(resolved);
        Ok(self)
    }

    /// First result, if any
    pub async fn first(&self) -> RepoResult<Option<Value>> {
        let info = self.info.clone().with_limit(Some(1));
        Ok(self.rows(info).await?.into_iter().next())
    }

    /// All results
    pub async fn to_list(&self) -> RepoResult<Vec<Value>> {
        self.rows(self.info.clone()).await
    }

    /// Number of results
    pub async fn count(&self) -> RepoResult<u64> {
        let value = self.aggregate(Aggregator::Count).await?;
        Ok(value.and_then(|v| v.as_u64()).unwrap_or(0))
    }

    /// Aggregate over the (projected) results
    pub async fn aggregate(&self, aggregator: Aggregator) -> RepoResult<Option<Value>> {
        let provider = self.context.provider.clone();
        let info = self.info.clone();
        let value = self
            .context
            .schedulers
            .run_query(move || provider.aggregate(&info, &aggregator))
            .await?;
        log_event_with_fields(Event::QueryExecuted, &[("entity", &self.info.entity_type)]);
        Ok(value)
    }

    async fn rows(&self, info: QueryInfo) -> RepoResult<Vec<Value>> {
        let provider = self.context.provider.clone();
        let rows = self
            .context
            .schedulers
            .run_query(move || provider.query(&info))
            .await?;
        log_event_with_fields(
            Event::QueryExecuted,
            &[
                ("entity", &self.info.entity_type),
                ("rows", &rows.len().to_string()),
            ],
        );
        Ok(rows.into_iter().filter_map(|n| n.new_value).collect())
    }
}

/// Immutable live query
#[derive(Clone)]
pub struct LiveSelectQuery {
    context: Arc<RepositoryContext>,
    descriptor: Arc<EntityDescriptor>,
    info: QueryInfo,
}

impl LiveSelectQuery {
    fn new(context: Arc<RepositoryContext>, descriptor: Arc<EntityDescriptor>, info: QueryInfo) -> Self {
        Self {
            context,
            descriptor,
            info,
        }
    }

    /// The retrieve query
    pub fn info(&self) -> &QueryInfo {
        &self.info
    }

    /// The observe query: whole entities, unpaged, fetching every property
    /// the projection and the sort keys read
    pub fn observe_info(&self) -> QueryInfo {
        let mut properties = self.info.projection_properties();
        for sorting in &self.info.sorting {
            properties.extend(sorting.expression.referenced_properties());
        }
        self.info.unmapped().unpaged().with_properties(properties)
    }

    /// Classified changes only, no snapshot
    pub fn observe(&self) -> RepoResult<LiveStream<Notification>> {
        self.context.engine.observe(&self.info, &self.observe_info())
    }

    /// Snapshot rows as creates, then classified changes
    pub fn query_and_observe(&self) -> RepoResult<LiveStream<Notification>> {
        self.context
            .engine
            .query_then_observe(&self.info, &self.observe_info())
    }

    /// Debounced results shaped by a custom transformer
    pub fn observe_as<R, T>(&self, transformer: T) -> RepoResult<LiveStream<R>>
    where
        R: Send + 'static,
        T: QueryTransformer<R>,
    {
        self.context.engine.observe_as(&self.observe_info(), transformer)
    }

    /// Current result list, re-emitted whenever it changes
    pub fn to_list(&self) -> RepoResult<LiveStream<Vec<Value>>> {
        self.observe_as(ListTransformer::new(self.descriptor.clone(), &self.info)?)
    }

    /// Current first result; `None` while nothing matches
    pub fn first(&self) -> RepoResult<LiveStream<Option<Value>>> {
        self.observe_as(FirstTransformer::new(self.descriptor.clone(), &self.info)?)
    }

    /// Current number of matching entities
    pub fn count(&self) -> RepoResult<LiveStream<u64>> {
        self.observe_as(CountTransformer::new())
    }

    /// Current aggregate over the result list
    pub fn aggregate(&self, aggregator: Aggregator) -> RepoResult<LiveStream<Option<Value>>> {
        self.observe_as(AggregateTransformer::new(
            self.descriptor.clone(),
            &self.info,
            aggregator,
        )?)
    }
}

/// Builder for set-based updates
pub struct UpdateQueryBuilder {
    context: Arc<RepositoryContext>,
    descriptor: Arc<EntityDescriptor>,
    predicate: Option<Expression>,
    assignments: Vec<PropertyUpdate>,
    collections: Vec<CollectionUpdate>,
    limit: Option<u64>,
}

impl UpdateQueryBuilder {
    pub(crate) fn new(context: Arc<RepositoryContext>, descriptor: Arc<EntityDescriptor>) -> Self {
        Self {
            context,
            descriptor,
            predicate: None,
            assignments: Vec::new(),
            collections: Vec::new(),
            limit: None,
        }
    }

    /// Assign `value` (evaluated against the entity before the update)
    pub fn set(mut self, path: &str, value: impl Into<Expression>) -> RepoResult<Self> {
        let target = resolve_path(&self.context.schema, &self.descriptor.argument(), path)?;
        let value = value.into();
        let value_type = value.validate()?;
        check_scope(&self.descriptor, "set", &value)?;
        let expected = target.value_type();
        if !value_type.is_compatible(&expected) {
            return Err(ExpressionError::mismatch(
                format!("set {}", path),
                expected.to_string(),
                value_type,
            )
            .into());
        }
        self.assignments.push(PropertyUpdate {
            path: path.to_string(),
            value,
        });
        Ok(self)
    }

    /// Append values to a list property
    pub fn add(self, path: &str, values: Vec<Value>) -> RepoResult<Self> {
        self.collection(path, values, Vec::new())
    }

    /// Remove values from a list property
    pub fn remove(self, path: &str, values: Vec<Value>) -> RepoResult<Self> {
        self.collection(path, Vec::new(), values)
    }

    fn collection(mut self, path: &str, add: Vec<Value>, remove: Vec<Value>) -> RepoResult<Self> {
        let target = resolve_path(&self.context.schema, &self.descriptor.argument(), path)?;
        if !matches!(target.value_type(), ValueType::List { .. }) {
            return Err(ExpressionError::mismatch(
                format!("collection update {}", path),
                "list",
                target.value_type(),
            )
            .into());
        }
        self.collections.push(CollectionUpdate {
            path: path.to_string(),
            add,
            remove,
        });
        Ok(self)
    }

    pub fn where_expr(mut self, predicate: Expression) -> RepoResult<Self> {
        self.predicate = conjoin(&self.descriptor, self.predicate.take(), predicate)?;
        Ok(self)
    }

    pub fn where_filter(mut self, filter: &Filter) -> RepoResult<Self> {
        if let Some(predicate) = translate(&self.context, &self.descriptor, filter)? {
            self.predicate = conjoin(&self.descriptor, self.predicate.take(), predicate)?;
        }
        Ok(self)
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn info(&self) -> UpdateInfo {
        UpdateInfo {
            entity_type: self.descriptor.name.clone(),
            predicate: self.predicate.clone(),
            assignments: self.assignments.clone(),
            collections: self.collections.clone(),
            limit: self.limit,
        }
    }

    /// Apply the update; returns the number of changed entities
    pub async fn execute(&self) -> RepoResult<u64> {
        if self.assignments.is_empty() && self.collections.is_empty() {
            return Err(RepoError::Validation(ExpressionError::InvalidComposition(
                "update sets no property".into(),
            )));
        }
        let provider = self.context.provider.clone();
        let info = self.info();
        let changed = self
            .context
            .schedulers
            .run_update(move || provider.update(&info))
            .await;
        log_write(&self.descriptor.name, "update", &changed);
        changed
    }
}

/// Builder for set-based deletes
pub struct DeleteQueryBuilder {
    context: Arc<RepositoryContext>,
    descriptor: Arc<EntityDescriptor>,
    predicate: Option<Expression>,
    limit: Option<u64>,
}

impl DeleteQueryBuilder {
    pub(crate) fn new(context: Arc<RepositoryContext>, descriptor: Arc<EntityDescriptor>) -> Self {
        Self {
            context,
            descriptor,
            predicate: None,
            limit: None,
        }
    }

    pub fn where_expr(mut self, predicate: Expression) -> RepoResult<Self> {
        self.predicate = conjoin(&self.descriptor, self.predicate.take(), predicate)?;
        Ok(self)
    }

    pub fn where_filter(mut self, filter: &Filter) -> RepoResult<Self> {
        if let Some(predicate) = translate(&self.context, &self.descriptor, filter)? {
            self.predicate = conjoin(&self.descriptor, self.predicate.take(), predicate)?;
        }
        Ok(self)
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn info(&self) -> DeleteInfo {
        DeleteInfo {
            entity_type: self.descriptor.name.clone(),
            predicate: self.predicate.clone(),
            limit: self.limit,
        }
    }

    /// Delete matching entities; returns the number removed
    pub async fn execute(&self) -> RepoResult<u64> {
        let provider = self.context.provider.clone();
        let info = self.info();
        let removed = self
            .context
            .schedulers
            .run_update(move || provider.delete(&info))
            .await;
        log_write(&self.descriptor.name, "delete", &removed);
        removed
    }
}

pub(crate) fn log_write<T>(entity: &str, operation: &str, result: &RepoResult<T>) {
    match result {
        Ok(_) => log_event_with_fields(
            Event::WriteExecuted,
            &[("entity", entity), ("operation", operation)],
        ),
        Err(RepoError::ConcurrentModification(_)) => log_event_with_fields(
            Event::WriteConflict,
            &[("entity", entity), ("operation", operation)],
        ),
        Err(_) => {}
    }
}
