//! # Entity Sets
//!
//! `Repository` binds a schema registry, a backend, the worker pools and the
//! configuration together. `EntitySet` is the typed surface over one entity
//! type: single-entity writes plus the select, update and delete builders.
//!
//! The repository stacks two decorators on the backend: a resolver that
//! materializes links through the repository's reference cache, and in
//! front of it a statement multiplexer, so equal live queries share one
//! feed.

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::cache::{ReferenceLoader, ReferenceResolver, ReferencedObjectCache, ResolvingQueryProvider};
use crate::config::RepositoryConfig;
use crate::errors::{RepoError, RepoResult};
use crate::expression::Expression;
use crate::live::{LiveQueryEngine, LiveStatementMultiplexer, MultiplexingQueryProvider};
use crate::scheduling::Schedulers;
use crate::schema::{EntityDescriptor, SchemaRegistry};

use super::builder::{log_write, DeleteQueryBuilder, SelectQueryBuilder, UpdateQueryBuilder};
use super::provider::{EntityUpdater, QueryProvider};

/// Everything a query needs at execution time
pub struct RepositoryContext {
    pub schema: Arc<SchemaRegistry>,
    pub provider: Arc<dyn QueryProvider>,
    pub schedulers: Schedulers,
    pub engine: LiveQueryEngine,
    pub config: RepositoryConfig,
    pub references: ReferencedObjectCache,
    sweeper: JoinHandle<()>,
}

impl Drop for RepositoryContext {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

/// Typed repository over one backend
#[derive(Clone)]
pub struct Repository {
    context: Arc<RepositoryContext>,
    multiplexer: LiveStatementMultiplexer,
}

impl Repository {
    /// Repository over `backend`, which also loads referenced entities
    pub fn new<B>(
        schema: Arc<SchemaRegistry>,
        backend: Arc<B>,
        schedulers: Schedulers,
        config: RepositoryConfig,
    ) -> RepoResult<Self>
    where
        B: QueryProvider + ReferenceLoader + 'static,
    {
        config.validate()?;

        let loader: Arc<dyn ReferenceLoader> = backend.clone();
        let references = ReferencedObjectCache::new(
            loader,
            config.cache_expiration(),
            schedulers.live().clone(),
        );
        let sweeper = references.spawn_sweeper(config.cache_expiration());

        let resolving = ResolvingQueryProvider::new(
            backend,
            ReferenceResolver::new(schema.clone(), references.clone()),
            schedulers.live().clone(),
        );
        let multiplexing = MultiplexingQueryProvider::new(
            Arc::new(resolving),
            schedulers.live().clone(),
            config.live_retry_limit,
        );
        let multiplexer = multiplexing.multiplexer().clone();
        let provider: Arc<dyn QueryProvider> = Arc::new(multiplexing);
        let engine = LiveQueryEngine::new(provider.clone(), schedulers.clone(), config.clone());

        Ok(Self {
            context: Arc::new(RepositoryContext {
                schema,
                provider,
                schedulers,
                engine,
                config,
                references,
                sweeper,
            }),
            multiplexer,
        })
    }

    /// Entity set for a registered type
    pub fn entities(&self, entity_type: &str) -> RepoResult<EntitySet> {
        let descriptor = self.context.schema.require(entity_type)?;
        Ok(EntitySet {
            context: self.context.clone(),
            descriptor,
        })
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.context.schema
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.context.config
    }

    /// Shared live statements
    pub fn multiplexer(&self) -> &LiveStatementMultiplexer {
        &self.multiplexer
    }

    /// Cache that resolves links between stored entities
    pub fn references(&self) -> &ReferencedObjectCache {
        &self.context.references
    }
}

/// Typed access to one entity type
#[derive(Clone)]
pub struct EntitySet {
    context: Arc<RepositoryContext>,
    descriptor: Arc<EntityDescriptor>,
}

impl EntitySet {
    pub fn descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    /// Argument expression over this entity type
    pub fn argument(&self) -> Expression {
        self.descriptor.argument()
    }

    pub fn query(&self) -> SelectQueryBuilder {
        SelectQueryBuilder::new(self.context.clone(), self.descriptor.clone())
    }

    pub fn update(&self) -> UpdateQueryBuilder {
        UpdateQueryBuilder::new(self.context.clone(), self.descriptor.clone())
    }

    pub fn delete(&self) -> DeleteQueryBuilder {
        DeleteQueryBuilder::new(self.context.clone(), self.descriptor.clone())
    }

    /// Store an entity and every referenced entity it embeds
    pub async fn insert_or_update(&self, entity: Value) -> RepoResult<Value> {
        self.store(entity, true).await
    }

    /// Store an entity; embedded references are kept as they are
    pub async fn insert_or_update_non_recursive(&self, entity: Value) -> RepoResult<Value> {
        self.store(entity, false).await
    }

    /// Store several entities in order; stops at the first failure
    pub async fn insert_all(&self, entities: Vec<Value>) -> RepoResult<Vec<Value>> {
        let mut stored = Vec::with_capacity(entities.len());
        for entity in entities {
            stored.push(self.store(entity, true).await?);
        }
        Ok(stored)
    }

    /// Read-modify-write of the entity with `key`.
    ///
    /// `updater` sees the current value, or `None` if there is none. An
    /// unchanged or `None` result writes nothing; the current value is
    /// returned either way.
    pub async fn update_with<F>(&self, key: Value, updater: F) -> RepoResult<Option<Value>>
    where
        F: FnOnce(Option<Value>) -> Option<Value> + Send + 'static,
    {
        let updater: EntityUpdater = Box::new(move |current: Option<Value>| {
            match updater(current.clone()) {
                Some(next) if current.as_ref() == Some(&next) => None,
                next => next,
            }
        });

        let provider = self.context.provider.clone();
        let descriptor = self.descriptor.clone();
        let result = self
            .context
            .schedulers
            .run_update(move || provider.insert_or_update_with(&descriptor, &key, true, updater))
            .await;
        log_write(&self.descriptor.name, "update_with", &result);
        result
    }

    async fn store(&self, entity: Value, recursive: bool) -> RepoResult<Value> {
        if self.descriptor.key_of(&entity).is_none() {
            return Err(RepoError::backend(format!(
                "{} instance without key property '{}'",
                self.descriptor.name, self.descriptor.key_property
            )));
        }
        let provider = self.context.provider.clone();
        let descriptor = self.descriptor.clone();
        let result = self
            .context
            .schedulers
            .run_update(move || provider.insert_or_update(&descriptor, entity, recursive))
            .await;
        log_write(&self.descriptor.name, "insert_or_update", &result);
        result
    }
}
