//! Entity Set Tests
//!
//! One-shot reads and writes through the typed entity-set facade over the
//! in-memory backend:
//! - Builders conjoin predicates and append sort keys
//! - Terminal calls snapshot independent queries
//! - Set-based updates and deletes honor predicates and limits
//! - Read-modify-write skips unchanged values
//! - Backend write conflicts reach the caller unchanged

use std::sync::Arc;

use aerorepo::expression::{Expression, ValueType};
use aerorepo::filter::{ComparableFilter, Filter, ObjectFilter};
use aerorepo::memory::MemoryQueryProvider;
use aerorepo::query::{Aggregator, QueryProvider, Repository};
use aerorepo::scheduling::Schedulers;
use aerorepo::schema::{EntityDescriptor, PropertyDescriptor, SchemaRegistry};
use aerorepo::{RepoError, RepositoryConfig};
use serde_json::{json, Value};

// =============================================================================
// Helper Functions
// =============================================================================

fn schema() -> Arc<SchemaRegistry> {
    let registry = SchemaRegistry::new()
        .with([
            EntityDescriptor::new("RefEntity", "id", ValueType::Integer)
                .with_property(PropertyDescriptor::new("text", ValueType::String).filterable()),
            EntityDescriptor::new("Product", "key", ValueType::String)
                .with_property(
                    PropertyDescriptor::new("number", ValueType::Integer)
                        .filterable()
                        .indexable(),
                )
                .with_property(
                    PropertyDescriptor::new("text", ValueType::String)
                        .filterable()
                        .searchable(),
                )
                .with_property(
                    PropertyDescriptor::new("refEntity", ValueType::entity("RefEntity")).filterable(),
                )
                .with_property(PropertyDescriptor::new("tags", ValueType::list(ValueType::String))),
        ])
        .unwrap();
    Arc::new(registry)
}

fn setup() -> (Arc<MemoryQueryProvider>, Repository) {
    let schema = schema();
    let provider = Arc::new(MemoryQueryProvider::new(schema.clone()));
    let repository = Repository::new(
        schema,
        provider.clone(),
        Schedulers::current().unwrap(),
        RepositoryConfig::default(),
    )
    .unwrap();
    (provider, repository)
}

fn number() -> Expression {
    Expression::entity("Product").property("number", ValueType::Integer)
}

fn text() -> Expression {
    Expression::entity("Product").property("text", ValueType::String)
}

fn product(key: &str, number: i64, text: &str) -> Value {
    json!({"key": key, "number": number, "text": text})
}

async fn seed(repository: &Repository) {
    repository
        .entities("Product")
        .unwrap()
        .insert_all(vec![
            product("a", 3, "Entity1"),
            product("b", 1, "Entity2"),
            product("c", 7, "Other"),
            product("d", 5, "Entity4"),
        ])
        .await
        .unwrap();
}

fn keys(rows: &[Value]) -> Vec<&str> {
    rows.iter().filter_map(|r| r["key"].as_str()).collect()
}

// =============================================================================
// Select Tests
// =============================================================================

/// Predicates, order, skip and limit apply together.
#[tokio::test]
async fn test_select_filters_orders_and_pages() {
    let (_, repository) = setup();
    seed(&repository).await;
    let products = repository.entities("Product").unwrap();

    let rows = products
        .query()
        .where_expr(number().less_than(6))
        .unwrap()
        .order_by_asc("number")
        .unwrap()
        .skip(1)
        .limit(2)
        .select()
        .to_list()
        .await
        .unwrap();

    assert_eq!(keys(&rows), vec!["a", "d"]);
}

/// Successive `where` calls are conjoined, never replaced.
#[tokio::test]
async fn test_where_calls_conjoin() {
    let (_, repository) = setup();
    seed(&repository).await;
    let products = repository.entities("Product").unwrap();

    let rows = products
        .query()
        .where_expr(number().greater_than(1))
        .unwrap()
        .where_expr(text().starts_with("Entity"))
        .unwrap()
        .order_by_desc("number")
        .unwrap()
        .select()
        .to_list()
        .await
        .unwrap();

    assert_eq!(keys(&rows), vec!["d", "a"]);
}

/// Sort keys keep call order as tie-break precedence.
#[tokio::test]
async fn test_order_by_appends_keys() {
    let (_, repository) = setup();
    let products = repository.entities("Product").unwrap();
    products
        .insert_all(vec![
            product("x", 1, "b"),
            product("y", 1, "a"),
            product("z", 0, "c"),
        ])
        .await
        .unwrap();

    let rows = products
        .query()
        .order_by_asc("number")
        .unwrap()
        .order_by_asc("text")
        .unwrap()
        .select()
        .to_list()
        .await
        .unwrap();

    assert_eq!(keys(&rows), vec!["z", "y", "x"]);
}

/// One builder yields independent query snapshots.
#[tokio::test]
async fn test_terminal_calls_snapshot_builder() {
    let (_, repository) = setup();
    let products = repository.entities("Product").unwrap();

    let builder = products.query().where_expr(number().less_than(5)).unwrap();
    let first = builder.select();
    let narrowed = builder.clone().limit(1).select();

    assert_eq!(first.info().limit, None);
    assert_eq!(narrowed.info().limit, Some(1));
    assert_eq!(first.info().predicate, narrowed.info().predicate);
}

/// Filters translate and conjoin like expressions.
#[tokio::test]
async fn test_where_filter_and_search_text() {
    let (_, repository) = setup();
    seed(&repository).await;
    let products = repository.entities("Product").unwrap();

    let filter: Filter = ObjectFilter::new()
        .property("number", ComparableFilter::new().greater_or_equal(3))
        .search_text("Entity")
        .into();
    let rows = products
        .query()
        .where_filter(&filter)
        .unwrap()
        .order_by_asc("key")
        .unwrap()
        .select()
        .to_list()
        .await
        .unwrap();

    assert_eq!(keys(&rows), vec!["a", "d"]);
}

/// Projections and distinct projections.
#[tokio::test]
async fn test_select_as_and_distinct() {
    let (_, repository) = setup();
    let products = repository.entities("Product").unwrap();
    products
        .insert_all(vec![
            product("a", 1, "same"),
            product("b", 2, "same"),
            product("c", 3, "other"),
        ])
        .await
        .unwrap();

    let builder = products.query().order_by_asc("number").unwrap();
    let projected = builder.select_as(text()).unwrap().to_list().await.unwrap();
    assert_eq!(projected, vec![json!("same"), json!("same"), json!("other")]);

    let distinct = builder.select_distinct(text()).unwrap().to_list().await.unwrap();
    assert_eq!(distinct, vec![json!("same"), json!("other")]);
}

/// First, count and the aggregate functions.
#[tokio::test]
async fn test_first_count_and_aggregates() {
    let (_, repository) = setup();
    seed(&repository).await;
    let products = repository.entities("Product").unwrap();

    let query = products.query().order_by_desc("number").unwrap().select();
    assert_eq!(query.first().await.unwrap().unwrap()["key"], "c");
    assert_eq!(query.count().await.unwrap(), 4);
    assert_eq!(
        query.aggregate(Aggregator::Sum(number())).await.unwrap(),
        Some(json!(16))
    );
    assert_eq!(
        query.aggregate(Aggregator::Min(number())).await.unwrap(),
        Some(json!(1))
    );
    assert_eq!(
        query.aggregate(Aggregator::Max(number())).await.unwrap(),
        Some(json!(7))
    );
    assert_eq!(
        query.aggregate(Aggregator::Average(number())).await.unwrap(),
        Some(json!(4.0))
    );

    let empty = products
        .query()
        .where_expr(number().greater_than(100))
        .unwrap()
        .select();
    assert_eq!(empty.first().await.unwrap(), None);
    assert_eq!(empty.count().await.unwrap(), 0);
    assert_eq!(empty.aggregate(Aggregator::Max(number())).await.unwrap(), None);
}

// =============================================================================
// Build-time Validation Tests
// =============================================================================

/// Malformed queries fail where they are written.
#[tokio::test]
async fn test_build_errors_fail_fast() {
    let (_, repository) = setup();
    let products = repository.entities("Product").unwrap();

    let err = products.query().order_by_asc("refEntity.missing").err().unwrap();
    assert!(err.is_validation());

    let err = products.query().where_expr(number()).err().unwrap();
    assert!(err.is_validation());

    let foreign = Expression::entity("RefEntity")
        .property("id", ValueType::Integer)
        .equal_to(1);
    assert!(products.query().where_expr(foreign).is_err());

    let err = products.query().order_by_asc("refEntity").err().unwrap();
    assert!(err.is_validation());

    let err = repository.entities("Missing").err().unwrap();
    assert_eq!(err, RepoError::UnknownEntity("Missing".into()));
}

// =============================================================================
// Write Tests
// =============================================================================

/// Recursive writes also store embedded entities.
#[tokio::test]
async fn test_recursive_insert_stores_references() {
    let (provider, repository) = setup();
    let products = repository.entities("Product").unwrap();

    products
        .insert_or_update(json!({"key": "a", "refEntity": {"id": 10, "text": "ref"}}))
        .await
        .unwrap();
    assert_eq!(provider.len("RefEntity"), 1);

    products
        .insert_or_update_non_recursive(json!({"key": "b", "refEntity": {"id": 11}}))
        .await
        .unwrap();
    assert_eq!(provider.len("RefEntity"), 1);
    assert_eq!(provider.len("Product"), 2);

    let rows = products
        .query()
        .where_expr(
            Expression::entity("Product")
                .property("refEntity", ValueType::entity("RefEntity"))
                .property("id", ValueType::Integer)
                .equal_to(11),
        )
        .unwrap()
        .select()
        .to_list()
        .await
        .unwrap();
    assert_eq!(keys(&rows), vec!["b"]);
}

/// A write to a referenced entity shows through every entity linking to it.
#[tokio::test]
async fn test_referenced_write_visible_through_parent() {
    let (provider, repository) = setup();
    let products = repository.entities("Product").unwrap();
    let ref_text = Expression::entity("Product")
        .property("refEntity", ValueType::entity("RefEntity"))
        .property("text", ValueType::String);

    let stored = products
        .insert_or_update(json!({"key": "p", "refEntity": {"id": 10, "text": "old"}}))
        .await
        .unwrap();
    assert_eq!(stored["refEntity"], json!({"id": 10, "text": "old"}));

    let rows = products.query().select().to_list().await.unwrap();
    assert_eq!(rows[0]["refEntity"]["text"], "old");
    assert_eq!(repository.references().stats().entries, 1);

    repository
        .entities("RefEntity")
        .unwrap()
        .insert_or_update(json!({"id": 10, "text": "new"}))
        .await
        .unwrap();
    assert_eq!(provider.len("RefEntity"), 1);

    let rows = products.query().select().to_list().await.unwrap();
    assert_eq!(rows[0]["refEntity"], json!({"id": 10, "text": "new"}));

    let matching = products
        .query()
        .where_expr(ref_text.clone().equal_to("new"))
        .unwrap()
        .select();
    assert_eq!(matching.count().await.unwrap(), 1);
    assert_eq!(matching.aggregate(Aggregator::Count).await.unwrap(), Some(json!(1)));

    let stale = products
        .query()
        .where_expr(ref_text.equal_to("old"))
        .unwrap()
        .select();
    assert_eq!(stale.count().await.unwrap(), 0);
}

/// Live changes carry materialized references and filter on them.
#[tokio::test]
async fn test_live_changes_resolve_references() {
    let (_, repository) = setup();
    let products = repository.entities("Product").unwrap();
    let ref_text = Expression::entity("Product")
        .property("refEntity", ValueType::entity("RefEntity"))
        .property("text", ValueType::String);
    let mut feed = products
        .query()
        .where_expr(ref_text.equal_to("wanted"))
        .unwrap()
        .live_select()
        .observe()
        .unwrap();

    products
        .insert_or_update(json!({"key": "x", "refEntity": {"id": 1, "text": "other"}}))
        .await
        .unwrap();
    products
        .insert_or_update(json!({"key": "y", "refEntity": {"id": 2, "text": "wanted"}}))
        .await
        .unwrap();

    let change = feed.next().await.unwrap().unwrap();
    assert!(change.is_create());
    assert_eq!(
        change.new_value,
        Some(json!({"key": "y", "refEntity": {"id": 2, "text": "wanted"}}))
    );
}

/// Updates and deletes select by the materialized entity.
#[tokio::test]
async fn test_writes_select_through_references() {
    let (provider, repository) = setup();
    let products = repository.entities("Product").unwrap();
    let ref_text = Expression::entity("Product")
        .property("refEntity", ValueType::entity("RefEntity"))
        .property("text", ValueType::String);
    products
        .insert_all(vec![
            json!({"key": "a", "number": 1, "refEntity": {"id": 1, "text": "x"}}),
            json!({"key": "b", "number": 1, "refEntity": {"id": 2, "text": "y"}}),
        ])
        .await
        .unwrap();

    let changed = products
        .update()
        .set("number", 9)
        .unwrap()
        .where_expr(ref_text.clone().equal_to("y"))
        .unwrap()
        .execute()
        .await
        .unwrap();
    assert_eq!(changed, 1);
    let row = products
        .query()
        .where_expr(number().equal_to(9))
        .unwrap()
        .select()
        .first()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row["key"], "b");

    let removed = products
        .delete()
        .where_expr(ref_text.equal_to("x"))
        .unwrap()
        .execute()
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert_eq!(provider.len("Product"), 1);
    assert_eq!(provider.len("RefEntity"), 2);
}

/// Entities without a key are rejected.
#[tokio::test]
async fn test_insert_without_key_fails() {
    let (_, repository) = setup();
    let products = repository.entities("Product").unwrap();
    let err = products.insert_or_update(json!({"number": 1})).await.unwrap_err();
    assert!(matches!(err, RepoError::Backend(_)));
}

/// Assignments are evaluated against the entity before the update.
#[tokio::test]
async fn test_update_assignments() {
    let (_, repository) = setup();
    seed(&repository).await;
    let products = repository.entities("Product").unwrap();

    let changed = products
        .update()
        .set("number", number() * 10)
        .unwrap()
        .set("text", text().concat("!"))
        .unwrap()
        .where_expr(number().less_than(4))
        .unwrap()
        .execute()
        .await
        .unwrap();
    assert_eq!(changed, 2);

    let rows = products
        .query()
        .order_by_asc("key")
        .unwrap()
        .select()
        .to_list()
        .await
        .unwrap();
    assert_eq!(rows[0], product("a", 30, "Entity1!"));
    assert_eq!(rows[1], product("b", 10, "Entity2!"));
    assert_eq!(rows[2], product("c", 7, "Other"));
}

/// List properties take additions and removals.
#[tokio::test]
async fn test_update_collections() {
    let (_, repository) = setup();
    let products = repository.entities("Product").unwrap();
    products
        .insert_or_update(json!({"key": "a", "tags": ["x", "y"]}))
        .await
        .unwrap();

    products
        .update()
        .add("tags", vec![json!("z")])
        .unwrap()
        .remove("tags", vec![json!("x")])
        .unwrap()
        .execute()
        .await
        .unwrap();

    let stored = products.query().select().first().await.unwrap().unwrap();
    assert_eq!(stored["tags"], json!(["y", "z"]));

    assert!(products.update().add("number", vec![json!(1)]).is_err());
}

/// Type-mismatched assignments and empty updates are rejected.
#[tokio::test]
async fn test_update_validation() {
    let (_, repository) = setup();
    let products = repository.entities("Product").unwrap();

    let err = products.update().set("number", "text").err().unwrap();
    assert!(err.is_validation());

    let err = products.update().execute().await.unwrap_err();
    assert!(err.is_validation());
}

/// Updates and deletes stop at their limit.
#[tokio::test]
async fn test_update_and_delete_limits() {
    let (provider, repository) = setup();
    seed(&repository).await;
    let products = repository.entities("Product").unwrap();

    let changed = products
        .update()
        .set("text", "limited")
        .unwrap()
        .limit(1)
        .execute()
        .await
        .unwrap();
    assert_eq!(changed, 1);

    let removed = products
        .delete()
        .where_expr(number().greater_than(2))
        .unwrap()
        .limit(2)
        .execute()
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(provider.len("Product"), 2);

    let removed = products.delete().execute().await.unwrap();
    assert_eq!(removed, 2);
    assert_eq!(provider.len("Product"), 0);
}

/// Delete honors object filters.
#[tokio::test]
async fn test_delete_with_filter() {
    let (_, repository) = setup();
    seed(&repository).await;
    let products = repository.entities("Product").unwrap();

    let filter: Filter = ObjectFilter::new()
        .property("number", ComparableFilter::new().between(3, 5))
        .into();
    let removed = products
        .delete()
        .where_filter(&filter)
        .unwrap()
        .execute()
        .await
        .unwrap();
    assert_eq!(removed, 2);

    let rows = products
        .query()
        .order_by_asc("key")
        .unwrap()
        .select()
        .to_list()
        .await
        .unwrap();
    assert_eq!(keys(&rows), vec!["b", "c"]);
}

// =============================================================================
// Read-Modify-Write Tests
// =============================================================================

/// The updater sees the current value and may create the entity.
#[tokio::test]
async fn test_update_with_creates_and_modifies() {
    let (_, repository) = setup();
    let products = repository.entities("Product").unwrap();

    let created = products
        .update_with(json!("n"), |current| {
            assert!(current.is_none());
            Some(json!({"number": 1}))
        })
        .await
        .unwrap();
    assert_eq!(created, Some(json!({"key": "n", "number": 1})));

    let bumped = products
        .update_with(json!("n"), |current| {
            let mut next = current?;
            let n = next["number"].as_i64().unwrap_or(0);
            next["number"] = json!(n + 1);
            Some(next)
        })
        .await
        .unwrap();
    assert_eq!(bumped, Some(json!({"key": "n", "number": 2})));
}

/// An unchanged result publishes no change.
#[tokio::test]
async fn test_update_with_unchanged_is_silent() {
    let (provider, repository) = setup();
    let products = repository.entities("Product").unwrap();
    products.insert_or_update(product("a", 1, "t")).await.unwrap();

    let info = products.query().select().info().clone();
    let mut feed = provider.live_query(&info).unwrap();

    let current = products.update_with(json!("a"), |current| current).await.unwrap();
    assert_eq!(current, Some(product("a", 1, "t")));
    assert!(feed.try_next().is_none());

    products
        .update_with(json!("a"), |_| Some(product("a", 2, "t")))
        .await
        .unwrap();
    let change = feed.try_next().unwrap().unwrap();
    assert_eq!(change.old_value, Some(product("a", 1, "t")));
    assert_eq!(change.new_value, Some(product("a", 2, "t")));
}

/// Backend conflicts are returned to the caller without retry.
#[tokio::test]
async fn test_concurrent_modification_surfaces() {
    let (provider, repository) = setup();
    let products = repository.entities("Product").unwrap();
    provider.reject_next_writes(1, RepoError::ConcurrentModification("version 2".into()));

    let err = products.insert_or_update(product("a", 1, "t")).await.unwrap_err();
    assert_eq!(err, RepoError::ConcurrentModification("version 2".into()));
    assert_eq!(provider.len("Product"), 0);

    products.insert_or_update(product("a", 1, "t")).await.unwrap();
    assert_eq!(provider.len("Product"), 1);
}
