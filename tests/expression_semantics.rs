//! Expression Semantics Tests
//!
//! End-to-end checks of compiled expressions over JSON instances:
//! - Absent operands follow the fixed null table
//! - Composition is structural and evaluates like manual chaining
//! - Property paths resolve to the same tree as chained properties
//! - Filters translate to the predicates they describe

use aerorepo::expression::{
    compile, compile_comparator, compile_predicate, compose, resolve_path, Expression, ValueType,
};
use aerorepo::filter::{ComparableFilter, Filter, ObjectFilter, StringFilter};
use aerorepo::filter::to_expression;
use aerorepo::schema::{EntityDescriptor, PropertyDescriptor, SchemaRegistry};
use serde_json::{json, Value};

// =============================================================================
// Helper Functions
// =============================================================================

fn registry() -> SchemaRegistry {
    let registry = SchemaRegistry::new();
    registry
        .register(
            EntityDescriptor::new("RefEntity", "id", ValueType::Integer)
                .with_property(PropertyDescriptor::new("text", ValueType::String).filterable()),
        )
        .unwrap();
    registry
        .register(
            EntityDescriptor::new("Entity", "key", ValueType::String)
                .with_property(PropertyDescriptor::new("number", ValueType::Integer).filterable())
                .with_property(
                    PropertyDescriptor::new("text", ValueType::String)
                        .filterable()
                        .searchable(),
                )
                .with_property(
                    PropertyDescriptor::new("refEntity", ValueType::entity("RefEntity")).filterable(),
                ),
        )
        .unwrap();
    registry
}

fn entity() -> Expression {
    Expression::entity("Entity")
}

fn number() -> Expression {
    entity().property("number", ValueType::Integer)
}

fn text() -> Expression {
    entity().property("text", ValueType::String)
}

fn ref_entity() -> Expression {
    entity().property("refEntity", ValueType::entity("RefEntity"))
}

fn int_null() -> Expression {
    Expression::null(ValueType::Integer)
}

fn str_null() -> Expression {
    Expression::null(ValueType::String)
}

/// Evaluate a closed expression
fn eval(expr: Expression) -> Value {
    compile(&expr).unwrap().evaluate(&json!({})).unwrap()
}

// =============================================================================
// Null Propagation Tests
// =============================================================================

/// Arithmetic with one absent operand follows the fixed table.
#[test]
fn test_arithmetic_with_one_null_operand() {
    assert_eq!(eval(int_null() + 3), json!(3));
    assert_eq!(eval(Expression::constant(3) + int_null()), json!(3));
    assert_eq!(eval(int_null() - 3), json!(-3));
    assert_eq!(eval(Expression::constant(3) - int_null()), json!(3));
    assert_eq!(eval(int_null() * 3), json!(0));
    assert_eq!(eval(int_null() / 3), json!(0));
    assert_eq!(eval(Expression::constant(3) / int_null()), json!(3));
}

/// Arithmetic with both operands absent yields zero.
#[test]
fn test_arithmetic_with_both_null() {
    assert_eq!(eval(int_null() + int_null()), json!(0));
    assert_eq!(eval(int_null() - int_null()), json!(0));
    assert_eq!(eval(int_null() * int_null()), json!(0));
    assert_eq!(eval(int_null() / int_null()), json!(0));
}

/// Negation propagates the absent value.
#[test]
fn test_negate_null_propagates() {
    assert_eq!(eval(-int_null()), Value::Null);
}

/// Equality treats two absent values as equal; ordering never holds.
#[test]
fn test_comparisons_with_null() {
    assert_eq!(eval(int_null().equal_to(int_null())), json!(true));
    assert_eq!(eval(int_null().equal_to(1)), json!(false));
    assert_eq!(eval(int_null().greater_than(int_null())), json!(false));
    assert_eq!(eval(int_null().greater_than(1)), json!(false));
    assert_eq!(eval(Expression::constant(1).less_than(int_null())), json!(false));
    assert_eq!(eval(int_null().less_than(int_null())), json!(false));
}

/// String operators on absent operands.
#[test]
fn test_string_ops_with_null() {
    assert_eq!(eval(str_null().is_empty()), json!(true));
    assert_eq!(eval(str_null().length()), json!(0));
    assert_eq!(eval(str_null().contains("A")), json!(false));
    assert_eq!(eval(Expression::constant("X").contains(str_null())), json!(true));
    assert_eq!(eval(Expression::constant("X").starts_with(str_null())), json!(true));
    assert_eq!(eval(Expression::constant("X").ends_with(str_null())), json!(true));
    assert_eq!(eval(str_null().concat("X")), json!("X"));
    assert_eq!(eval(Expression::constant("X").concat(str_null())), json!("X"));
    assert_eq!(eval(str_null().concat(str_null())), json!(""));
    assert_eq!(eval(str_null().to_lower()), Value::Null);
    assert_eq!(eval(str_null().trim()), Value::Null);
    assert_eq!(eval(int_null().as_string()), Value::Null);
}

/// `matches` is false for an absent pattern while `contains` is true.
#[test]
fn test_matches_null_asymmetry() {
    assert_eq!(eval(str_null().matches("^A")), json!(false));
    assert_eq!(eval(Expression::constant("X").matches(str_null())), json!(false));
    assert_eq!(eval(Expression::constant("X").contains(str_null())), json!(true));
}

/// Membership in an absent collection is false.
#[test]
fn test_in_null_collection() {
    let tags = Expression::null(ValueType::list(ValueType::Integer));
    assert_eq!(eval(Expression::constant(1).is_in(tags)), json!(false));
    assert_eq!(eval(int_null().is_null()), json!(true));
    assert_eq!(eval(int_null().is_not_null()), json!(false));
}

/// Property access, string length and arithmetic over one instance.
#[test]
fn test_mixed_arithmetic_over_instance() {
    let ref_id = ref_entity().property("id", ValueType::Integer);
    let expr = ((number() + text().length() + ref_id) * 100) / 5;
    let instance = json!({"number": 3, "text": "Entity1", "refEntity": {"id": 10}});

    assert_eq!(compile(&expr).unwrap().evaluate(&instance).unwrap(), json!(400));
}

// =============================================================================
// Composition and Path Tests
// =============================================================================

/// Composing over a reference equals the manually chained tree.
#[test]
fn test_compose_equals_manual_chain() {
    let inner = Expression::entity("RefEntity")
        .property("text", ValueType::String)
        .equal_to("");
    let composed = compose(&ref_entity(), &inner).unwrap();
    let manual = ref_entity().property("text", ValueType::String).equal_to("");
    assert_eq!(composed, manual);

    let composed = compile_predicate(&composed).unwrap();
    let manual = compile_predicate(&manual).unwrap();
    for instance in [
        json!({"refEntity": {"text": ""}}),
        json!({"refEntity": {"text": "x"}}),
        json!({"refEntity": null}),
        json!({}),
    ] {
        assert_eq!(composed.test(&instance).unwrap(), manual.test(&instance).unwrap());
    }
}

/// A dotted path resolves to the chained property tree.
#[test]
fn test_path_resolution_matches_chaining() {
    let registry = registry();
    let resolved = resolve_path(&registry, &entity(), "refEntity.id").unwrap();
    assert_eq!(resolved, ref_entity().property("id", ValueType::Integer));

    assert!(resolve_path(&registry, &entity(), "refEntity.missing").is_err());
}

/// Sorting by text ignores the other fields.
#[test]
fn test_comparator_orders_by_text() {
    let comparator = compile_comparator([(&text(), true)]).unwrap();
    let mut items = vec![json!({"text": "b", "number": 1}), json!({"text": "a", "number": 2})];
    comparator.sort(&mut items).unwrap();
    assert_eq!(items[0]["text"], "a");
    assert_eq!(items[1]["text"], "b");
}

/// Absent sort keys come first ascending and last descending.
#[test]
fn test_comparator_null_ordering() {
    let mut items = vec![json!({"number": 2}), json!({}), json!({"number": 1})];
    compile_comparator([(&number(), true)]).unwrap().sort(&mut items).unwrap();
    assert_eq!(items, vec![json!({}), json!({"number": 1}), json!({"number": 2})]);

    compile_comparator([(&number(), false)]).unwrap().sort(&mut items).unwrap();
    assert_eq!(items, vec![json!({"number": 2}), json!({"number": 1}), json!({})]);
}

// =============================================================================
// Filter Translation Tests
// =============================================================================

/// A single set field translates to exactly that comparison.
#[test]
fn test_filter_with_one_field() {
    let registry = registry();
    let filter: Filter = ObjectFilter::new()
        .property("number", ComparableFilter::new().less_than(5))
        .into();
    let predicate = to_expression(&registry, &filter, &entity()).unwrap().unwrap();

    let compiled = compile_predicate(&predicate).unwrap();
    let direct = compile_predicate(&number().less_than(5)).unwrap();
    for instance in [json!({"number": 4}), json!({"number": 5}), json!({"text": "a"})] {
        assert_eq!(compiled.test(&instance).unwrap(), direct.test(&instance).unwrap());
    }
}

/// A filter without set fields produces no predicate.
#[test]
fn test_empty_filter_is_absent() {
    let registry = registry();
    let filter: Filter = ObjectFilter::new()
        .property("number", ComparableFilter::new())
        .into();
    assert!(to_expression(&registry, &filter, &entity()).unwrap().is_none());
}

/// Nested filters reach through references.
#[test]
fn test_nested_reference_filter() {
    let registry = registry();
    let filter: Filter = ObjectFilter::new()
        .property(
            "refEntity",
            ObjectFilter::new().property("text", StringFilter::new().starts_with("Ent")),
        )
        .into();
    let predicate = to_expression(&registry, &filter, &entity()).unwrap().unwrap();
    let compiled = compile_predicate(&predicate).unwrap();

    assert!(compiled.test(&json!({"refEntity": {"text": "Entity1"}})).unwrap());
    assert!(!compiled.test(&json!({"refEntity": {"text": "other"}})).unwrap());
    assert!(!compiled.test(&json!({})).unwrap());
}
