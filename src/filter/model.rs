//! # Filter Model
//!
//! Declarative, serializable filters. Every field is optional; an unset
//! field contributes nothing to the translated predicate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inclusive or exclusive bounds for range filters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: Value,
    pub max: Value,
}

impl Range {
    pub fn new(min: impl Into<Value>, max: impl Into<Value>) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
        }
    }
}

/// Filter over an ordered scalar
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ComparableFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eq: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_eq: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gt: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lt: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gte: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lte: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub between: Option<Range>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub between_exclusive: Option<Range>,
    /// Value is one of the listed values
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eq_any: Option<Vec<Value>>,
    /// `Some(true)` requires absence, `Some(false)` requires presence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_null: Option<bool>,
}

impl ComparableFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equal_to(mut self, value: impl Into<Value>) -> Self {
        self.eq = Some(value.into());
        self
    }

    pub fn not_equal_to(mut self, value: impl Into<Value>) -> Self {
        self.not_eq = Some(value.into());
        self
    }

    pub fn greater_than(mut self, value: impl Into<Value>) -> Self {
        self.gt = Some(value.into());
        self
    }

    pub fn less_than(mut self, value: impl Into<Value>) -> Self {
        self.lt = Some(value.into());
        self
    }

    pub fn greater_or_equal(mut self, value: impl Into<Value>) -> Self {
        self.gte = Some(value.into());
        self
    }

    pub fn less_or_equal(mut self, value: impl Into<Value>) -> Self {
        self.lte = Some(value.into());
        self
    }

    pub fn between(mut self, min: impl Into<Value>, max: impl Into<Value>) -> Self {
        self.between = Some(Range::new(min, max));
        self
    }

    pub fn between_exclusive(mut self, min: impl Into<Value>, max: impl Into<Value>) -> Self {
        self.between_exclusive = Some(Range::new(min, max));
        self
    }

    pub fn equal_to_any(mut self, values: Vec<Value>) -> Self {
        self.eq_any = Some(values);
        self
    }

    pub fn null(mut self, is_null: bool) -> Self {
        self.is_null = Some(is_null);
        self
    }
}

/// Filter over a string
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StringFilter {
    #[serde(flatten)]
    pub comparable: ComparableFilter,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starts_with: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ends_with: Option<String>,
    /// Unanchored regular expression
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matches: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_empty: Option<bool>,
}

impl StringFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equal_to(mut self, value: impl Into<String>) -> Self {
        self.comparable.eq = Some(Value::String(value.into()));
        self
    }

    pub fn not_equal_to(mut self, value: impl Into<String>) -> Self {
        self.comparable.not_eq = Some(Value::String(value.into()));
        self
    }

    pub fn contains(mut self, value: impl Into<String>) -> Self {
        self.contains = Some(value.into());
        self
    }

    pub fn starts_with(mut self, value: impl Into<String>) -> Self {
        self.starts_with = Some(value.into());
        self
    }

    pub fn ends_with(mut self, value: impl Into<String>) -> Self {
        self.ends_with = Some(value.into());
        self
    }

    pub fn matches(mut self, pattern: impl Into<String>) -> Self {
        self.matches = Some(pattern.into());
        self
    }

    pub fn empty(mut self, is_empty: bool) -> Self {
        self.is_empty = Some(is_empty);
        self
    }

    pub fn null(mut self, is_null: bool) -> Self {
        self.comparable.is_null = Some(is_null);
        self
    }
}

/// Filter over a boolean
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BooleanFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eq: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_eq: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_null: Option<bool>,
}

impl BooleanFilter {
    pub fn is(value: bool) -> Self {
        Self {
            eq: Some(value),
            ..Self::default()
        }
    }

    pub fn is_not(value: bool) -> Self {
        Self {
            not_eq: Some(value),
            ..Self::default()
        }
    }
}

/// Filter over an entity: nested per-property filters plus whole-value tests
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ObjectFilter {
    /// Per-property filters, applied in property name order
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Filter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equals_to: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_equals_to: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equals_to_any: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_null: Option<bool>,
    /// Free-text search over the searchable properties
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_text: Option<String>,
}

impl ObjectFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a nested filter for one property
    pub fn property(mut self, name: impl Into<String>, filter: impl Into<Filter>) -> Self {
        self.properties.insert(name.into(), filter.into());
        self
    }

    pub fn equals_to(mut self, value: Value) -> Self {
        self.equals_to = Some(value);
        self
    }

    pub fn not_equals_to(mut self, value: Value) -> Self {
        self.not_equals_to = Some(value);
        self
    }

    pub fn equals_to_any(mut self, values: Vec<Value>) -> Self {
        self.equals_to_any = Some(values);
        self
    }

    pub fn null(mut self, is_null: bool) -> Self {
        self.is_null = Some(is_null);
        self
    }

    pub fn search_text(mut self, text: impl Into<String>) -> Self {
        self.search_text = Some(text.into());
        self
    }
}

/// Filter over any property domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Filter {
    Comparable(ComparableFilter),
    String(StringFilter),
    Boolean(BooleanFilter),
    Object(ObjectFilter),
}

impl From<ComparableFilter> for Filter {
    fn from(f: ComparableFilter) -> Self {
        Filter::Comparable(f)
    }
}

impl From<StringFilter> for Filter {
    fn from(f: StringFilter) -> Self {
        Filter::String(f)
    }
}

impl From<BooleanFilter> for Filter {
    fn from(f: BooleanFilter) -> Self {
        Filter::Boolean(f)
    }
}

impl From<ObjectFilter> for Filter {
    fn from(f: ObjectFilter) -> Self {
        Filter::Object(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_json_shape() {
        let filter: Filter = ObjectFilter::new()
            .property("number", ComparableFilter::new().less_than(5))
            .property("text", StringFilter::new().starts_with("Ent"))
            .into();

        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(
            json,
            json!({
                "kind": "object",
                "properties": {
                    "number": {"kind": "comparable", "lt": 5},
                    "text": {"kind": "string", "startsWith": "Ent"}
                }
            })
        );

        let back: Filter = serde_json::from_value(json).unwrap();
        assert_eq!(back, filter);
    }

    #[test]
    fn test_empty_filter_deserializes() {
        let filter: Filter = serde_json::from_value(json!({"kind": "comparable"})).unwrap();
        assert_eq!(filter, Filter::Comparable(ComparableFilter::default()));
    }

    #[test]
    fn test_between_range() {
        let filter = ComparableFilter::new().between(1, 3);
        assert_eq!(filter.between, Some(Range::new(1, 3)));
    }
}
