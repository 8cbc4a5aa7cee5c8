//! # Query Descriptions
//!
//! Immutable, serializable descriptions of reads, updates and deletes. The
//! canonical JSON form of a `QueryInfo` doubles as its statement key:
//! structurally equal queries share one live statement.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{RepoError, RepoResult};
use crate::expression::{Expression, ValueType};

/// One sort key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortingInfo {
    pub expression: Expression,
    pub ascending: bool,
}

impl SortingInfo {
    pub fn new(expression: Expression, ascending: bool) -> Self {
        Self {
            expression,
            ascending,
        }
    }
}

/// Read query over one entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryInfo {
    pub entity_type: String,
    pub key_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<Expression>,
    /// Selector applied to each result; `None` returns the entity itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<Expression>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sorting: Vec<SortingInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
    #[serde(default)]
    pub distinct: bool,
    /// Extra property chains the backend must fetch
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<Expression>,
}

impl QueryInfo {
    /// Query for every instance of a type
    pub fn new(entity_type: impl Into<String>, key_type: ValueType) -> Self {
        Self {
            entity_type: entity_type.into(),
            key_type,
            predicate: None,
            projection: None,
            sorting: Vec::new(),
            limit: None,
            skip: None,
            distinct: false,
            properties: Vec::new(),
        }
    }

    pub fn with_predicate(mut self, predicate: Option<Expression>) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_projection(mut self, projection: Option<Expression>) -> Self {
        self.projection = projection;
        self
    }

    pub fn with_sorting(mut self, sorting: Vec<SortingInfo>) -> Self {
        self.sorting = sorting;
        self
    }

    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_skip(mut self, skip: Option<u64>) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_distinct(mut self, distinct: bool) -> Self {
        self.distinct = distinct;
        self
    }

    /// Add extra property chains, keeping the list free of duplicates
    pub fn with_properties(mut self, properties: impl IntoIterator<Item = Expression>) -> Self {
        for property in properties {
            if !self.properties.contains(&property) {
                self.properties.push(property);
            }
        }
        self
    }

    /// Same query returning whole entities
    pub fn unmapped(&self) -> Self {
        Self {
            projection: None,
            distinct: false,
            ..self.clone()
        }
    }

    /// Same query without ordering or paging
    pub fn unpaged(&self) -> Self {
        Self {
            sorting: Vec::new(),
            limit: None,
            skip: None,
            ..self.clone()
        }
    }

    /// Property chains the projection reads
    pub fn projection_properties(&self) -> Vec<Expression> {
        self.projection
            .as_ref()
            .map(Expression::referenced_properties)
            .unwrap_or_default()
    }

    /// Canonical key for sharing live statements
    pub fn statement_key(&self) -> RepoResult<StatementKey> {
        serde_json::to_string(self)
            .map(StatementKey)
            .map_err(|e| RepoError::internal(format!("statement key: {}", e)))
    }
}

/// Canonical identity of a query
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatementKey(String);

impl StatementKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StatementKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Assignment of one property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyUpdate {
    /// Dotted property path
    pub path: String,
    /// Evaluated against the entity before the update
    pub value: Expression,
}

/// Collection edit of one list property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionUpdate {
    /// Dotted property path of the list
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<Value>,
}

/// Set-based update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<Expression>,
    #[serde(default)]
    pub assignments: Vec<PropertyUpdate>,
    #[serde(default)]
    pub collections: Vec<CollectionUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

/// Set-based delete
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteInfo {
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<Expression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}
