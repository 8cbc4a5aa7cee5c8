//! Entity descriptors
//!
//! A descriptor names an entity type, its key property and its typed
//! properties. Property capabilities drive filter translation and free-text
//! search.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::expression::{Expression, ValueType};

/// Per-property capability flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// May appear in an object filter
    #[serde(default)]
    pub filterable: bool,
    /// The backend keeps an index on this property
    #[serde(default)]
    pub indexable: bool,
    /// Participates in free-text search
    #[serde(default)]
    pub searchable: bool,
}

/// Typed property of an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub value_type: ValueType,
    #[serde(flatten)]
    pub capabilities: Capabilities,
}

impl PropertyDescriptor {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            capabilities: Capabilities::default(),
        }
    }

    pub fn filterable(mut self) -> Self {
        self.capabilities.filterable = true;
        self
    }

    pub fn indexable(mut self) -> Self {
        self.capabilities.indexable = true;
        self
    }

    pub fn searchable(mut self) -> Self {
        self.capabilities.searchable = true;
        self
    }
}

/// Entity type descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    /// Entity type name
    pub name: String,
    /// Name of the key property
    pub key_property: String,
    /// Declared properties, in declaration order
    #[serde(default)]
    pub properties: Vec<PropertyDescriptor>,
}

impl EntityDescriptor {
    /// Create a descriptor; the key property is added with `key_type`
    pub fn new(name: impl Into<String>, key_property: impl Into<String>, key_type: ValueType) -> Self {
        let key_property = key_property.into();
        Self {
            name: name.into(),
            properties: vec![PropertyDescriptor::new(key_property.clone(), key_type).filterable()],
            key_property,
        }
    }

    /// Add a property
    pub fn with_property(mut self, property: PropertyDescriptor) -> Self {
        self.properties.retain(|p| p.name != property.name);
        self.properties.push(property);
        self
    }

    /// Look up a property by name
    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Type of the key property
    pub fn key_type(&self) -> ValueType {
        self.property(&self.key_property)
            .map(|p| p.value_type.clone())
            .unwrap_or(ValueType::Any)
    }

    /// Static type of instances of this entity
    pub fn value_type(&self) -> ValueType {
        ValueType::entity(&self.name)
    }

    /// Argument expression over this entity type
    pub fn argument(&self) -> Expression {
        Expression::argument(self.value_type())
    }

    /// Properties flagged searchable
    pub fn searchable_properties(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.properties.iter().filter(|p| p.capabilities.searchable)
    }

    /// Key value of an instance, if present
    pub fn key_of<'a>(&self, entity: &'a Value) -> Option<&'a Value> {
        entity.get(&self.key_property).filter(|k| !k.is_null())
    }

    /// Canonical string form of an instance's key
    pub fn key_string(&self, entity: &Value) -> Option<String> {
        self.key_of(entity).map(canonical_key)
    }

    /// Validates the descriptor itself
    pub fn validate_structure(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("entity name must not be empty".into());
        }
        let key = self
            .property(&self.key_property)
            .ok_or_else(|| format!("key property '{}' is not declared", self.key_property))?;
        if !key.value_type.is_comparable() {
            return Err(format!(
                "key property '{}' must be a scalar, found {}",
                self.key_property, key.value_type
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for property in &self.properties {
            if !seen.insert(property.name.as_str()) {
                return Err(format!("property '{}' declared twice", property.name));
            }
        }
        Ok(())
    }
}

/// Canonical string form of a key value; strings are used verbatim
pub fn canonical_key(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
