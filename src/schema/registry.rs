//! Schema registry
//!
//! Process-wide lookup of entity descriptors. Registration is validated and
//! immutable: a type registered once cannot be redefined.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::errors::{SchemaError, SchemaResult};
use super::types::EntityDescriptor;

/// Registry of entity descriptors
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    entities: RwLock<HashMap<String, Arc<EntityDescriptor>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor
    pub fn register(&self, descriptor: EntityDescriptor) -> SchemaResult<Arc<EntityDescriptor>> {
        descriptor
            .validate_structure()
            .map_err(|e| SchemaError::invalid_descriptor(&descriptor.name, e))?;

        let mut entities = self.entities.write();
        if entities.contains_key(&descriptor.name) {
            return Err(SchemaError::duplicate_entity(&descriptor.name));
        }
        let descriptor = Arc::new(descriptor);
        entities.insert(descriptor.name.clone(), Arc::clone(&descriptor));
        Ok(descriptor)
    }

    /// Register several descriptors
    pub fn with(self, descriptors: impl IntoIterator<Item = EntityDescriptor>) -> SchemaResult<Self> {
        for descriptor in descriptors {
            self.register(descriptor)?;
        }
        Ok(self)
    }

    /// Look up a descriptor
    pub fn get(&self, name: &str) -> Option<Arc<EntityDescriptor>> {
        self.entities.read().get(name).cloned()
    }

    /// Look up a descriptor, failing for unknown types
    pub fn require(&self, name: &str) -> SchemaResult<Arc<EntityDescriptor>> {
        self.get(name).ok_or_else(|| SchemaError::unknown_entity(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.read().contains_key(name)
    }

    /// Registered type names, sorted
    pub fn entity_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.entities.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }
}
