//! Schema loader for entity descriptors stored on disk
//!
//! - One descriptor per `<EntityName>.json` file
//! - Non-JSON files are skipped
//! - Any malformed file aborts the whole load

use std::fs;
use std::path::{Path, PathBuf};

use super::errors::{SchemaError, SchemaResult};
use super::registry::SchemaRegistry;
use super::types::EntityDescriptor;

/// Reads descriptor files from a directory into a registry
pub struct SchemaLoader {
    schema_dir: PathBuf,
}

impl SchemaLoader {
    pub fn new(schema_dir: &Path) -> Self {
        Self {
            schema_dir: schema_dir.to_path_buf(),
        }
    }

    /// Returns the schema directory path.
    pub fn schema_dir(&self) -> &Path {
        &self.schema_dir
    }

    /// Loads every descriptor file into `registry`, in file name order.
    ///
    /// Returns the number of descriptors registered. A missing directory
    /// holds no descriptors.
    pub fn load_all(&self, registry: &SchemaRegistry) -> SchemaResult<usize> {
        if !self.schema_dir.exists() {
            return Ok(0);
        }

        let entries = fs::read_dir(&self.schema_dir).map_err(|e| {
            SchemaError::malformed_schema(
                self.schema_dir.display().to_string(),
                format!("Failed to read schema directory: {}", e),
            )
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                SchemaError::malformed_schema(
                    self.schema_dir.display().to_string(),
                    format!("Failed to read directory entry: {}", e),
                )
            })?;
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            paths.push(path);
        }
        paths.sort();

        for path in &paths {
            let descriptor = Self::load_descriptor_file(path)?;
            registry.register(descriptor)?;
        }

        Ok(paths.len())
    }

    /// Loads a single descriptor file.
    pub fn load_descriptor_file(path: &Path) -> SchemaResult<EntityDescriptor> {
        let content = fs::read_to_string(path).map_err(|e| {
            SchemaError::malformed_schema(
                path.display().to_string(),
                format!("Failed to read file: {}", e),
            )
        })?;

        let descriptor: EntityDescriptor = serde_json::from_str(&content).map_err(|e| {
            SchemaError::malformed_schema(path.display().to_string(), format!("Invalid JSON: {}", e))
        })?;

        descriptor
            .validate_structure()
            .map_err(|e| SchemaError::malformed_schema(path.display().to_string(), e))?;

        Ok(descriptor)
    }

    /// Saves a descriptor as `<name>.json`; existing files are never overwritten.
    pub fn save_descriptor(&self, descriptor: &EntityDescriptor) -> SchemaResult<PathBuf> {
        let path = self.schema_dir.join(format!("{}.json", descriptor.name));
        if path.exists() {
            return Err(SchemaError::duplicate_entity(&descriptor.name));
        }

        fs::create_dir_all(&self.schema_dir).map_err(|e| {
            SchemaError::malformed_schema(
                self.schema_dir.display().to_string(),
                format!("Failed to create schema directory: {}", e),
            )
        })?;

        let content = serde_json::to_string_pretty(descriptor).map_err(|e| {
            SchemaError::malformed_schema(
                path.display().to_string(),
                format!("Failed to serialize descriptor: {}", e),
            )
        })?;

        fs::write(&path, content).map_err(|e| {
            SchemaError::malformed_schema(
                path.display().to_string(),
                format!("Failed to write file: {}", e),
            )
        })?;

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::ValueType;
    use crate::schema::errors::SchemaErrorCode;
    use crate::schema::types::PropertyDescriptor;
    use tempfile::TempDir;

    fn vendor() -> EntityDescriptor {
        EntityDescriptor::new("Vendor", "id", ValueType::Integer)
            .with_property(PropertyDescriptor::new("name", ValueType::String).searchable())
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let loader = SchemaLoader::new(dir.path());
        loader.save_descriptor(&vendor()).unwrap();

        let registry = SchemaRegistry::new();
        assert_eq!(loader.load_all(&registry).unwrap(), 1);
        assert_eq!(*registry.require("Vendor").unwrap(), vendor());
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let loader = SchemaLoader::new(&dir.path().join("absent"));
        assert_eq!(loader.load_all(&SchemaRegistry::new()).unwrap(), 0);
    }

    #[test]
    fn test_malformed_file_fails_load() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("Broken.json"), "{not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let err = SchemaLoader::new(dir.path())
            .load_all(&SchemaRegistry::new())
            .unwrap_err();
        assert_eq!(err.code(), SchemaErrorCode::AeroRepoMalformedSchema);
    }

    #[test]
    fn test_save_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let loader = SchemaLoader::new(dir.path());
        loader.save_descriptor(&vendor()).unwrap();
        assert!(loader.save_descriptor(&vendor()).is_err());
    }
}
