//! Schema error types
//!
//! Schema errors are raised while descriptors are loaded or registered.
//! Every error carries a stable code.

use std::fmt;

use crate::errors::RepoError;

/// Error codes for schema operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorCode {
    /// Entity type not registered
    AeroRepoUnknownEntity,
    /// Entity type registered twice
    AeroRepoDuplicateEntity,
    /// Descriptor is internally inconsistent
    AeroRepoInvalidDescriptor,
    /// Descriptor file cannot be read or parsed
    AeroRepoMalformedSchema,
}

impl SchemaErrorCode {
    /// Returns the string code
    pub fn code(&self) -> &'static str {
        match self {
            SchemaErrorCode::AeroRepoUnknownEntity => "AERO_REPO_UNKNOWN_ENTITY",
            SchemaErrorCode::AeroRepoDuplicateEntity => "AERO_REPO_DUPLICATE_ENTITY",
            SchemaErrorCode::AeroRepoInvalidDescriptor => "AERO_REPO_INVALID_DESCRIPTOR",
            SchemaErrorCode::AeroRepoMalformedSchema => "AERO_REPO_MALFORMED_SCHEMA",
        }
    }
}

impl fmt::Display for SchemaErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Result type for schema operations
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Schema error with context
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaError {
    code: SchemaErrorCode,
    message: String,
    entity: Option<String>,
}

impl SchemaError {
    /// Create an unknown entity error
    pub fn unknown_entity(entity: impl Into<String>) -> Self {
        let entity = entity.into();
        Self {
            code: SchemaErrorCode::AeroRepoUnknownEntity,
            message: format!("Entity type '{}' is not registered", entity),
            entity: Some(entity),
        }
    }

    /// Create a duplicate registration error
    pub fn duplicate_entity(entity: impl Into<String>) -> Self {
        let entity = entity.into();
        Self {
            code: SchemaErrorCode::AeroRepoDuplicateEntity,
            message: format!("Entity type '{}' is already registered", entity),
            entity: Some(entity),
        }
    }

    /// Create an invalid descriptor error
    pub fn invalid_descriptor(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        let entity = entity.into();
        Self {
            code: SchemaErrorCode::AeroRepoInvalidDescriptor,
            message: format!("Invalid descriptor for '{}': {}", entity, reason.into()),
            entity: Some(entity),
        }
    }

    /// Create an error for a malformed descriptor file
    pub fn malformed_schema(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            code: SchemaErrorCode::AeroRepoMalformedSchema,
            message: format!("Malformed schema file '{}': {}", path.into(), reason.into()),
            entity: None,
        }
    }

    /// Returns the error code
    pub fn code(&self) -> SchemaErrorCode {
        self.code
    }

    /// Returns the message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the entity type involved, if any
    pub fn entity(&self) -> Option<&str> {
        self.entity.as_deref()
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.code(), self.message)
    }
}

impl std::error::Error for SchemaError {}

impl From<SchemaError> for RepoError {
    fn from(e: SchemaError) -> Self {
        match (e.code, e.entity) {
            (SchemaErrorCode::AeroRepoUnknownEntity, Some(entity)) => {
                RepoError::UnknownEntity(entity)
            }
            _ => RepoError::Config(e.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_code() {
        let err = SchemaError::unknown_entity("Vendor");
        assert!(err.to_string().contains("AERO_REPO_UNKNOWN_ENTITY"));
        assert_eq!(err.entity(), Some("Vendor"));
    }

    #[test]
    fn test_unknown_entity_maps_to_repo_error() {
        let err: RepoError = SchemaError::unknown_entity("Vendor").into();
        assert_eq!(err, RepoError::UnknownEntity("Vendor".into()));
    }

    #[test]
    fn test_malformed_maps_to_config_error() {
        let err: RepoError = SchemaError::malformed_schema("a.json", "bad").into();
        assert!(matches!(err, RepoError::Config(_)));
    }
}
