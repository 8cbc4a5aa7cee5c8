//! Property path resolution
//!
//! Dotted paths like `vendor.name` resolve segment by segment against the
//! schema registry, starting from an entity-typed root expression.

use crate::schema::SchemaRegistry;

use super::ast::{Expression, ValueType};
use super::errors::{ExpressionError, ExpressionResult};

/// Resolve a dotted property path against `root`
pub fn resolve_path(
    registry: &SchemaRegistry,
    root: &Expression,
    path: &str,
) -> ExpressionResult<Expression> {
    let mut current = root.clone();
    let mut current_type = root.value_type();

    for segment in path.split('.') {
        let entity = match &current_type {
            ValueType::Entity { entity } => entity.clone(),
            other => {
                return Err(ExpressionError::PathResolution {
                    entity: other.to_string(),
                    path: path.to_string(),
                    segment: segment.to_string(),
                })
            }
        };
        let descriptor = registry
            .get(&entity)
            .ok_or_else(|| ExpressionError::UnknownEntity(entity.clone()))?;
        let property = descriptor
            .property(segment)
            .ok_or_else(|| ExpressionError::PathResolution {
                entity: entity.clone(),
                path: path.to_string(),
                segment: segment.to_string(),
            })?;

        current_type = property.value_type.clone();
        current = current.property(segment, current_type.clone());
    }

    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntityDescriptor, PropertyDescriptor};

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new()
            .with([
                EntityDescriptor::new("Vendor", "id", ValueType::Integer)
                    .with_property(PropertyDescriptor::new("name", ValueType::String)),
                EntityDescriptor::new("Product", "key", ValueType::String).with_property(
                    PropertyDescriptor::new("vendor", ValueType::entity("Vendor")),
                ),
            ])
            .unwrap()
    }

    #[test]
    fn test_resolve_nested_path() {
        let registry = registry();
        let expr = resolve_path(&registry, &Expression::entity("Product"), "vendor.name").unwrap();
        assert_eq!(expr.value_type(), ValueType::String);
        assert_eq!(expr.property_path().as_deref(), Some("vendor.name"));
    }

    #[test]
    fn test_unknown_segment() {
        let registry = registry();
        let err = resolve_path(&registry, &Expression::entity("Product"), "vendor.missing")
            .unwrap_err();
        assert_eq!(
            err,
            ExpressionError::PathResolution {
                entity: "Vendor".into(),
                path: "vendor.missing".into(),
                segment: "missing".into(),
            }
        );
    }

    #[test]
    fn test_path_through_scalar_fails() {
        let registry = registry();
        let err = resolve_path(&registry, &Expression::entity("Product"), "key.length")
            .unwrap_err();
        assert!(err.is_validation());
    }
}
