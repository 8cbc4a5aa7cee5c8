//! Dotted-path edits on JSON entities

use serde_json::{Map, Value};

use crate::errors::{RepoError, RepoResult};
use crate::expression::values::values_equal;

/// Set the value at `path`, creating intermediate objects
pub(crate) fn set_path(entity: &mut Value, path: &str, value: Value) -> RepoResult<()> {
    let mut current = entity;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        let object = current
            .as_object_mut()
            .ok_or_else(|| RepoError::backend(format!("cannot set '{}': '{}' is not an object", path, segment)))?;
        if segments.peek().is_none() {
            object.insert(segment.to_string(), value);
            return Ok(());
        }
        current = object.entry(segment.to_string()).or_insert(Value::Null);
    }
    Ok(())
}

/// Value at `path`, `Null` when any segment is missing
pub(crate) fn get_path<'a>(entity: &'a Value, path: &str) -> &'a Value {
    let mut current = entity;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return &Value::Null,
        }
    }
    current
}

/// Append `add` and drop every element equal to one of `remove`
pub(crate) fn edit_list(entity: &mut Value, path: &str, add: &[Value], remove: &[Value]) -> RepoResult<()> {
    let mut items = match get_path(entity, path) {
        Value::Null => Vec::new(),
        Value::Array(items) => items.clone(),
        other => {
            return Err(RepoError::backend(format!(
                "cannot edit '{}': expected a list, found {}",
                path, other
            )))
        }
    };
    items.retain(|item| !remove.iter().any(|r| values_equal(item, r)));
    items.extend(add.iter().cloned());
    set_path(entity, path, Value::Array(items))
}
