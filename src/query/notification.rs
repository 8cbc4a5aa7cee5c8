//! # Change Notifications
//!
//! A notification carries the value before and after a change. Its kind is
//! derived from which sides are present, so a notification can never claim
//! to be a create while carrying an old value.
//!
//! A notification with neither side is the empty marker that separates the
//! initial snapshot from live changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::expression::{CompiledExpression, ExpressionResult};

/// Kind of change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationKind {
    /// The value entered the observed set
    Create,
    /// The value changed and stayed in the observed set
    Modify,
    /// The value left the observed set
    Delete,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationKind::Create => write!(f, "CREATE"),
            NotificationKind::Modify => write!(f, "MODIFY"),
            NotificationKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// Change notification.
///
/// Equality compares the values and the sequence; the timestamp is
/// informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Value before the change (for MODIFY/DELETE)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,

    /// Value after the change (for CREATE/MODIFY)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,

    /// Monotonically increasing within one stream
    pub sequence: u64,

    /// When the notification was produced
    pub timestamp: DateTime<Utc>,
}

impl PartialEq for Notification {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
            && self.old_value == other.old_value
            && self.new_value == other.new_value
    }
}

impl Notification {
    /// Create a CREATE notification
    pub fn create(new_value: Value, sequence: u64) -> Self {
        Self::of(None, Some(new_value), sequence)
    }

    /// Create a MODIFY notification
    pub fn modify(old_value: Value, new_value: Value, sequence: u64) -> Self {
        Self::of(Some(old_value), Some(new_value), sequence)
    }

    /// Create a DELETE notification
    pub fn delete(old_value: Value, sequence: u64) -> Self {
        Self::of(Some(old_value), None, sequence)
    }

    /// Create the empty marker
    pub fn empty(sequence: u64) -> Self {
        Self::of(None, None, sequence)
    }

    /// Notification from raw before/after values
    pub fn of(old_value: Option<Value>, new_value: Option<Value>, sequence: u64) -> Self {
        Self {
            old_value,
            new_value,
            sequence,
            timestamp: Utc::now(),
        }
    }

    /// Kind derived from the present sides; `None` for the empty marker
    pub fn kind(&self) -> Option<NotificationKind> {
        match (&self.old_value, &self.new_value) {
            (None, Some(_)) => Some(NotificationKind::Create),
            (Some(_), Some(_)) => Some(NotificationKind::Modify),
            (Some(_), None) => Some(NotificationKind::Delete),
            (None, None) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kind().is_none()
    }

    pub fn is_create(&self) -> bool {
        self.kind() == Some(NotificationKind::Create)
    }

    pub fn is_delete(&self) -> bool {
        self.kind() == Some(NotificationKind::Delete)
    }

    /// The most recent value: new if present, otherwise old
    pub fn value(&self) -> Option<&Value> {
        self.new_value.as_ref().or(self.old_value.as_ref())
    }

    /// Same change under another sequence number
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Apply a projection to both sides
    pub fn project(self, projection: &CompiledExpression) -> ExpressionResult<Self> {
        let old_value = self
            .old_value
            .map(|v| projection.evaluate(&v))
            .transpose()?;
        let new_value = self
            .new_value
            .map(|v| projection.evaluate(&v))
            .transpose()?;
        Ok(Self {
            old_value,
            new_value,
            ..self
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{compile, Expression, ValueType};
    use serde_json::json;

    #[test]
    fn test_kind_follows_presence() {
        assert_eq!(
            Notification::create(json!({"k": 1}), 1).kind(),
            Some(NotificationKind::Create)
        );
        assert_eq!(
            Notification::modify(json!(1), json!(2), 2).kind(),
            Some(NotificationKind::Modify)
        );
        assert_eq!(
            Notification::delete(json!(1), 3).kind(),
            Some(NotificationKind::Delete)
        );
        assert!(Notification::empty(4).is_empty());
    }

    #[test]
    fn test_projection_applies_to_both_sides() {
        let number = compile(&Expression::entity("Product").property("number", ValueType::Integer))
            .unwrap();
        let projected = Notification::modify(json!({"number": 1}), json!({"number": 2}), 7)
            .project(&number)
            .unwrap();
        assert_eq!(projected.old_value, Some(json!(1)));
        assert_eq!(projected.new_value, Some(json!(2)));
        assert_eq!(projected.sequence, 7);
    }

    #[test]
    fn test_equality_ignores_timestamp() {
        let first = Notification::create(json!({"k": 1}), 1);
        let mut second = Notification::create(json!({"k": 1}), 1);
        second.timestamp = first.timestamp + chrono::Duration::milliseconds(2);
        assert_eq!(first, second);

        assert_ne!(first, Notification::create(json!({"k": 1}), 2));
        assert_ne!(first, Notification::create(json!({"k": 2}), 1));
        assert_ne!(Notification::delete(json!({"k": 1}), 1), first);
    }

    #[test]
    fn test_notification_serialization() {
        let n = Notification::delete(json!({"key": "a"}), 5);
        let json = serde_json::to_value(&n).unwrap();
        assert!(json.get("new_value").is_none());
        assert_eq!(json["sequence"], 5);
    }
}
