// ── Instance records ──
//
// The canonical state of one remote device. Records are immutable:
// every update builds a modified copy that replaces the old record's
// slot atomically, so a reference a reader already holds never changes
// underneath it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::DeviceKind;

/// A single field value of an instance record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Convert a wire value. Non-scalar shapes have no canonical
    /// representation and yield `None`.
    pub fn from_wire(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n.as_f64().map(Self::Number),
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Canonical state of one device instance, keyed by
/// `(entity_type, instance_id)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceRecord {
    pub entity_type: String,
    pub instance_id: String,
    pub kind: DeviceKind,
    /// Last known value per canonical field name.
    pub fields: BTreeMap<String, FieldValue>,
    /// Timestamp of the newest applied delta that carried one.
    pub updated_at: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(FieldValue::as_number)
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        self.fields.get(name).and_then(FieldValue::as_bool)
    }

    /// Shallow copy with `changes` merged in -- the copy-on-write step.
    ///
    /// `self` is untouched; the timestamp only ever advances.
    pub(crate) fn with_changes(
        &self,
        changes: impl IntoIterator<Item = (String, FieldValue)>,
        stamp: Option<DateTime<Utc>>,
    ) -> Self {
        let mut fields = self.fields.clone();
        for (name, value) in changes {
            fields.insert(name, value);
        }

        let updated_at = match (stamp, self.updated_at) {
            (Some(new), Some(old)) => Some(new.max(old)),
            (Some(new), None) => Some(new),
            (None, old) => old,
        };

        Self {
            entity_type: self.entity_type.clone(),
            instance_id: self.instance_id.clone(),
            kind: self.kind,
            fields,
            updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> InstanceRecord {
        let mut fields = BTreeMap::new();
        fields.insert("brightness".to_owned(), FieldValue::Number(40.0));
        fields.insert("on".to_owned(), FieldValue::Bool(true));
        InstanceRecord {
            entity_type: "light".into(),
            instance_id: "L1".into(),
            kind: DeviceKind::Light,
            fields,
            updated_at: None,
        }
    }

    #[test]
    fn from_wire_converts_scalars_only() {
        assert_eq!(
            FieldValue::from_wire(&json!(true)),
            Some(FieldValue::Bool(true))
        );
        assert_eq!(
            FieldValue::from_wire(&json!(42.5)),
            Some(FieldValue::Number(42.5))
        );
        assert_eq!(
            FieldValue::from_wire(&json!("open")),
            Some(FieldValue::Text("open".into()))
        );
        assert_eq!(FieldValue::from_wire(&json!(null)), None);
        assert_eq!(FieldValue::from_wire(&json!({ "nested": 1 })), None);
        assert_eq!(FieldValue::from_wire(&json!([1, 2])), None);
    }

    #[test]
    fn with_changes_leaves_original_untouched() {
        let original = record();
        let updated = original.with_changes(
            [("brightness".to_owned(), FieldValue::Number(75.0))],
            None,
        );

        assert_eq!(original.number("brightness"), Some(40.0));
        assert_eq!(updated.number("brightness"), Some(75.0));
        assert_eq!(updated.flag("on"), Some(true));
    }

    #[test]
    fn timestamp_only_advances() {
        let newer = "2026-03-01T12:00:00Z".parse::<DateTime<Utc>>().ok();
        let older = "2026-03-01T09:00:00Z".parse::<DateTime<Utc>>().ok();

        let stamped = record().with_changes([], newer);
        assert_eq!(stamped.updated_at, newer);

        // An older delta never moves the timestamp backwards
        let restamped = stamped.with_changes([], older);
        assert_eq!(restamped.updated_at, newer);

        // And an unstamped delta keeps the existing timestamp
        let unstamped = restamped.with_changes([], None);
        assert_eq!(unstamped.updated_at, newer);
    }
}
