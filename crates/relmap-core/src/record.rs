//! Entity records and change sets.
//!
//! An `EntityRecord` is the flat field-name → value form of one entity row:
//! persisters hydrate from it, snapshots store it, cache regions share it.
//! A `ChangeSet` is the field-level diff the coordinator hands to a
//! persister's UPDATE.

use serde::Serialize;

use crate::value::Value;

/// An ordered set of named field values for one entity.
///
/// Field order follows the descriptor's declaration order, which keeps
/// snapshots and diff output deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntityRecord {
    fields: Vec<(&'static str, Value)>,
}

impl EntityRecord {
    /// Create an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Create a record from name/value pairs.
    #[must_use]
    pub fn from_pairs(fields: Vec<(&'static str, Value)>) -> Self {
        Self { fields }
    }

    /// Get a field value by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| *field == name)
            .map(|(_, value)| value)
    }

    /// Set a field value, replacing any existing entry with the same name.
    pub fn set(&mut self, name: &'static str, value: Value) {
        if let Some(entry) = self.fields.iter_mut().find(|(field, _)| *field == name) {
            entry.1 = value;
        } else {
            self.fields.push((name, value));
        }
    }

    /// Iterate over the (name, value) pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Value)> {
        self.fields.iter().map(|(name, value)| (*name, value))
    }

    /// Number of fields in the record.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if the record has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<(&'static str, Value)> for EntityRecord {
    fn from_iter<I: IntoIterator<Item = (&'static str, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// One changed field: its name and the (old, new) value pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    /// The field name.
    pub field: &'static str,
    /// The last-synchronized value.
    pub old: Value,
    /// The current value.
    pub new: Value,
}

/// The field-level diff for one entity, computed at flush time.
///
/// Consumed by the persister's UPDATE, then discarded. Fields whose new
/// value equals the old never appear here.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeSet {
    changes: Vec<FieldChange>,
}

impl ChangeSet {
    /// Create an empty change set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            changes: Vec::new(),
        }
    }

    /// Record a field change.
    pub fn push(&mut self, field: &'static str, old: Value, new: Value) {
        self.changes.push(FieldChange { field, old, new });
    }

    /// Get the (old, new) pair for a field, if it changed.
    pub fn get(&self, field: &str) -> Option<(&Value, &Value)> {
        self.changes
            .iter()
            .find(|change| change.field == field)
            .map(|change| (&change.old, &change.new))
    }

    /// The names of the changed fields, in descriptor order.
    pub fn field_names(&self) -> Vec<&'static str> {
        self.changes.iter().map(|change| change.field).collect()
    }

    /// Iterate over the individual changes.
    pub fn iter(&self) -> impl Iterator<Item = &FieldChange> {
        self.changes.iter()
    }

    /// Number of changed fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Check if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Merge another change set into this one, newer values winning.
    pub fn merge(&mut self, other: ChangeSet) {
        for change in other.changes {
            if let Some(existing) = self
                .changes
                .iter_mut()
                .find(|c| c.field == change.field)
            {
                existing.new = change.new;
            } else {
                self.changes.push(change);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_get_and_set() {
        let mut record = EntityRecord::from_pairs(vec![
            ("id", Value::BigInt(1)),
            ("name", Value::Text("Ada".to_string())),
        ]);

        assert_eq!(record.get("id"), Some(&Value::BigInt(1)));
        assert_eq!(record.get("missing"), None);

        record.set("name", Value::Text("Grace".to_string()));
        assert_eq!(record.get("name"), Some(&Value::Text("Grace".to_string())));
        assert_eq!(record.len(), 2);

        record.set("age", Value::Int(36));
        assert_eq!(record.len(), 3);
    }

    #[test]
    fn test_record_preserves_order() {
        let record = EntityRecord::from_pairs(vec![
            ("b", Value::Int(2)),
            ("a", Value::Int(1)),
        ]);
        let names: Vec<&str> = record.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_change_set_push_and_get() {
        let mut changes = ChangeSet::new();
        changes.push("total", Value::BigInt(100), Value::BigInt(150));

        assert_eq!(changes.len(), 1);
        let (old, new) = changes.get("total").unwrap();
        assert_eq!(old, &Value::BigInt(100));
        assert_eq!(new, &Value::BigInt(150));
        assert!(changes.get("missing").is_none());
    }

    #[test]
    fn test_change_set_merge_newer_wins() {
        let mut first = ChangeSet::new();
        first.push("total", Value::BigInt(100), Value::BigInt(120));

        let mut second = ChangeSet::new();
        second.push("total", Value::BigInt(120), Value::BigInt(150));
        second.push("note", Value::Null, Value::Text("rush".to_string()));

        first.merge(second);

        assert_eq!(first.len(), 2);
        let (old, new) = first.get("total").unwrap();
        assert_eq!(old, &Value::BigInt(100));
        assert_eq!(new, &Value::BigInt(150));
    }
}
