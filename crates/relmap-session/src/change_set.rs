//! Change-set computation.
//!
//! Diffs an entity's current record against its last-synchronized snapshot
//! and produces the field-level change set its persister UPDATE will apply.
//! Comparison is *loose*: each field compares under its declared semantic
//! type (a date-time by instant, an integer across widths), so hydration
//! differences between persisters never produce phantom updates.
//!
//! Identifier fields and the optimistic-lock version field never appear in
//! a change set — identifiers are immutable and the version column is
//! advanced by the persister atomically with the UPDATE itself. Fields
//! whose new value equals the old are dropped, so no-op writes never reach
//! a persister.

use relmap_core::{ChangeSet, EntityDescriptor, EntityRecord, Value, loosely_equal};

/// How a given instance participates in dirty checking, derived from its
/// class's [`relmap_core::ChangeTrackingPolicy`].
#[derive(Debug, Clone, Copy)]
pub enum DirtyContext<'a> {
    /// Deferred-implicit: always diff against the snapshot.
    Implicit,
    /// Deferred-explicit: diff only when the instance was explicitly
    /// marked dirty this unit of work.
    Explicit {
        /// Whether `mark_dirty` was called for the instance.
        marked: bool,
    },
    /// Notify: no diffing; the instance reported its own changes.
    Notify {
        /// The changes recorded through the session's notification API.
        recorded: Option<&'a ChangeSet>,
    },
}

/// Compute the change set for one instance.
///
/// `current` is the full current record (scalar fields plus association
/// join columns); `original` is the tracked snapshot in the same shape, or
/// `None` when no snapshot exists yet.
pub fn compute_change_set(
    descriptor: &'static EntityDescriptor,
    current: &EntityRecord,
    original: Option<&EntityRecord>,
    ctx: DirtyContext<'_>,
) -> ChangeSet {
    if descriptor.read_only {
        return ChangeSet::new();
    }

    match ctx {
        DirtyContext::Implicit => diff_records(descriptor, current, original),
        DirtyContext::Explicit { marked: true } => diff_records(descriptor, current, original),
        DirtyContext::Explicit { marked: false } => ChangeSet::new(),
        DirtyContext::Notify { recorded } => {
            let mut filtered = ChangeSet::new();
            if let Some(recorded) = recorded {
                for change in recorded.iter() {
                    if !field_equal(descriptor, change.field, &change.old, &change.new) {
                        filtered.push(change.field, change.old.clone(), change.new.clone());
                    }
                }
            }
            filtered
        }
    }
}

/// Diff two records field by field.
fn diff_records(
    descriptor: &'static EntityDescriptor,
    current: &EntityRecord,
    original: Option<&EntityRecord>,
) -> ChangeSet {
    let mut changes = ChangeSet::new();

    for (name, new_value) in current.iter() {
        if let Some(field) = descriptor.field(name) {
            if field.identifier || field.version {
                continue;
            }
        }

        let old_value = original.and_then(|o| o.get(name)).unwrap_or(&Value::Null);
        if !field_equal(descriptor, name, old_value, new_value) {
            changes.push(name, old_value.clone(), new_value.clone());
        }
    }

    changes
}

/// Compare two values for one named field.
///
/// Declared scalar fields use their semantic type. Names with no field
/// metadata are association join columns and compare by identifier
/// semantics (integer widths collapse, everything else strict).
fn field_equal(
    descriptor: &'static EntityDescriptor,
    name: &str,
    old: &Value,
    new: &Value,
) -> bool {
    match descriptor.field(name) {
        Some(field) => loosely_equal(old, new, field.field_type),
        None => identifier_equal(old, new),
    }
}

/// Loose equality for identifier-shaped values (foreign keys).
pub fn identifier_equal(a: &Value, b: &Value) -> bool {
    if a.is_null() || b.is_null() {
        return a.is_null() && b.is_null();
    }
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Loose equality over whole identifier tuples.
pub fn identity_tuple_equal(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| identifier_equal(x, y))
}
