//! Entity lifecycle state and original-data snapshots.
//!
//! Tracked state is keyed by a session-local instance id rather than by
//! identity: a NEW entity with a storage-generated identifier has no
//! identity until after its INSERT, but its state must be tracked from the
//! moment it is persisted.
//!
//! The state machine:
//!
//! ```text
//! NEW      --persist-->        MANAGED
//! MANAGED  --remove-->         REMOVED
//! MANAGED  --detach/clear-->   DETACHED
//! REMOVED  --commit success--> (discarded)
//! ```
//!
//! Snapshots hold the last-synchronized field values and are only replaced
//! after a successful commit, so a failed flush leaves tracked state
//! consistent with storage as of the last successful synchronization.

use std::collections::HashMap;

use relmap_core::{EntityRecord, Value};

/// Session-local identifier for one tracked instance.
pub type InstanceId = u64;

/// Lifecycle state of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Known to the session, scheduled for INSERT, no row yet.
    New,
    /// Synchronized with a storage row.
    Managed,
    /// Scheduled for DELETE on the next flush.
    Removed,
    /// No longer tracked; the session will not synchronize it.
    Detached,
}

/// Tracks per-instance lifecycle state, snapshots, and versions.
#[derive(Default)]
pub struct StateTracker {
    states: HashMap<InstanceId, EntityState>,
    snapshots: HashMap<InstanceId, EntityRecord>,
    versions: HashMap<InstanceId, Value>,
}

impl StateTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an instance's lifecycle state.
    pub fn set_state(&mut self, instance: InstanceId, state: EntityState) {
        self.states.insert(instance, state);
    }

    /// Get an instance's lifecycle state.
    #[must_use]
    pub fn state(&self, instance: InstanceId) -> Option<EntityState> {
        self.states.get(&instance).copied()
    }

    /// The last-synchronized snapshot for an instance. NEW instances have
    /// none.
    #[must_use]
    pub fn original_data(&self, instance: InstanceId) -> Option<&EntityRecord> {
        self.snapshots.get(&instance)
    }

    /// Record a snapshot as the instance's new baseline.
    pub fn take_snapshot(&mut self, instance: InstanceId, record: EntityRecord) {
        self.snapshots.insert(instance, record);
    }

    /// The tracked optimistic-lock version for an instance.
    #[must_use]
    pub fn version(&self, instance: InstanceId) -> Option<&Value> {
        self.versions.get(&instance)
    }

    /// Record the tracked version for an instance.
    pub fn set_version(&mut self, instance: InstanceId, version: Value) {
        self.versions.insert(instance, version);
    }

    /// Drop every trace of an instance (detach, or removal committed).
    pub fn forget(&mut self, instance: InstanceId) {
        self.states.remove(&instance);
        self.snapshots.remove(&instance);
        self.versions.remove(&instance);
    }

    /// Drop all tracked state.
    pub fn clear(&mut self) {
        self.states.clear();
        self.snapshots.clear();
        self.versions.clear();
    }

    /// Instances currently in the given state, in unspecified order.
    pub fn instances_in_state(&self, state: EntityState) -> Vec<InstanceId> {
        let mut instances: Vec<InstanceId> = self
            .states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(id, _)| *id)
            .collect();
        instances.sort_unstable();
        instances
    }

    /// Number of tracked instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Check if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
