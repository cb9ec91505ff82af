//! Scheduled operations and the commit plan.
//!
//! During change-set computation the coordinator fills three disjoint
//! operation sets (insertions, updates, deletions) plus junction-table
//! operations for many-to-many collections. This module holds those
//! operation types and assembles them into a `CommitPlan`: inserts in
//! commit order, foreign-key backfills for cycle-broken columns, updates
//! (no cross-entity ordering), junction unlinks, deletes in reverse commit
//! order, junction links last.
//!
//! Operations reference tracked instances, not materialized rows: insert
//! data is built at execution time so identifiers generated for parents
//! earlier in the plan are visible to their children.

use serde::{Deserialize, Serialize};

use relmap_core::{ChangeSet, EntityDescriptor, EntityRef, JunctionMeta};

use crate::commit_order::CommitOrder;
use crate::tracker::InstanceId;

/// One scheduled INSERT.
#[derive(Debug)]
pub struct ScheduledInsert {
    /// The tracked instance to insert.
    pub instance: InstanceId,
    /// The instance's class.
    pub descriptor: &'static EntityDescriptor,
    /// Scheduling sequence, used as a stable tie-break within a class.
    pub seq: usize,
}

/// One scheduled UPDATE with its computed change set.
#[derive(Debug)]
pub struct ScheduledUpdate {
    /// The tracked instance to update.
    pub instance: InstanceId,
    /// The instance's class.
    pub descriptor: &'static EntityDescriptor,
    /// The field-level diff to apply.
    pub changes: ChangeSet,
}

/// One scheduled DELETE.
#[derive(Debug)]
pub struct ScheduledDelete {
    /// The tracked instance to delete.
    pub instance: InstanceId,
    /// The instance's class.
    pub descriptor: &'static EntityDescriptor,
    /// Scheduling sequence, used as a stable tie-break within a class.
    pub seq: usize,
}

/// A foreign-key backfill UPDATE for a cycle-broken insert.
#[derive(Debug)]
pub struct DeferredFkUpdate {
    /// The instance whose insert omitted the column.
    pub instance: InstanceId,
    /// The instance's class.
    pub descriptor: &'static EntityDescriptor,
    /// The association whose target supplies the value.
    pub association: &'static str,
    /// The column to backfill.
    pub join_column: &'static str,
}

/// A junction-table row operation for a many-to-many association.
pub enum JunctionOp {
    /// Insert a junction row.
    Link {
        /// Junction table metadata.
        junction: JunctionMeta,
        /// The owning-side instance.
        owner: InstanceId,
        /// The target instance.
        target: EntityRef,
    },
    /// Delete a junction row.
    Unlink {
        /// Junction table metadata.
        junction: JunctionMeta,
        /// The owning-side instance.
        owner: InstanceId,
        /// The target instance.
        target: EntityRef,
    },
}

impl std::fmt::Debug for JunctionOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // `EntityRef` wraps `dyn AnyEntity`, which is not `Debug`; identify the
        // target by its stable handle address, as the coordinator does.
        let (name, junction, owner, target) = match self {
            JunctionOp::Link {
                junction,
                owner,
                target,
            } => ("Link", junction, owner, target),
            JunctionOp::Unlink {
                junction,
                owner,
                target,
            } => ("Unlink", junction, owner, target),
        };
        f.debug_struct(name)
            .field("junction", junction)
            .field("owner", owner)
            .field("target", &relmap_core::entity_addr(target))
            .finish()
    }
}

impl JunctionOp {
    /// The junction table this operation touches.
    #[must_use]
    pub fn junction(&self) -> &JunctionMeta {
        match self {
            JunctionOp::Link { junction, .. } | JunctionOp::Unlink { junction, .. } => junction,
        }
    }

    /// Whether this is a link (insert) operation.
    #[must_use]
    pub fn is_link(&self) -> bool {
        matches!(self, JunctionOp::Link { .. })
    }
}

/// The fully-ordered set of operations for one flush.
#[derive(Debug, Default)]
pub struct CommitPlan {
    /// INSERTs, ordered referenced-class-first.
    pub inserts: Vec<ScheduledInsert>,
    /// Post-insert foreign-key backfills for cycle-broken columns.
    pub deferred_updates: Vec<DeferredFkUpdate>,
    /// UPDATEs; no cross-entity ordering constraint.
    pub updates: Vec<ScheduledUpdate>,
    /// Junction-row deletions; run before entity DELETEs so junction rows
    /// never reference missing endpoints.
    pub unlinks: Vec<JunctionOp>,
    /// DELETEs, ordered referencing-class-first (reverse commit order).
    pub deletes: Vec<ScheduledDelete>,
    /// Junction-row insertions; run last, after both endpoints exist.
    pub links: Vec<JunctionOp>,
    /// Instances whose collection diffs are consumed by this plan; their
    /// diff tracking resets after a successful commit.
    pub collection_owners: Vec<InstanceId>,
}

impl CommitPlan {
    /// Create an empty plan.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the plan contains any storage operation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.deferred_updates.is_empty()
            && self.updates.is_empty()
            && self.unlinks.is_empty()
            && self.deletes.is_empty()
            && self.links.is_empty()
    }

    /// Total number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inserts.len()
            + self.deferred_updates.len()
            + self.updates.len()
            + self.unlinks.len()
            + self.deletes.len()
            + self.links.len()
    }

    /// Sort inserts into commit order and deletes into its reverse,
    /// keeping scheduling order within a class.
    pub fn apply_commit_order(&mut self, order: &CommitOrder) {
        self.inserts
            .sort_by_key(|op| (order.position(op.descriptor.entity_name), op.seq));
        self.deletes.sort_by_key(|op| {
            (
                std::cmp::Reverse(order.position(op.descriptor.entity_name)),
                op.seq,
            )
        });
    }
}

/// Row counts from a successful flush.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushStats {
    /// Rows inserted.
    pub inserted: usize,
    /// Rows updated (foreign-key backfills included).
    pub updated: usize,
    /// Rows deleted.
    pub deleted: usize,
    /// Junction rows written or removed.
    pub junction_rows: usize,
}

impl FlushStats {
    /// Total number of statements that touched storage.
    #[must_use]
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.junction_rows
    }
}
