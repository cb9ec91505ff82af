//! The entity-persister gateway.
//!
//! The unit of work never builds SQL. Every storage operation goes through
//! an implementation of [`EntityPersister`], which receives the target
//! class's [`EntityDescriptor`] and typed operation data and is expected to
//! be transactionally consistent with the transaction the coordinator
//! currently has open.
//!
//! The session is generic over the gateway, so calls stay monomorphic and
//! futures unboxed. All storage methods thread the `Cx` context and return
//! `Outcome` so cancellation propagates explicitly.

use std::future::Future;
use std::hash::{Hash, Hasher};

use asupersync::{Cx, Outcome};

use crate::error::Error;
use crate::metadata::{EntityDescriptor, JunctionMeta};
use crate::record::{ChangeSet, EntityRecord};
use crate::value::{Value, hash_value};

/// Lock mode for loads and explicit lock requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// No locking.
    #[default]
    None,
    /// Shared pessimistic lock (`SELECT ... FOR SHARE` equivalent).
    PessimisticRead,
    /// Exclusive pessimistic lock (`SELECT ... FOR UPDATE` equivalent).
    PessimisticWrite,
    /// Version comparison against the tracked version; no storage lock.
    Optimistic,
}

impl LockMode {
    /// Does this mode require an open transaction?
    #[must_use]
    pub const fn is_pessimistic(self) -> bool {
        matches!(self, LockMode::PessimisticRead | LockMode::PessimisticWrite)
    }
}

/// A conjunction of field = value predicates.
///
/// This is the whole criteria language the core needs; anything richer
/// belongs to the (external) query layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Criteria {
    predicates: Vec<(&'static str, Value)>,
}

impl Criteria {
    /// An empty criteria set (matches everything).
    #[must_use]
    pub fn new() -> Self {
        Self {
            predicates: Vec::new(),
        }
    }

    /// Add a field = value predicate.
    #[must_use]
    pub fn eq(mut self, field: &'static str, value: impl Into<Value>) -> Self {
        self.predicates.push((field, value.into()));
        self
    }

    /// The predicates, in insertion order.
    #[must_use]
    pub fn predicates(&self) -> &[(&'static str, Value)] {
        &self.predicates
    }

    /// Stable hash of the canonical criteria (sorted by field name), used
    /// to key query-result cache entries.
    #[must_use]
    pub fn cache_key(&self) -> u64 {
        let mut sorted: Vec<&(&'static str, Value)> = self.predicates.iter().collect();
        sorted.sort_by_key(|(field, _)| *field);

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        sorted.len().hash(&mut hasher);
        for (field, value) in sorted {
            field.hash(&mut hasher);
            hash_value(value, &mut hasher);
        }
        hasher.finish()
    }
}

/// The result of one INSERT.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertResult {
    /// The storage-generated identifier, for classes with
    /// [`crate::metadata::IdGeneration::Storage`].
    pub generated_id: Option<Value>,
}

/// Executes storage operations for entity classes.
///
/// One gateway serves every class; each call names its class through the
/// descriptor. Versioned UPDATE/DELETE calls receive the expected version
/// and must make the check-and-increment atomic with the statement itself,
/// reporting the number of rows affected — zero rows on a versioned
/// statement is how conflicts surface.
pub trait EntityPersister: Send + Sync {
    /// Insert one row. For storage-generated identifiers the returned
    /// [`InsertResult`] carries the new identifier value.
    fn insert(
        &self,
        cx: &Cx,
        descriptor: &'static EntityDescriptor,
        record: &EntityRecord,
    ) -> impl Future<Output = Outcome<InsertResult, Error>> + Send;

    /// Update the row with the given identity, applying the change set.
    /// Returns rows affected.
    fn update(
        &self,
        cx: &Cx,
        descriptor: &'static EntityDescriptor,
        identity: &[Value],
        changes: &ChangeSet,
        expected_version: Option<&Value>,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Delete the row with the given identity. Returns rows affected.
    fn delete(
        &self,
        cx: &Cx,
        descriptor: &'static EntityDescriptor,
        identity: &[Value],
        expected_version: Option<&Value>,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Load one row by identity, optionally locking it.
    fn load(
        &self,
        cx: &Cx,
        descriptor: &'static EntityDescriptor,
        identity: &[Value],
        lock: LockMode,
    ) -> impl Future<Output = Outcome<Option<EntityRecord>, Error>> + Send;

    /// Load every row matching the criteria.
    fn load_by_criteria(
        &self,
        cx: &Cx,
        descriptor: &'static EntityDescriptor,
        criteria: &Criteria,
    ) -> impl Future<Output = Outcome<Vec<EntityRecord>, Error>> + Send;

    /// Count rows matching the criteria.
    fn count(
        &self,
        cx: &Cx,
        descriptor: &'static EntityDescriptor,
        criteria: &Criteria,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Check whether the row with the given identity exists.
    fn exists(
        &self,
        cx: &Cx,
        descriptor: &'static EntityDescriptor,
        identity: &[Value],
    ) -> impl Future<Output = Outcome<bool, Error>> + Send;

    /// Insert a junction-table row for a many-to-many association.
    fn link(
        &self,
        cx: &Cx,
        junction: &JunctionMeta,
        local: &Value,
        remote: &Value,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Delete a junction-table row for a many-to-many association.
    fn unlink(
        &self,
        cx: &Cx,
        junction: &JunctionMeta,
        local: &Value,
        remote: &Value,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Open a transaction.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Commit the open transaction.
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Roll back the open transaction.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Whether a transaction is currently open.
    fn in_transaction(&self) -> bool;
}
