//! relmap: a unit-of-work object-relational mapping core.
//!
//! relmap binds object models to relational storage through an explicit
//! unit of work. A [`Session`] tracks every entity it touches in an
//! identity map, computes field-level change sets against snapshots at
//! flush time, orders cascaded inserts and deletes by foreign-key
//! dependencies (breaking cycles with deferred foreign keys), and commits
//! the result through an [`EntityPersister`] gateway inside a single
//! transaction, with optimistic-lock conflict detection and an optional
//! second-level cache.
//!
//! SQL generation, query parsing, and mapping compilation are external
//! collaborators: the session consumes `'static` [`EntityDescriptor`]
//! metadata and drives a persister; it never builds SQL or introspects
//! types at runtime.
//!
//! # Quick start
//!
//! ```ignore
//! use relmap::prelude::*;
//!
//! let mut session = Session::new(persister);
//!
//! let customer = Ref::new(Customer::new("Ada"));
//! let order = Ref::new(Order::new(100));
//! order.write().customer.set(customer.clone());
//!
//! // Cascade schedules the customer too; commit order puts it first.
//! session.persist(&order)?;
//! session.flush(&cx).await?;
//! ```

pub use relmap_core::{
    AnyEntity, Assoc, AssociationKind, AssociationMeta, AssociationValue, Cascade, ChangeSet,
    ChangeTrackingPolicy, Collection, CollectionSnapshot, CommitFailureError, Criteria, Cx,
    DuplicateIdentityError, Entity, EntityDescriptor, EntityPersister, EntityReadGuard,
    EntityRecord, EntityRef, EntityWriteGuard, Error, FieldChange, FieldMeta, FieldType,
    IdGeneration, IdentifierError, IdentifierErrorKind, InsertResult, InvalidArgumentError,
    JunctionMeta, LockMode, MetadataError, OptimisticLockError, Outcome, PersisterError, Ref,
    Reference, ReferenceLoader, Result, Value, entity_addr, hash_identity, loosely_equal,
    same_instance,
};
pub use relmap_session::{
    CacheStats, CachedEntity, CommitOrder, CommitOrderCalculator, CommitPlan, ConcurrencyStrategy,
    DeferredConstraint, EntityKey, EntityState, FlushStats, IdentityMap, InstanceId, PendingCounts,
    SecondLevelCache, Session, SessionConfig, SessionEvent, StateTracker,
};

/// Commonly used items, importable in one line.
pub mod prelude {
    pub use relmap_core::{
        AnyEntity, Assoc, AssociationKind, AssociationMeta, Cascade, ChangeTrackingPolicy,
        Collection, Criteria, Cx, Entity, EntityDescriptor, EntityPersister, EntityRecord, Error,
        FieldMeta, FieldType, IdGeneration, JunctionMeta, LockMode, Outcome, Ref, Reference,
        Result, Value,
    };
    pub use relmap_session::{
        ConcurrencyStrategy, EntityState, FlushStats, SecondLevelCache, Session, SessionConfig,
    };
}
