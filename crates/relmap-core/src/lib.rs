//! Core types and traits for the relmap unit-of-work ORM.
//!
//! This crate provides the foundational abstractions shared by the
//! unit-of-work engine and by implementors of its collaborator services:
//!
//! - `Entity` / `AnyEntity` traits and shared instance handles
//! - `EntityDescriptor` mapping metadata value objects
//! - `Value`, `EntityRecord`, and `ChangeSet` data types
//! - `EntityPersister`, the storage gateway the coordinator drives
//! - `Outcome` / `Cx` re-exports from asupersync for cancel-correct
//!   operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod assoc;
pub mod entity;
pub mod error;
pub mod metadata;
pub mod persister;
pub mod record;
pub mod value;

pub use assoc::{Assoc, Collection, Reference, ReferenceLoader};
pub use entity::{
    AnyEntity, AssociationValue, CollectionSnapshot, Entity, EntityReadGuard, EntityRef,
    EntityWriteGuard, Ref, entity_addr, same_instance,
};
pub use error::{
    CommitFailureError, DuplicateIdentityError, Error, IdentifierError, IdentifierErrorKind,
    InvalidArgumentError, MetadataError, OptimisticLockError, PersisterError, Result,
};
pub use metadata::{
    AssociationKind, AssociationMeta, Cascade, ChangeTrackingPolicy, EntityDescriptor, FieldMeta,
    IdGeneration, JunctionMeta,
};
pub use persister::{Criteria, EntityPersister, InsertResult, LockMode};
pub use record::{ChangeSet, EntityRecord, FieldChange};
pub use value::{FieldType, Value, hash_identity, hash_value, loosely_equal};
