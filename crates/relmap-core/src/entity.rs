//! The entity contract and shared instance handles.
//!
//! Application structs participate in the unit of work through two traits:
//!
//! - [`AnyEntity`] is the object-safe runtime view the coordinator works
//!   with: descriptor lookup, scalar field values, identifier, association
//!   snapshots, and field writes (generated identifiers, deferred foreign
//!   keys). It is what flows through the type-erased flush pipeline.
//! - [`Entity`] adds the typed pieces — static descriptor access and
//!   hydration from an [`EntityRecord`] — used by `find` and friends.
//!
//! Instances are shared by reference between application code and the
//! coordinator: [`EntityRef`] is the type-erased `Arc<RwLock<_>>` handle,
//! [`Ref<T>`] the typed wrapper with mapped guards. The coordinator is the
//! sole writer of tracked metadata; application code is the sole writer of
//! business fields.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::Result;
use crate::metadata::EntityDescriptor;
use crate::record::EntityRecord;
use crate::value::Value;

/// Object-safe runtime view of a persistent entity.
pub trait AnyEntity: Any + Send + Sync {
    /// The mapping metadata for this instance's class.
    fn entity_descriptor(&self) -> &'static EntityDescriptor;

    /// Current values of all persistent scalar fields, in descriptor order.
    /// Association foreign keys are *not* included; the coordinator derives
    /// them from [`AnyEntity::association`] targets.
    fn field_values(&self) -> EntityRecord;

    /// Current identifier values, in descriptor order. Unassigned
    /// (storage-generated, pre-insert) components are `Value::Null`.
    fn identifier(&self) -> Vec<Value>;

    /// Snapshot of the named association's current state.
    fn association(&self, name: &str) -> AssociationValue;

    /// Write a scalar field. Used by the coordinator to assign generated
    /// identifiers, bump version fields, and apply refreshed records.
    fn set_field(&mut self, name: &str, value: Value);

    /// Reset insert/delete diff tracking on every collection-valued
    /// association after a successful flush.
    fn clear_collection_state(&mut self) {}

    /// Upcast for typed downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast for typed downcasting.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A mapped entity type.
pub trait Entity: AnyEntity + Clone + Sized {
    /// The `'static` mapping metadata for this class.
    fn descriptor() -> &'static EntityDescriptor;

    /// Construct an instance from a persister-hydrated record.
    ///
    /// Associations come up unloaded; the caller wires collection and
    /// to-one handles afterwards if it eagerly fetched them.
    fn hydrate(record: &EntityRecord) -> Result<Self>;
}

/// Type-erased snapshot of one association's current state.
#[derive(Clone)]
pub enum AssociationValue {
    /// No such association, or a to-one association with no target.
    Absent,
    /// A to-one association's target instance.
    One(EntityRef),
    /// A to-one association whose target is known only by identity (the
    /// hydrated foreign key; the instance was never loaded).
    Reference(Vec<Value>),
    /// A to-many association's collection state.
    Many(CollectionSnapshot),
}

/// Type-erased snapshot of a collection-valued association.
#[derive(Clone, Default)]
pub struct CollectionSnapshot {
    /// Whether the collection's membership has been loaded. Uninitialized
    /// collections still report diffs (extra-lazy add/remove).
    pub initialized: bool,
    /// Current members (empty when uninitialized).
    pub items: Vec<EntityRef>,
    /// Members added since the last synchronization.
    pub inserted: Vec<EntityRef>,
    /// Members removed since the last synchronization.
    pub removed: Vec<EntityRef>,
}

/// Shared, type-erased handle to an entity instance.
pub type EntityRef = Arc<RwLock<dyn AnyEntity>>;

/// Read guard yielding the concrete entity type.
pub type EntityReadGuard<'a, T> = MappedRwLockReadGuard<'a, T>;

/// Write guard yielding the concrete entity type.
pub type EntityWriteGuard<'a, T> = MappedRwLockWriteGuard<'a, T>;

/// Stable address of a shared handle, used to key per-instance bookkeeping
/// (visited sets, instance registries) without hashing entity state.
#[must_use]
pub fn entity_addr(entity: &EntityRef) -> usize {
    Arc::as_ptr(entity).cast::<()>() as usize
}

/// Pointer identity of two shared handles.
#[must_use]
pub fn same_instance(a: &EntityRef, b: &EntityRef) -> bool {
    Arc::ptr_eq(a, b)
}

/// A typed handle onto a shared entity instance.
///
/// Cloning a `Ref` clones the handle, never the entity: every clone reads
/// and writes the same underlying instance, which is what makes identity-map
/// guarantees observable to application code.
pub struct Ref<T: Entity> {
    inner: EntityRef,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> Ref<T> {
    /// Wrap a fresh instance in a shared handle.
    pub fn new(entity: T) -> Self {
        let inner: EntityRef = Arc::new(RwLock::new(entity));
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    /// Re-type a shared handle. Returns `None` if the instance is not a
    /// `T`.
    pub fn from_shared(shared: &EntityRef) -> Option<Self> {
        if shared.read().as_any().is::<T>() {
            Some(Self {
                inner: Arc::clone(shared),
                _marker: PhantomData,
            })
        } else {
            None
        }
    }

    /// Read access to the entity.
    pub fn read(&self) -> EntityReadGuard<'_, T> {
        RwLockReadGuard::map(self.inner.read(), |entity| {
            entity
                .as_any()
                .downcast_ref::<T>()
                .expect("typed handle points at a different entity type")
        })
    }

    /// Write access to the entity.
    pub fn write(&self) -> EntityWriteGuard<'_, T> {
        RwLockWriteGuard::map(self.inner.write(), |entity| {
            entity
                .as_any_mut()
                .downcast_mut::<T>()
                .expect("typed handle points at a different entity type")
        })
    }

    /// The type-erased handle backing this reference.
    #[must_use]
    pub fn shared(&self) -> EntityRef {
        Arc::clone(&self.inner)
    }

    /// Pointer identity with another typed handle.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Entity> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _marker: PhantomData,
        }
    }
}

impl<T: Entity + std::fmt::Debug> std::fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Ref").field(&*self.read()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ChangeTrackingPolicy, FieldMeta, IdGeneration};
    use crate::value::FieldType;

    #[derive(Debug, Clone, PartialEq)]
    struct Gadget {
        id: Option<i64>,
        label: String,
    }

    const GADGET_FIELDS: &[FieldMeta] = &[
        FieldMeta::new("id", "id", FieldType::Integer).identifier(),
        FieldMeta::new("label", "label", FieldType::Text),
    ];

    static GADGET_DESCRIPTOR: EntityDescriptor = EntityDescriptor {
        entity_name: "Gadget",
        root_entity: "Gadget",
        table: "gadgets",
        identifier: &["id"],
        id_generation: IdGeneration::Storage,
        fields: GADGET_FIELDS,
        associations: &[],
        version_field: None,
        read_only: false,
        change_tracking: ChangeTrackingPolicy::DeferredImplicit,
    };

    impl AnyEntity for Gadget {
        fn entity_descriptor(&self) -> &'static EntityDescriptor {
            &GADGET_DESCRIPTOR
        }

        fn field_values(&self) -> EntityRecord {
            EntityRecord::from_pairs(vec![
                ("id", Value::from(self.id)),
                ("label", Value::Text(self.label.clone())),
            ])
        }

        fn identifier(&self) -> Vec<Value> {
            vec![Value::from(self.id)]
        }

        fn association(&self, _name: &str) -> AssociationValue {
            AssociationValue::Absent
        }

        fn set_field(&mut self, name: &str, value: Value) {
            match name {
                "id" => self.id = value.as_i64(),
                "label" => {
                    if let Value::Text(s) = value {
                        self.label = s;
                    }
                }
                _ => {}
            }
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    impl Entity for Gadget {
        fn descriptor() -> &'static EntityDescriptor {
            &GADGET_DESCRIPTOR
        }

        fn hydrate(record: &EntityRecord) -> Result<Self> {
            Ok(Self {
                id: record.get("id").and_then(Value::as_i64),
                label: record
                    .get("label")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            })
        }
    }

    #[test]
    fn test_ref_shares_one_instance() {
        let gadget = Ref::new(Gadget {
            id: Some(1),
            label: "lamp".to_string(),
        });
        let alias = gadget.clone();

        gadget.write().label = "torch".to_string();

        assert_eq!(alias.read().label, "torch");
        assert!(gadget.ptr_eq(&alias));
    }

    #[test]
    fn test_shared_roundtrip_preserves_identity() {
        let gadget = Ref::new(Gadget {
            id: Some(2),
            label: "fan".to_string(),
        });
        let shared = gadget.shared();
        let retyped = Ref::<Gadget>::from_shared(&shared).expect("same type");

        assert!(same_instance(&gadget.shared(), &retyped.shared()));
        assert_eq!(entity_addr(&shared), entity_addr(&retyped.shared()));
    }

    #[test]
    fn test_set_field_writes_generated_id() {
        let gadget = Ref::new(Gadget {
            id: None,
            label: "hook".to_string(),
        });
        gadget.shared().write().set_field("id", Value::BigInt(7));
        assert_eq!(gadget.read().id, Some(7));
    }

    #[test]
    fn test_hydrate_from_record() {
        let record = EntityRecord::from_pairs(vec![
            ("id", Value::BigInt(3)),
            ("label", Value::Text("crate".to_string())),
        ]);
        let gadget = Gadget::hydrate(&record).unwrap();
        assert_eq!(gadget.id, Some(3));
        assert_eq!(gadget.label, "crate");
    }
}
