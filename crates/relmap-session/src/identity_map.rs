//! Identity map: one in-memory instance per persistent identity.
//!
//! The map guarantees that every row a session touches is represented by
//! exactly one shared instance. This provides:
//!
//! - **Uniqueness**: the same identity always resolves to the same handle
//! - **Cache**: repeated lookups never re-query storage
//! - **Consistency**: a change made through one handle is visible through
//!   every other handle to the same row
//!
//! # Keying
//!
//! Entries are keyed by *root* entity name plus a hash of the identifier
//! values. Subclasses in an inheritance hierarchy share their root's key
//! space, so a polymorphic lookup by base class finds an instance loaded
//! as a subclass.

use std::collections::HashMap;

use relmap_core::{
    DuplicateIdentityError, Entity, EntityRef, Error, Ref, Result, Value, hash_identity,
    same_instance,
};

/// Composite key for one identity-map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityKey {
    root: &'static str,
    id_hash: u64,
}

impl EntityKey {
    /// Build a key from a root entity name and identifier values.
    #[must_use]
    pub fn new(root: &'static str, identity: &[Value]) -> Self {
        Self {
            root,
            id_hash: hash_identity(identity),
        }
    }

    /// The root entity name this key belongs to.
    #[must_use]
    pub fn root(&self) -> &'static str {
        self.root
    }

    /// The identifier hash component.
    #[must_use]
    pub fn id_hash(&self) -> u64 {
        self.id_hash
    }
}

/// Identity map from [`EntityKey`] to shared entity handles.
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<EntityKey, EntityRef>,
}

impl IdentityMap {
    /// Create a new empty identity map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Look up the handle registered for a key.
    pub fn get(&self, key: &EntityKey) -> Option<EntityRef> {
        self.entries.get(key).cloned()
    }

    /// Typed lookup by identifier values.
    pub fn get_typed<M: Entity>(&self, identity: &[Value]) -> Option<Ref<M>> {
        let key = EntityKey::new(M::descriptor().root_entity, identity);
        self.entries.get(&key).and_then(Ref::from_shared)
    }

    /// Register a handle under a key.
    ///
    /// Registering the same instance twice is a no-op; registering a
    /// *different* instance under an occupied key fails with the
    /// duplicate-identity error.
    pub fn register(&mut self, key: EntityKey, entity: &EntityRef) -> Result<()> {
        if let Some(existing) = self.entries.get(&key) {
            if same_instance(existing, entity) {
                return Ok(());
            }
            return Err(Error::DuplicateIdentity(DuplicateIdentityError {
                entity: key.root,
                identity: entity.read().identifier(),
            }));
        }
        self.entries.insert(key, entity.clone());
        Ok(())
    }

    /// Check whether a key is registered.
    #[must_use]
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Unregister a key. Returns `true` if an entry was removed.
    pub fn remove(&mut self, key: &EntityKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Discard every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of registered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
