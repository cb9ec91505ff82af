//! Association carriers for entity structs.
//!
//! - [`Assoc<T>`] holds the target of a to-one association.
//! - [`Collection<T>`] holds a to-many association and tracks its insert
//!   and delete diffs; an uninitialized collection still records adds and
//!   removes without loading its membership ("extra lazy").
//! - [`Reference<T>`] is an identity-only lazy placeholder: it resolves
//!   through a [`ReferenceLoader`] exactly once and memoizes the result.

use std::future::Future;
use std::sync::OnceLock;

use asupersync::{Cx, Outcome};

use crate::entity::{AssociationValue, CollectionSnapshot, Entity, Ref};
use crate::error::Error;
use crate::value::Value;

/// A to-one association target.
///
/// Hydration leaves the association *unloaded*: the foreign key identity is
/// kept so flushing never nulls the column, but the target instance is not
/// fetched until something asks for it.
#[derive(Debug)]
enum AssocState<T: Entity> {
    Unset,
    Unloaded(Vec<Value>),
    Loaded(Ref<T>),
}

/// A to-one association field.
#[derive(Debug)]
pub struct Assoc<T: Entity> {
    state: AssocState<T>,
}

impl<T: Entity> Assoc<T> {
    /// An association with no target (NULL foreign key).
    #[must_use]
    pub fn empty() -> Self {
        Self {
            state: AssocState::Unset,
        }
    }

    /// An association whose target is known only by identity (hydrated
    /// foreign key, target not loaded).
    #[must_use]
    pub fn unloaded(identity: Vec<Value>) -> Self {
        Self {
            state: AssocState::Unloaded(identity),
        }
    }

    /// An association pointing at the given instance.
    #[must_use]
    pub fn to(target: Ref<T>) -> Self {
        Self {
            state: AssocState::Loaded(target),
        }
    }

    /// Point the association at a new target.
    pub fn set(&mut self, target: Ref<T>) {
        self.state = AssocState::Loaded(target);
    }

    /// Clear the association (NULL foreign key).
    pub fn clear(&mut self) {
        self.state = AssocState::Unset;
    }

    /// The loaded target, if any.
    #[must_use]
    pub fn get(&self) -> Option<&Ref<T>> {
        match &self.state {
            AssocState::Loaded(target) => Some(target),
            _ => None,
        }
    }

    /// Whether a target is set (loaded or known by identity).
    #[must_use]
    pub fn is_set(&self) -> bool {
        !matches!(self.state, AssocState::Unset)
    }

    /// Whether the target instance is loaded.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        matches!(self.state, AssocState::Loaded(_))
    }

    /// The target's identifier values, if a target is set.
    #[must_use]
    pub fn target_identifier(&self) -> Option<Vec<Value>> {
        match &self.state {
            AssocState::Unset => None,
            AssocState::Unloaded(identity) => Some(identity.clone()),
            AssocState::Loaded(target) => Some(target.read().identifier()),
        }
    }

    /// Type-erased snapshot for the unit of work.
    #[must_use]
    pub fn snapshot(&self) -> AssociationValue {
        match &self.state {
            AssocState::Unset => AssociationValue::Absent,
            AssocState::Unloaded(identity) => AssociationValue::Reference(identity.clone()),
            AssocState::Loaded(target) => AssociationValue::One(target.shared()),
        }
    }
}

impl<T: Entity> Default for Assoc<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: Entity> Clone for Assoc<T> {
    fn clone(&self) -> Self {
        Self {
            state: match &self.state {
                AssocState::Unset => AssocState::Unset,
                AssocState::Unloaded(identity) => AssocState::Unloaded(identity.clone()),
                AssocState::Loaded(target) => AssocState::Loaded(target.clone()),
            },
        }
    }
}

/// A to-many association with insert/delete diff tracking.
///
/// The diffs let the change-set computer see what joined and what left
/// without comparing full membership. An uninitialized collection (the
/// loaded entity never touched it) keeps `items` empty but still records
/// diffs, so adding to a huge collection never hydrates it.
#[derive(Debug)]
pub struct Collection<T: Entity> {
    items: Vec<Ref<T>>,
    inserted: Vec<Ref<T>>,
    removed: Vec<Ref<T>>,
    initialized: bool,
}

impl<T: Entity> Collection<T> {
    /// An initialized, empty collection (the state of a NEW entity).
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            inserted: Vec::new(),
            removed: Vec::new(),
            initialized: true,
        }
    }

    /// An uninitialized collection (the state after hydration, before any
    /// membership load).
    #[must_use]
    pub fn uninitialized() -> Self {
        Self {
            items: Vec::new(),
            inserted: Vec::new(),
            removed: Vec::new(),
            initialized: false,
        }
    }

    /// Replace the membership with loaded instances and mark initialized.
    pub fn load(&mut self, items: Vec<Ref<T>>) {
        self.items = items;
        self.inserted.clear();
        self.removed.clear();
        self.initialized = true;
    }

    /// Add an instance to the collection.
    ///
    /// Works on uninitialized collections too; the add is recorded in the
    /// insert diff without loading membership.
    pub fn add(&mut self, item: Ref<T>) {
        if let Some(pos) = self.removed.iter().position(|r| r.ptr_eq(&item)) {
            // Re-adding something removed this session cancels the removal.
            self.removed.remove(pos);
        } else if !self.inserted.iter().any(|r| r.ptr_eq(&item)) {
            self.inserted.push(item.clone());
        }
        if self.initialized && !self.items.iter().any(|r| r.ptr_eq(&item)) {
            self.items.push(item);
        }
    }

    /// Remove an instance from the collection.
    ///
    /// Returns `true` if the instance was a current member or a pending
    /// insert. On uninitialized collections the removal is recorded in the
    /// delete diff without loading membership.
    pub fn remove(&mut self, item: &Ref<T>) -> bool {
        if let Some(pos) = self.inserted.iter().position(|r| r.ptr_eq(item)) {
            self.inserted.remove(pos);
            self.items.retain(|r| !r.ptr_eq(item));
            return true;
        }

        let was_member = if self.initialized {
            let before = self.items.len();
            self.items.retain(|r| !r.ptr_eq(item));
            self.items.len() < before
        } else {
            true
        };

        if was_member && !self.removed.iter().any(|r| r.ptr_eq(item)) {
            self.removed.push(item.clone());
        }
        was_member
    }

    /// Whether membership has been loaded.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Current members. Empty for uninitialized collections.
    #[must_use]
    pub fn items(&self) -> &[Ref<T>] {
        &self.items
    }

    /// Instances added since the last synchronization.
    #[must_use]
    pub fn insert_diff(&self) -> &[Ref<T>] {
        &self.inserted
    }

    /// Instances removed since the last synchronization.
    #[must_use]
    pub fn delete_diff(&self) -> &[Ref<T>] {
        &self.removed
    }

    /// Whether the given instance is a current member.
    #[must_use]
    pub fn contains(&self, item: &Ref<T>) -> bool {
        self.items.iter().any(|r| r.ptr_eq(item))
    }

    /// Iterate over current members.
    pub fn iter(&self) -> impl Iterator<Item = &Ref<T>> {
        self.items.iter()
    }

    /// Number of current members. Zero for uninitialized collections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if there are no loaded members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Clear the diffs after a successful flush. Initialization state is
    /// preserved: an extra-lazy collection stays unloaded.
    pub fn mark_synced(&mut self) {
        self.inserted.clear();
        self.removed.clear();
    }

    /// Type-erased snapshot for the unit of work.
    #[must_use]
    pub fn snapshot(&self) -> AssociationValue {
        AssociationValue::Many(CollectionSnapshot {
            initialized: self.initialized,
            items: self.items.iter().map(Ref::shared).collect(),
            inserted: self.inserted.iter().map(Ref::shared).collect(),
            removed: self.removed.iter().map(Ref::shared).collect(),
        })
    }
}

impl<T: Entity> Default for Collection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
            inserted: self.inserted.clone(),
            removed: self.removed.clone(),
            initialized: self.initialized,
        }
    }
}

/// Loads the target of a lazy reference by identity.
pub trait ReferenceLoader<T: Entity> {
    /// Load the instance with the given identifier, or `None` if the row
    /// no longer exists.
    fn load_reference(
        &mut self,
        cx: &Cx,
        identity: &[Value],
    ) -> impl Future<Output = Outcome<Option<Ref<T>>, Error>> + Send;
}

/// An identity-only lazy placeholder for an entity.
///
/// `get_reference` hands these out without a storage round-trip. The first
/// `resolve` triggers the loader; the result is memoized, so the loader
/// runs at most once per reference. A failed or cancelled load does not
/// mark the reference resolved, allowing retries.
#[derive(Debug)]
pub struct Reference<T: Entity> {
    identity: Vec<Value>,
    resolved: OnceLock<Ref<T>>,
}

impl<T: Entity> Reference<T> {
    /// Create an unresolved reference to the given identity.
    #[must_use]
    pub fn new(identity: Vec<Value>) -> Self {
        Self {
            identity,
            resolved: OnceLock::new(),
        }
    }

    /// Create an already-resolved reference from a loaded instance.
    #[must_use]
    pub fn resolved(instance: Ref<T>) -> Self {
        let identity = instance.read().identifier();
        let cell = OnceLock::new();
        let _ = cell.set(instance);
        Self {
            identity,
            resolved: cell,
        }
    }

    /// The identity this reference points at.
    #[must_use]
    pub fn identity(&self) -> &[Value] {
        &self.identity
    }

    /// The resolved instance, if resolution already happened.
    #[must_use]
    pub fn get(&self) -> Option<&Ref<T>> {
        self.resolved.get()
    }

    /// Whether the target has been loaded.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.resolved.get().is_some()
    }

    /// Resolve the reference, loading the target on first use.
    ///
    /// Returns `Ok(None)` if the row no longer exists in storage.
    pub async fn resolve<L>(&self, cx: &Cx, loader: &mut L) -> Outcome<Option<Ref<T>>, Error>
    where
        L: ReferenceLoader<T> + ?Sized,
    {
        if let Some(instance) = self.resolved.get() {
            return Outcome::Ok(Some(instance.clone()));
        }

        tracing::trace!(identity = ?self.identity, "resolving lazy reference");
        match loader.load_reference(cx, &self.identity).await {
            Outcome::Ok(Some(instance)) => {
                let _ = self.resolved.set(instance.clone());
                Outcome::Ok(Some(instance))
            }
            Outcome::Ok(None) => Outcome::Ok(None),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }
}
