//! The unit-of-work session for relmap.
//!
//! `relmap-session` is the persistence-coordination layer. It tracks object
//! identity, entity lifecycle state, and field-level changes, and commits
//! the resulting operations through an entity-persister gateway in
//! dependency order inside a single transaction.
//!
//! # Role in the architecture
//!
//! - **Identity map**: one in-memory instance per persistent identity.
//! - **State tracking**: NEW/MANAGED/REMOVED/DETACHED per instance plus an
//!   original-data snapshot used for dirty checking.
//! - **Change sets**: field-level diffs computed at flush time.
//! - **Commit ordering**: referenced rows are written before referencing
//!   rows; deletions run in reverse; cycles break via deferred foreign
//!   keys.
//! - **Transactional safety**: one transaction per flush, rollback and
//!   session closure on storage failure.
//!
//! # Design
//!
//! - **Explicit over implicit**: nothing touches storage until `flush`.
//! - **Ownership clarity**: the session owns its persister gateway and its
//!   tracking structures; entities are shared by reference.
//! - **Single writer**: the session is not safe for concurrent use; use
//!   one session per logical task and keep persister calls serialized.
//! - **Cancel-correct**: storage-touching operations thread `Cx` and
//!   return `Outcome`.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(persister);
//!
//! // Schedule a NEW entity (INSERT happens at flush)
//! let order = Ref::new(Order::new(100));
//! session.persist(&order)?;
//!
//! // Load by identity (identity map, then cache, then storage)
//! let customer = session.find::<Customer>(&cx, 42).await?;
//!
//! // Commit everything in one transaction
//! session.flush(&cx).await?;
//! ```

pub mod cache;
pub mod change_set;
pub mod commit_order;
pub mod flush;
pub mod identity_map;
pub mod tracker;

pub use cache::{CacheStats, CachedEntity, ConcurrencyStrategy, SecondLevelCache};
pub use change_set::{DirtyContext, compute_change_set, identifier_equal, identity_tuple_equal};
pub use commit_order::{CommitOrder, CommitOrderCalculator, DeferredConstraint};
pub use flush::{
    CommitPlan, DeferredFkUpdate, FlushStats, JunctionOp, ScheduledDelete, ScheduledInsert,
    ScheduledUpdate,
};
pub use identity_map::{EntityKey, IdentityMap};
pub use tracker::{EntityState, InstanceId, StateTracker};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};

use asupersync::{Cx, Outcome};
use relmap_core::entity::AssociationValue;
use relmap_core::{
    AnyEntity, AssociationKind, AssociationMeta, ChangeSet, ChangeTrackingPolicy, Criteria, Entity,
    EntityDescriptor, EntityPersister, EntityRecord, EntityRef, Error, IdGeneration,
    IdentifierError, IdentifierErrorKind, LockMode, OptimisticLockError, Ref, Reference,
    ReferenceLoader, Result, Value, entity_addr,
};

type WeakEntityRef = Weak<parking_lot::RwLock<dyn AnyEntity>>;

// ============================================================================
// Session events
// ============================================================================

/// Type alias for session event callbacks.
///
/// Callbacks receive no arguments and return `Result<()>`. Returning `Err`
/// from a pre-execution event aborts the flush without closing the
/// session.
type SessionEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before change-set computation; last chance to mutate entities.
    PreFlush,
    /// Fired after change sets are computed, before execution.
    OnFlush,
    /// Fired after post-commit synchronization, before the transaction
    /// commits.
    PostFlush,
    /// Fired after the transaction committed.
    PostCommit,
    /// Fired after a rollback.
    PostRollback,
}

/// Holds registered session-level event callbacks.
#[derive(Default)]
pub struct SessionEventCallbacks {
    pre_flush: Vec<SessionEventFn>,
    on_flush: Vec<SessionEventFn>,
    post_flush: Vec<SessionEventFn>,
    post_commit: Vec<SessionEventFn>,
    post_rollback: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("pre_flush", &self.pre_flush.len())
            .field("on_flush", &self.on_flush.len())
            .field("post_flush", &self.post_flush.len())
            .field("post_commit", &self.post_commit.len())
            .field("post_rollback", &self.post_rollback.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    fn fire(&mut self, event: SessionEvent) -> Result<()> {
        let callbacks = match event {
            SessionEvent::PreFlush => &mut self.pre_flush,
            SessionEvent::OnFlush => &mut self.on_flush,
            SessionEvent::PostFlush => &mut self.post_flush,
            SessionEvent::PostCommit => &mut self.post_commit,
            SessionEvent::PostRollback => &mut self.post_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Open a transaction at flush time when none is active. With this
    /// disabled, flushing outside a transaction fails with the
    /// transaction-required error.
    pub auto_begin: bool,
    /// Consult the second-level cache (when one is attached).
    pub cache_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_begin: true,
            cache_enabled: true,
        }
    }
}

/// Count of pending scheduled operations by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PendingCounts {
    /// Instances scheduled for INSERT.
    pub insertions: usize,
    /// Instances explicitly marked or notified dirty. Implicitly tracked
    /// changes only surface at flush time.
    pub updates: usize,
    /// Instances scheduled for DELETE.
    pub deletions: usize,
}

impl PendingCounts {
    /// Total scheduled operations.
    #[must_use]
    pub fn total(&self) -> usize {
        self.insertions + self.updates + self.deletions
    }

    /// Whether nothing is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

// ============================================================================
// Session
// ============================================================================

/// One tracked entity instance.
struct ManagedEntity {
    entity: EntityRef,
    descriptor: &'static EntityDescriptor,
    key: Option<EntityKey>,
}

/// The persistence coordinator: identity map, state tracking, scheduling,
/// and the transactional commit protocol, driving a persister gateway.
///
/// One session serves one logical unit of work at a time. It is
/// single-threaded cooperative: identity-map mutation, change-set
/// computation, and the scheduled-operation sets are unguarded, so a
/// session must never be shared between tasks without external
/// serialization.
pub struct Session<P: EntityPersister> {
    persister: P,
    config: SessionConfig,
    identity_map: IdentityMap,
    tracker: StateTracker,
    managed: HashMap<InstanceId, ManagedEntity>,
    addr_index: HashMap<usize, InstanceId>,
    key_index: HashMap<EntityKey, InstanceId>,
    scheduled_insertions: Vec<InstanceId>,
    scheduled_deletions: Vec<InstanceId>,
    explicitly_dirty: HashSet<InstanceId>,
    recorded_changes: HashMap<InstanceId, ChangeSet>,
    detached: HashMap<usize, WeakEntityRef>,
    cache: Option<SecondLevelCache>,
    events: SessionEventCallbacks,
    closed: bool,
    flushing: bool,
    next_instance: InstanceId,
}

impl<P: EntityPersister> Session<P> {
    /// Create a session over a persister gateway.
    pub fn new(persister: P) -> Self {
        Self::with_config(persister, SessionConfig::default())
    }

    /// Create a session with custom configuration.
    pub fn with_config(persister: P, config: SessionConfig) -> Self {
        Self {
            persister,
            config,
            identity_map: IdentityMap::new(),
            tracker: StateTracker::new(),
            managed: HashMap::new(),
            addr_index: HashMap::new(),
            key_index: HashMap::new(),
            scheduled_insertions: Vec::new(),
            scheduled_deletions: Vec::new(),
            explicitly_dirty: HashSet::new(),
            recorded_changes: HashMap::new(),
            detached: HashMap::new(),
            cache: None,
            events: SessionEventCallbacks::default(),
            closed: false,
            flushing: false,
            next_instance: 1,
        }
    }

    /// The underlying persister gateway.
    pub fn persister(&self) -> &P {
        &self.persister
    }

    /// The session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether the session closed after a failed commit.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Attach a second-level cache.
    pub fn enable_cache(&mut self, cache: SecondLevelCache) {
        self.cache = Some(cache);
    }

    /// The attached second-level cache, if any.
    pub fn second_level_cache(&self) -> Option<&SecondLevelCache> {
        self.cache.as_ref()
    }

    /// Mutable access to the attached second-level cache.
    pub fn second_level_cache_mut(&mut self) -> Option<&mut SecondLevelCache> {
        self.cache.as_mut()
    }

    fn cache_active(&self) -> bool {
        self.config.cache_enabled && self.cache.is_some()
    }

    // ========================================================================
    // Session events
    // ========================================================================

    /// Register a callback fired before change-set computation. Returning
    /// `Err` aborts the flush without closing the session.
    pub fn on_pre_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.pre_flush.push(Box::new(f));
    }

    /// Register a callback fired after change-set computation, before
    /// execution.
    pub fn on_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.on_flush.push(Box::new(f));
    }

    /// Register a callback fired after post-commit synchronization.
    pub fn on_post_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.post_flush.push(Box::new(f));
    }

    /// Register a callback fired after the transaction committed.
    pub fn on_post_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.post_commit.push(Box::new(f));
    }

    /// Register a callback fired after a rollback.
    pub fn on_post_rollback(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.post_rollback.push(Box::new(f));
    }

    // ========================================================================
    // Scheduling (in-memory, no storage access)
    // ========================================================================

    /// Schedule a NEW entity for insertion and cascade to associations
    /// configured with the persist cascade.
    ///
    /// Persisting an already-managed instance is a no-op (the cascade
    /// still runs); persisting a REMOVED instance revives it; persisting a
    /// DETACHED instance fails.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = M::descriptor().entity_name))]
    pub fn persist<M: Entity>(&mut self, entity: &Ref<M>) -> Result<()> {
        self.ensure_open()?;
        let mut visited = HashSet::new();
        self.persist_entity(entity.shared(), &mut visited)
    }

    /// Persist every entity in the iterator.
    pub fn persist_all<'a, M, I>(&mut self, entities: I) -> Result<()>
    where
        M: Entity + 'a,
        I: IntoIterator<Item = &'a Ref<M>>,
    {
        for entity in entities {
            self.persist(entity)?;
        }
        Ok(())
    }

    /// Schedule a MANAGED entity for deletion and cascade to associations
    /// configured with the remove cascade.
    ///
    /// Removing a NEW entity simply unschedules it; it never reached
    /// storage.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = M::descriptor().entity_name))]
    pub fn remove<M: Entity>(&mut self, entity: &Ref<M>) -> Result<()> {
        self.ensure_open()?;
        let mut visited = HashSet::new();
        self.remove_entity(entity.shared(), &mut visited)
    }

    /// Detach an entity (and cascade-detach targets) from the session.
    /// Detached instances are no longer synchronized; `persist` rejects
    /// them.
    pub fn detach<M: Entity>(&mut self, entity: &Ref<M>) -> Result<()> {
        self.ensure_open()?;
        let mut visited = HashSet::new();
        self.detach_entity(entity.shared(), &mut visited);
        Ok(())
    }

    /// Detach every tracked entity. Used by memory-bounded batch loops;
    /// a subsequent `find` for a previously-loaded identity reads storage
    /// again.
    pub fn clear(&mut self) {
        for (_, managed) in self.managed.drain() {
            self.detached
                .insert(entity_addr(&managed.entity), Arc::downgrade(&managed.entity));
        }
        self.addr_index.clear();
        self.key_index.clear();
        self.identity_map.clear();
        self.tracker.clear();
        self.scheduled_insertions.clear();
        self.scheduled_deletions.clear();
        self.explicitly_dirty.clear();
        self.recorded_changes.clear();
        tracing::debug!("session cleared; all entities detached");
    }

    /// Whether the instance is currently tracked (NEW or MANAGED).
    pub fn contains<M: Entity>(&self, entity: &Ref<M>) -> bool {
        let shared = entity.shared();
        match self.instance_of(&shared) {
            Some(instance) => matches!(
                self.tracker.state(instance),
                Some(EntityState::New | EntityState::Managed)
            ),
            None => false,
        }
    }

    /// The lifecycle state of the instance, if the session knows it.
    pub fn state_of<M: Entity>(&self, entity: &Ref<M>) -> Option<EntityState> {
        let shared = entity.shared();
        if let Some(instance) = self.instance_of(&shared) {
            return self.tracker.state(instance);
        }
        let addr = entity_addr(&shared);
        match self.detached.get(&addr) {
            Some(weak) if weak.upgrade().is_some_and(|alive| Arc::ptr_eq(&alive, &shared)) => {
                Some(EntityState::Detached)
            }
            _ => None,
        }
    }

    /// Mark a MANAGED instance dirty. Required for classes with the
    /// deferred-explicit tracking policy; harmless otherwise.
    pub fn mark_dirty<M: Entity>(&mut self, entity: &Ref<M>) -> Result<()> {
        self.ensure_open()?;
        let shared = entity.shared();
        let Some(instance) = self.instance_of(&shared) else {
            return Err(Error::invalid_argument(
                "cannot mark an untracked entity dirty",
            ));
        };
        if self.tracker.state(instance) == Some(EntityState::Managed) {
            self.explicitly_dirty.insert(instance);
        }
        Ok(())
    }

    /// Record a field change for a class with the notify tracking policy.
    pub fn record_change<M: Entity>(
        &mut self,
        entity: &Ref<M>,
        field: &'static str,
        old: Value,
        new: Value,
    ) -> Result<()> {
        self.ensure_open()?;
        let shared = entity.shared();
        let Some(instance) = self.instance_of(&shared) else {
            return Err(Error::invalid_argument(
                "cannot record changes for an untracked entity",
            ));
        };
        let mut change = ChangeSet::new();
        change.push(field, old, new);
        self.recorded_changes
            .entry(instance)
            .or_default()
            .merge(change);
        Ok(())
    }

    /// Counts of scheduled operations.
    pub fn pending_counts(&self) -> PendingCounts {
        PendingCounts {
            insertions: self.scheduled_insertions.len(),
            updates: self.explicitly_dirty.len() + self.recorded_changes.len(),
            deletions: self.scheduled_deletions.len(),
        }
    }

    /// Number of tracked instances.
    #[must_use]
    pub fn managed_count(&self) -> usize {
        self.managed.len()
    }

    /// Whether the instance has pending changes: NEW, REMOVED, or MANAGED
    /// with a non-empty change set against its snapshot.
    pub fn is_modified<M: Entity>(&self, entity: &Ref<M>) -> bool {
        let shared = entity.shared();
        let Some(instance) = self.instance_of(&shared) else {
            return false;
        };
        match self.tracker.state(instance) {
            Some(EntityState::New | EntityState::Removed) => true,
            Some(EntityState::Managed) => !self.change_set_for(instance).is_empty(),
            _ => false,
        }
    }

    /// The names of fields that changed since the last synchronization.
    pub fn modified_fields<M: Entity>(&self, entity: &Ref<M>) -> Vec<&'static str> {
        let shared = entity.shared();
        let Some(instance) = self.instance_of(&shared) else {
            return Vec::new();
        };
        if self.tracker.state(instance) != Some(EntityState::Managed) {
            return Vec::new();
        }
        self.change_set_for(instance).field_names()
    }

    /// The tracked optimistic-lock version of the instance.
    pub fn tracked_version<M: Entity>(&self, entity: &Ref<M>) -> Option<Value> {
        let shared = entity.shared();
        let instance = self.instance_of(&shared)?;
        self.tracker.version(instance).cloned()
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Find by single-field identifier.
    pub async fn find<M: Entity>(
        &mut self,
        cx: &Cx,
        id: impl Into<Value>,
    ) -> Outcome<Option<Ref<M>>, Error> {
        self.find_with::<M>(cx, &[id.into()], LockMode::None, None)
            .await
    }

    /// Find by named identifier fields; validates the names against the
    /// descriptor and orders the values.
    pub async fn find_by_identity<M: Entity>(
        &mut self,
        cx: &Cx,
        fields: &[(&str, Value)],
    ) -> Outcome<Option<Ref<M>>, Error> {
        let descriptor = M::descriptor();

        let unrecognized: Vec<String> = fields
            .iter()
            .filter(|(name, _)| !descriptor.identifier.iter().any(|id| id == name))
            .map(|(name, _)| (*name).to_string())
            .collect();
        if !unrecognized.is_empty() {
            return Outcome::Err(Error::Identifier(IdentifierError {
                kind: IdentifierErrorKind::UnrecognizedFields,
                entity: descriptor.entity_name,
                fields: unrecognized,
            }));
        }

        let mut identity = Vec::with_capacity(descriptor.identifier.len());
        let mut missing = Vec::new();
        for id_field in descriptor.identifier {
            match fields.iter().find(|(name, _)| name == id_field) {
                Some((_, value)) => identity.push(value.clone()),
                None => missing.push((*id_field).to_string()),
            }
        }
        if !missing.is_empty() {
            return Outcome::Err(Error::Identifier(IdentifierError {
                kind: IdentifierErrorKind::MissingFields,
                entity: descriptor.entity_name,
                fields: missing,
            }));
        }

        self.find_with::<M>(cx, &identity, LockMode::None, None)
            .await
    }

    /// Find by identity with an explicit lock mode and, for
    /// [`LockMode::Optimistic`], an expected version.
    #[tracing::instrument(level = "debug", skip(self, cx, identity), fields(entity = M::descriptor().entity_name))]
    pub async fn find_with<M: Entity>(
        &mut self,
        cx: &Cx,
        identity: &[Value],
        lock: LockMode,
        expected_version: Option<Value>,
    ) -> Outcome<Option<Ref<M>>, Error> {
        if self.closed {
            return Outcome::Err(Error::Closed);
        }
        let descriptor = M::descriptor();
        if let Err(e) = descriptor.validate() {
            return Outcome::Err(e);
        }
        if let Err(e) = validate_identity_arity(descriptor, identity) {
            return Outcome::Err(e);
        }
        if lock.is_pessimistic() && !self.persister.in_transaction() {
            return Outcome::Err(Error::TransactionRequired(
                "pessimistic locks require an open transaction".to_string(),
            ));
        }

        let key = EntityKey::new(descriptor.root_entity, identity);

        // Identity map first.
        if let Some(shared) = self.identity_map.get(&key) {
            if let Some(instance) = self.instance_of(&shared) {
                if self.tracker.state(instance) == Some(EntityState::Removed) {
                    return Outcome::Ok(None);
                }
                let Some(typed) = Ref::from_shared(&shared) else {
                    return Outcome::Err(Error::invalid_argument(format!(
                        "identity is registered with a different entity type than {}",
                        descriptor.entity_name
                    )));
                };
                if lock == LockMode::Optimistic {
                    if let Err(e) =
                        self.check_optimistic(instance, descriptor, expected_version.as_ref())
                    {
                        return Outcome::Err(e);
                    }
                }
                if lock.is_pessimistic() {
                    // Acquire the row lock even though the instance is
                    // already in memory.
                    match self.persister.load(cx, descriptor, identity, lock).await {
                        Outcome::Ok(Some(_)) => {}
                        Outcome::Ok(None) => return Outcome::Ok(None),
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                }
                return Outcome::Ok(Some(typed));
            }
        }

        // Second-level cache for plain reads.
        if lock == LockMode::None && self.cache_active() {
            let cached = self
                .cache
                .as_mut()
                .and_then(|c| c.get(descriptor.root_entity, key.id_hash()));
            if let Some(cached) = cached {
                tracing::trace!(entity = descriptor.entity_name, "second-level cache hit");
                return match self.manage_loaded::<M>(key, &cached.record) {
                    Ok((typed, _)) => Outcome::Ok(Some(typed)),
                    Err(e) => Outcome::Err(e),
                };
            }
        }

        // Storage.
        match self.persister.load(cx, descriptor, identity, lock).await {
            Outcome::Ok(Some(record)) => {
                if lock == LockMode::None && self.cache_active() {
                    let version = descriptor
                        .version_field
                        .and_then(|field| record.get(field).cloned());
                    if let Some(cache) = self.cache.as_mut() {
                        let _ = cache.put(
                            descriptor.root_entity,
                            key.id_hash(),
                            CachedEntity {
                                record: record.clone(),
                                version,
                            },
                        );
                    }
                }
                match self.manage_loaded::<M>(key, &record) {
                    Ok((typed, instance)) => {
                        if lock == LockMode::Optimistic {
                            if let Err(e) = self.check_optimistic(
                                instance,
                                descriptor,
                                expected_version.as_ref(),
                            ) {
                                return Outcome::Err(e);
                            }
                        }
                        Outcome::Ok(Some(typed))
                    }
                    Err(e) => Outcome::Err(e),
                }
            }
            Outcome::Ok(None) => Outcome::Ok(None),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Find every entity matching the criteria, reconciling rows against
    /// the identity map (an already-managed instance wins over hydration).
    pub async fn find_by<M: Entity>(
        &mut self,
        cx: &Cx,
        criteria: &Criteria,
    ) -> Outcome<Vec<Ref<M>>, Error> {
        if self.closed {
            return Outcome::Err(Error::Closed);
        }
        let descriptor = M::descriptor();

        // Query-result cache: a hit yields identifier tuples to resolve
        // through the regular find path (identity map / entity cache /
        // storage).
        if self.cache_active() {
            let cached_ids = self
                .cache
                .as_ref()
                .and_then(|c| c.get_query(descriptor.root_entity, criteria.cache_key()))
                .cloned();
            if let Some(identities) = cached_ids {
                let mut out = Vec::with_capacity(identities.len());
                for identity in identities {
                    match self
                        .find_with::<M>(cx, &identity, LockMode::None, None)
                        .await
                    {
                        Outcome::Ok(Some(entity)) => out.push(entity),
                        Outcome::Ok(None) => {}
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                }
                return Outcome::Ok(out);
            }
        }

        match self
            .persister
            .load_by_criteria(cx, descriptor, criteria)
            .await
        {
            Outcome::Ok(records) => {
                let mut out = Vec::with_capacity(records.len());
                let mut identities = Vec::with_capacity(records.len());
                for record in records {
                    let identity: Vec<Value> = descriptor
                        .identifier
                        .iter()
                        .map(|field| record.get(field).cloned().unwrap_or(Value::Null))
                        .collect();
                    let key = EntityKey::new(descriptor.root_entity, &identity);
                    identities.push(identity);

                    if let Some(existing) = self.identity_map.get(&key) {
                        match Ref::from_shared(&existing) {
                            Some(typed) => out.push(typed),
                            None => {
                                return Outcome::Err(Error::invalid_argument(format!(
                                    "identity is registered with a different entity type than {}",
                                    descriptor.entity_name
                                )));
                            }
                        }
                        continue;
                    }

                    match self.manage_loaded::<M>(key, &record) {
                        Ok((typed, _)) => {
                            if self.cache_active() {
                                let version = descriptor
                                    .version_field
                                    .and_then(|field| record.get(field).cloned());
                                if let Some(cache) = self.cache.as_mut() {
                                    let _ = cache.put(
                                        descriptor.root_entity,
                                        key.id_hash(),
                                        CachedEntity { record, version },
                                    );
                                }
                            }
                            out.push(typed);
                        }
                        Err(e) => return Outcome::Err(e),
                    }
                }

                if self.cache_active() {
                    if let Some(cache) = self.cache.as_mut() {
                        cache.put_query(descriptor.root_entity, criteria.cache_key(), identities);
                    }
                }
                Outcome::Ok(out)
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Count entities matching the criteria.
    pub async fn count<M: Entity>(&mut self, cx: &Cx, criteria: &Criteria) -> Outcome<u64, Error> {
        if self.closed {
            return Outcome::Err(Error::Closed);
        }
        self.persister.count(cx, M::descriptor(), criteria).await
    }

    /// Get an uninitialized lazy reference to an identity, without a
    /// storage round-trip. Resolves through the session on first use.
    pub fn get_reference<M: Entity>(&mut self, identity: Vec<Value>) -> Result<Reference<M>> {
        self.ensure_open()?;
        let descriptor = M::descriptor();
        descriptor.validate()?;
        validate_identity_arity(descriptor, &identity)?;

        if let Some(typed) = self.identity_map.get_typed::<M>(&identity) {
            return Ok(Reference::resolved(typed));
        }
        Ok(Reference::new(identity))
    }

    // ========================================================================
    // Refresh, merge, lock
    // ========================================================================

    /// Reload a managed entity (and cascade-refresh targets) from storage,
    /// overwriting in-memory field values and snapshots.
    ///
    /// Returns `false` if the root entity's row no longer exists; the
    /// instance is then detached.
    pub async fn refresh<M: Entity>(&mut self, cx: &Cx, entity: &Ref<M>) -> Outcome<bool, Error> {
        if self.closed {
            return Outcome::Err(Error::Closed);
        }
        let root = entity.shared();
        if self.instance_of(&root).is_none() {
            return Outcome::Err(Error::invalid_argument(
                "refresh requires an entity managed by this session",
            ));
        }

        let mut queue: VecDeque<EntityRef> = VecDeque::new();
        queue.push_back(root.clone());
        let mut visited: HashSet<usize> = HashSet::new();
        let mut root_alive = true;

        while let Some(shared) = queue.pop_front() {
            let addr = entity_addr(&shared);
            if !visited.insert(addr) {
                continue;
            }
            let Some(instance) = self.instance_of(&shared) else {
                continue;
            };
            let descriptor = match self.managed.get(&instance) {
                Some(managed) => managed.descriptor,
                None => continue,
            };
            let identity = shared.read().identifier();

            match self
                .persister
                .load(cx, descriptor, &identity, LockMode::None)
                .await
            {
                Outcome::Ok(Some(record)) => {
                    apply_record(&shared, descriptor, &record);
                    self.tracker.take_snapshot(instance, record.clone());
                    if let Some(field) = descriptor.version_field {
                        if let Some(version) = record.get(field) {
                            self.tracker.set_version(instance, version.clone());
                        }
                    }
                    self.explicitly_dirty.remove(&instance);
                    self.recorded_changes.remove(&instance);

                    let cascades = cascade_targets(&shared, descriptor, |c| c.refresh);
                    queue.extend(cascades);
                }
                Outcome::Ok(None) => {
                    self.forget_instance(instance);
                    self.detached.insert(addr, Arc::downgrade(&shared));
                    if Arc::ptr_eq(&shared, &root) {
                        root_alive = false;
                    }
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        Outcome::Ok(root_alive)
    }

    /// Reconcile a detached instance's state into the managed instance
    /// with the same identity, loading it if necessary. The detached
    /// source is never attached; the returned handle is the managed one.
    pub async fn merge<M: Entity>(&mut self, cx: &Cx, detached: &M) -> Outcome<Ref<M>, Error> {
        if self.closed {
            return Outcome::Err(Error::Closed);
        }
        let descriptor = M::descriptor();
        if let Err(e) = descriptor.validate() {
            return Outcome::Err(e);
        }

        let identity = detached.identifier();
        let managed: Ref<M> = if identity.iter().any(Value::is_null) {
            // No identity: the merge degenerates to persisting a copy.
            let copy = Ref::new(detached.clone());
            if let Err(e) = self.persist(&copy) {
                return Outcome::Err(e);
            }
            copy
        } else {
            match self
                .find_with::<M>(cx, &identity, LockMode::None, None)
                .await
            {
                Outcome::Ok(Some(target)) => {
                    let shared = target.shared();
                    let Some(instance) = self.instance_of(&shared) else {
                        return Outcome::Err(Error::invalid_argument(
                            "merge target is not tracked by this session",
                        ));
                    };
                    if descriptor.is_versioned() {
                        let source_version = descriptor
                            .version_field
                            .and_then(|field| detached.field_values().get(field).cloned());
                        if let (Some(tracked), Some(source)) =
                            (self.tracker.version(instance), source_version.as_ref())
                        {
                            if !identifier_equal(tracked, source) {
                                return Outcome::Err(Error::OptimisticLock(OptimisticLockError {
                                    entity: descriptor.entity_name,
                                    identity,
                                    expected: source_version,
                                    actual: Some(tracked.clone()),
                                }));
                            }
                        }
                    }
                    copy_scalar_fields(descriptor, &detached.field_values(), &shared);
                    if descriptor.change_tracking == ChangeTrackingPolicy::DeferredExplicit {
                        self.explicitly_dirty.insert(instance);
                    }
                    target
                }
                Outcome::Ok(None) => {
                    // Identity set but no row: treat as new with an
                    // application-assigned identifier.
                    let copy = Ref::new(detached.clone());
                    if let Err(e) = self.persist(&copy) {
                        return Outcome::Err(e);
                    }
                    copy
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        };

        // Cascade-merge over the detached graph: reconcile targets whose
        // managed counterpart is loaded, persist NEW targets.
        let mut queue: VecDeque<EntityRef> = VecDeque::new();
        queue.extend(cascade_targets_of_source(detached, descriptor, |c| c.merge));
        let mut visited: HashSet<usize> = HashSet::new();

        while let Some(source) = queue.pop_front() {
            if !visited.insert(entity_addr(&source)) {
                continue;
            }
            let source_descriptor = source.read().entity_descriptor();
            let source_identity = source.read().identifier();

            if source_identity.iter().any(Value::is_null) {
                let mut persist_visited = HashSet::new();
                if let Err(e) = self.persist_entity(source.clone(), &mut persist_visited) {
                    return Outcome::Err(e);
                }
            } else if self.instance_of(&source).is_none() {
                let key = EntityKey::new(source_descriptor.root_entity, &source_identity);
                if let Some(counterpart) = self.identity_map.get(&key) {
                    let record = source.read().field_values();
                    copy_scalar_fields(source_descriptor, &record, &counterpart);
                }
                // No loaded counterpart: left untouched.
            }

            let cascades = {
                let guard = source.read();
                let mut targets = Vec::new();
                for assoc in source_descriptor.associations {
                    if !assoc.cascade.merge {
                        continue;
                    }
                    collect_targets(&guard.association(assoc.name), &mut targets);
                }
                targets
            };
            queue.extend(cascades);
        }

        Outcome::Ok(managed)
    }

    /// Lock a managed entity.
    ///
    /// Pessimistic modes delegate a locking read to the persister and
    /// require an open transaction. Optimistic mode compares the expected
    /// version against the tracked version.
    pub async fn lock<M: Entity>(
        &mut self,
        cx: &Cx,
        entity: &Ref<M>,
        mode: LockMode,
        expected_version: Option<Value>,
    ) -> Outcome<(), Error> {
        if self.closed {
            return Outcome::Err(Error::Closed);
        }
        let shared = entity.shared();
        let Some(instance) = self.instance_of(&shared) else {
            return Outcome::Err(Error::invalid_argument(
                "lock requires an entity managed by this session",
            ));
        };
        let descriptor = match self.managed.get(&instance) {
            Some(managed) => managed.descriptor,
            None => return Outcome::Err(Error::invalid_argument("entity is not tracked")),
        };

        match mode {
            LockMode::None => Outcome::Ok(()),
            LockMode::Optimistic => {
                match self.check_optimistic(instance, descriptor, expected_version.as_ref()) {
                    Ok(()) => Outcome::Ok(()),
                    Err(e) => Outcome::Err(e),
                }
            }
            LockMode::PessimisticRead | LockMode::PessimisticWrite => {
                if !self.persister.in_transaction() {
                    return Outcome::Err(Error::TransactionRequired(
                        "pessimistic locks require an open transaction".to_string(),
                    ));
                }
                let identity = shared.read().identifier();
                match self.persister.load(cx, descriptor, &identity, mode).await {
                    Outcome::Ok(Some(_)) => Outcome::Ok(()),
                    Outcome::Ok(None) => Outcome::Err(Error::invalid_argument(format!(
                        "cannot lock {}: the row no longer exists",
                        descriptor.entity_name
                    ))),
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            }
        }
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Open a transaction. A no-op when one is already open.
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.closed {
            return Outcome::Err(Error::Closed);
        }
        if self.persister.in_transaction() {
            return Outcome::Ok(());
        }
        self.persister.begin(cx).await
    }

    /// Flush pending work and commit the open transaction.
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        match self.flush(cx).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if self.persister.in_transaction() {
            match self.persister.commit(cx).await {
                Outcome::Ok(()) => {
                    if let Err(e) = self.events.fire(SessionEvent::PostCommit) {
                        return Outcome::Err(e);
                    }
                }
                Outcome::Err(e) => return Outcome::Err(self.abort_commit(cx, e).await),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(())
    }

    /// Roll back the open transaction. Tracked state is left as-is; per
    /// the retry policy, callers re-fetch entities after a rollback.
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.persister.in_transaction() {
            match self.persister.rollback(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        if let Err(e) = self.events.fire(SessionEvent::PostRollback) {
            return Outcome::Err(e);
        }
        Outcome::Ok(())
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Execute the commit protocol for every scheduled operation.
    ///
    /// One transaction per flush: opened here (with `auto_begin`) and
    /// committed here unless the caller opened one explicitly, in which
    /// case it stays open for [`Session::commit`]. A storage failure rolls
    /// the transaction back, closes the session, and surfaces as a
    /// commit-failure error — or as the optimistic-lock error when a
    /// versioned statement affected zero rows.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushStats, Error> {
        if self.closed {
            return Outcome::Err(Error::Closed);
        }
        if self.flushing {
            return Outcome::Err(Error::invalid_argument(
                "a flush is already in progress for this session",
            ));
        }
        self.flushing = true;
        let outcome = self.flush_inner(cx, None).await;
        self.flushing = false;
        outcome
    }

    /// Flush only the operations reachable from one entity through its
    /// associations, still inside a single transaction. Everything else
    /// stays scheduled.
    pub async fn flush_entity<M: Entity>(
        &mut self,
        cx: &Cx,
        entity: &Ref<M>,
    ) -> Outcome<FlushStats, Error> {
        if self.closed {
            return Outcome::Err(Error::Closed);
        }
        if self.flushing {
            return Outcome::Err(Error::invalid_argument(
                "a flush is already in progress for this session",
            ));
        }
        self.flushing = true;
        let scope = self.reachable_from(entity.shared());
        let outcome = self.flush_inner(cx, Some(scope)).await;
        self.flushing = false;
        outcome
    }

    async fn flush_inner(
        &mut self,
        cx: &Cx,
        scope: Option<HashSet<InstanceId>>,
    ) -> Outcome<FlushStats, Error> {
        if let Err(e) = self.events.fire(SessionEvent::PreFlush) {
            return Outcome::Err(e);
        }

        let plan = match self.compute_commit_plan(scope.as_ref()) {
            Ok(plan) => plan,
            Err(e) => return Outcome::Err(e),
        };

        if let Err(e) = self.events.fire(SessionEvent::OnFlush) {
            return Outcome::Err(e);
        }

        if plan.is_empty() {
            if let Err(e) = self.events.fire(SessionEvent::PostFlush) {
                return Outcome::Err(e);
            }
            return Outcome::Ok(FlushStats::default());
        }

        let began_here = if self.persister.in_transaction() {
            false
        } else {
            if !self.config.auto_begin {
                return Outcome::Err(Error::TransactionRequired(
                    "flush requires an open transaction when auto_begin is disabled".to_string(),
                ));
            }
            match self.persister.begin(cx).await {
                Outcome::Ok(()) => true,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        };

        self.lock_cache_entries(&plan);

        let stats = match self.execute_plan(cx, &plan).await {
            Outcome::Ok(stats) => stats,
            Outcome::Err(e) => return Outcome::Err(self.abort_commit(cx, e).await),
            Outcome::Cancelled(r) => {
                // A commit cancelled mid-plan is torn state: roll back and
                // close, then propagate the cancellation.
                let _ = self.abort_commit(cx, Error::persister("flush cancelled")).await;
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                let _ = self
                    .abort_commit(cx, Error::persister("flush panicked"))
                    .await;
                return Outcome::Panicked(p);
            }
        };

        self.synchronize_after_commit(&plan);

        if let Err(e) = self.events.fire(SessionEvent::PostFlush) {
            return Outcome::Err(self.abort_commit(cx, e).await);
        }

        if began_here {
            match self.persister.commit(cx).await {
                Outcome::Ok(()) => {
                    if let Err(e) = self.events.fire(SessionEvent::PostCommit) {
                        return Outcome::Err(e);
                    }
                }
                Outcome::Err(e) => return Outcome::Err(self.abort_commit(cx, e).await),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        Outcome::Ok(stats)
    }

    /// Roll back, close the session, fire the rollback event, and shape
    /// the error to surface to the caller.
    async fn abort_commit(&mut self, cx: &Cx, cause: Error) -> Error {
        if self.persister.in_transaction() {
            if let Outcome::Err(e) = self.persister.rollback(cx).await {
                tracing::warn!(error = %e, "rollback after failed flush also failed");
            }
        }
        self.closed = true;
        let _ = self.events.fire(SessionEvent::PostRollback);
        tracing::warn!(error = %cause, "flush aborted; session closed");
        if cause.is_optimistic_lock() {
            cause
        } else {
            Error::commit_failure("transaction rolled back and session closed", cause)
        }
    }

    // ========================================================================
    // Plan computation
    // ========================================================================

    fn compute_commit_plan(&mut self, scope: Option<&HashSet<InstanceId>>) -> Result<CommitPlan> {
        self.discover_reachable_work()?;

        let in_scope =
            |instance: InstanceId| scope.is_none_or(|s| s.contains(&instance));

        let mut plan = CommitPlan::new();
        self.collect_collection_ops(&mut plan, &in_scope)?;

        for (seq, instance) in self.scheduled_insertions.iter().enumerate() {
            if !in_scope(*instance) {
                continue;
            }
            let Some(managed) = self.managed.get(instance) else {
                continue;
            };
            plan.inserts.push(ScheduledInsert {
                instance: *instance,
                descriptor: managed.descriptor,
                seq,
            });
        }

        for instance in self.tracker.instances_in_state(EntityState::Managed) {
            if !in_scope(instance) {
                continue;
            }
            let changes = self.change_set_for(instance);
            if changes.is_empty() {
                continue;
            }
            let Some(managed) = self.managed.get(&instance) else {
                continue;
            };
            let descriptor = managed.descriptor;
            if let Some(cache) = &self.cache {
                if self.config.cache_enabled
                    && cache.strategy(descriptor.root_entity) == ConcurrencyStrategy::ReadOnly
                {
                    return Err(Error::invalid_argument(format!(
                        "cannot update {}: its cache region is read-only",
                        descriptor.entity_name
                    )));
                }
            }
            plan.updates.push(ScheduledUpdate {
                instance,
                descriptor,
                changes,
            });
        }

        for (seq, instance) in self.scheduled_deletions.iter().enumerate() {
            if !in_scope(*instance) {
                continue;
            }
            let Some(managed) = self.managed.get(instance) else {
                continue;
            };
            plan.deletes.push(ScheduledDelete {
                instance: *instance,
                descriptor: managed.descriptor,
                seq,
            });
        }

        let mut calculator = CommitOrderCalculator::new();
        for op in &plan.inserts {
            calculator.add_class(op.descriptor);
        }
        for op in &plan.deletes {
            calculator.add_class(op.descriptor);
        }
        let order = calculator.calculate();
        plan.apply_commit_order(&order);

        for deferred in order.deferred() {
            for insert in plan
                .inserts
                .iter()
                .filter(|op| op.descriptor.entity_name == deferred.entity)
            {
                plan.deferred_updates.push(DeferredFkUpdate {
                    instance: insert.instance,
                    descriptor: insert.descriptor,
                    association: deferred.association,
                    join_column: deferred.join_column,
                });
            }
        }

        Ok(plan)
    }

    /// Walk every tracked entity's associations: cascade-persist NEW
    /// targets where configured, and fail on NEW targets reachable through
    /// uncascaded associations. Repeats until no new instance appears.
    fn discover_reachable_work(&mut self) -> Result<()> {
        let mut processed: HashSet<InstanceId> = HashSet::new();
        loop {
            let mut pending: Vec<InstanceId> = Vec::new();
            for state in [EntityState::New, EntityState::Managed] {
                for instance in self.tracker.instances_in_state(state) {
                    if !processed.contains(&instance) {
                        pending.push(instance);
                    }
                }
            }
            if pending.is_empty() {
                return Ok(());
            }
            pending.sort_unstable();

            for instance in pending {
                processed.insert(instance);
                let Some(managed) = self.managed.get(&instance) else {
                    continue;
                };
                let entity = managed.entity.clone();
                let descriptor = managed.descriptor;

                let snapshots: Vec<(&'static AssociationMeta, AssociationValue)> = {
                    let guard = entity.read();
                    descriptor
                        .associations
                        .iter()
                        .map(|assoc| (assoc, guard.association(assoc.name)))
                        .collect()
                };

                for (assoc, snapshot) in snapshots {
                    match snapshot {
                        AssociationValue::One(target) => {
                            self.ensure_flushable_target(descriptor, assoc, target)?;
                        }
                        AssociationValue::Many(collection) => {
                            for item in collection.items.iter().chain(collection.inserted.iter())
                            {
                                self.ensure_flushable_target(descriptor, assoc, item.clone())?;
                            }
                        }
                        AssociationValue::Reference(_) | AssociationValue::Absent => {}
                    }
                }
            }
        }
    }

    /// Validate one association target discovered during flush: schedule
    /// it when the cascade allows, reject NEW-and-uncascaded targets.
    fn ensure_flushable_target(
        &mut self,
        owner: &'static EntityDescriptor,
        assoc: &'static AssociationMeta,
        target: EntityRef,
    ) -> Result<()> {
        if self.instance_of(&target).is_some() {
            return Ok(());
        }
        let identity = target.read().identifier();
        if identity.iter().any(Value::is_null) {
            if assoc.cascade.persist {
                let mut visited = HashSet::new();
                return self.persist_entity(target, &mut visited);
            }
            return Err(Error::uncascaded_new_entity(owner.entity_name, assoc.name));
        }
        // A target with a full identity is an existing row referenced by
        // identity only; its FK value is usable without scheduling.
        Ok(())
    }

    /// Collect junction-table operations and orphan removals from the
    /// collection diffs of tracked entities.
    fn collect_collection_ops(
        &mut self,
        plan: &mut CommitPlan,
        in_scope: &impl Fn(InstanceId) -> bool,
    ) -> Result<()> {
        let mut orphans: Vec<EntityRef> = Vec::new();
        let mut owners: Vec<InstanceId> = Vec::new();
        for state in [EntityState::New, EntityState::Managed] {
            owners.extend(self.tracker.instances_in_state(state));
        }
        owners.sort_unstable();

        for instance in owners {
            if !in_scope(instance) {
                continue;
            }
            let Some(managed) = self.managed.get(&instance) else {
                continue;
            };
            let entity = managed.entity.clone();
            let descriptor = managed.descriptor;

            for assoc in descriptor.associations {
                if !assoc.kind.is_to_many() {
                    continue;
                }
                let snapshot = { entity.read().association(assoc.name) };
                let AssociationValue::Many(collection) = snapshot else {
                    continue;
                };

                if !collection.inserted.is_empty() || !collection.removed.is_empty() {
                    plan.collection_owners.push(instance);
                }

                if assoc.orphan_removal {
                    orphans.extend(collection.removed.iter().cloned());
                }

                if assoc.kind == AssociationKind::ManyToMany && assoc.owning {
                    if let Some(junction) = assoc.junction {
                        for target in &collection.inserted {
                            plan.links.push(JunctionOp::Link {
                                junction,
                                owner: instance,
                                target: target.clone(),
                            });
                        }
                        for target in &collection.removed {
                            plan.unlinks.push(JunctionOp::Unlink {
                                junction,
                                owner: instance,
                                target: target.clone(),
                            });
                        }
                    }
                }
            }
        }

        for orphan in orphans {
            if let Some(instance) = self.instance_of(&orphan) {
                if self.tracker.state(instance) == Some(EntityState::Managed) {
                    let mut visited = HashSet::new();
                    self.remove_entity(orphan, &mut visited)?;
                }
            }
        }
        Ok(())
    }

    /// The change set an instance would flush right now.
    fn change_set_for(&self, instance: InstanceId) -> ChangeSet {
        let Some(managed) = self.managed.get(&instance) else {
            return ChangeSet::new();
        };
        let descriptor = managed.descriptor;
        let current = current_record_of(&managed.entity);
        let ctx = match descriptor.change_tracking {
            ChangeTrackingPolicy::DeferredImplicit => DirtyContext::Implicit,
            ChangeTrackingPolicy::DeferredExplicit => DirtyContext::Explicit {
                marked: self.explicitly_dirty.contains(&instance),
            },
            ChangeTrackingPolicy::Notify => DirtyContext::Notify {
                recorded: self.recorded_changes.get(&instance),
            },
        };
        compute_change_set(descriptor, &current, self.tracker.original_data(instance), ctx)
    }

    // ========================================================================
    // Plan execution
    // ========================================================================

    async fn execute_plan(&mut self, cx: &Cx, plan: &CommitPlan) -> Outcome<FlushStats, Error> {
        let start = std::time::Instant::now();
        tracing::info!(
            inserts = plan.inserts.len(),
            updates = plan.updates.len(),
            deletes = plan.deletes.len(),
            junction_ops = plan.links.len() + plan.unlinks.len(),
            "executing commit plan"
        );
        let mut stats = FlushStats::default();

        for op in &plan.inserts {
            let Some(managed) = self.managed.get(&op.instance) else {
                continue;
            };
            let entity = managed.entity.clone();
            let mut record = current_record_of(&entity);
            for deferred in plan
                .deferred_updates
                .iter()
                .filter(|d| d.instance == op.instance)
            {
                record.set(deferred.join_column, Value::Null);
            }

            match self.persister.insert(cx, op.descriptor, &record).await {
                Outcome::Ok(result) => {
                    if op.descriptor.id_generation == IdGeneration::Storage {
                        if let Some(id) = result.generated_id {
                            let field = op.descriptor.identifier[0];
                            entity.write().set_field(field, id);
                        }
                    }
                    stats.inserted += 1;
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        for deferred in &plan.deferred_updates {
            let Some(managed) = self.managed.get(&deferred.instance) else {
                continue;
            };
            let entity = managed.entity.clone();
            let snapshot = { entity.read().association(deferred.association) };
            let value = match snapshot {
                AssociationValue::One(target) => {
                    target.read().identifier().into_iter().next().unwrap_or(Value::Null)
                }
                AssociationValue::Reference(identity) => {
                    identity.into_iter().next().unwrap_or(Value::Null)
                }
                _ => Value::Null,
            };
            if value.is_null() {
                continue;
            }
            let identity = entity.read().identifier();
            let mut changes = ChangeSet::new();
            changes.push(deferred.join_column, Value::Null, value);

            match self
                .persister
                .update(cx, deferred.descriptor, &identity, &changes, None)
                .await
            {
                Outcome::Ok(_) => stats.updated += 1,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        for op in &plan.updates {
            let Some(managed) = self.managed.get(&op.instance) else {
                continue;
            };
            let entity = managed.entity.clone();
            let identity = entity.read().identifier();
            let expected = if op.descriptor.is_versioned() {
                self.tracker.version(op.instance).cloned()
            } else {
                None
            };

            match self
                .persister
                .update(cx, op.descriptor, &identity, &op.changes, expected.as_ref())
                .await
            {
                Outcome::Ok(rows) => {
                    if rows == 0 && op.descriptor.is_versioned() {
                        return Outcome::Err(Error::OptimisticLock(OptimisticLockError {
                            entity: op.descriptor.entity_name,
                            identity,
                            expected,
                            actual: None,
                        }));
                    }
                    stats.updated += 1;
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        for op in &plan.unlinks {
            match self.execute_junction(cx, op).await {
                Outcome::Ok(rows) => stats.junction_rows += rows as usize,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        for op in &plan.deletes {
            let Some(managed) = self.managed.get(&op.instance) else {
                continue;
            };
            let entity = managed.entity.clone();
            let identity = entity.read().identifier();
            let expected = if op.descriptor.is_versioned() {
                self.tracker.version(op.instance).cloned()
            } else {
                None
            };

            match self
                .persister
                .delete(cx, op.descriptor, &identity, expected.as_ref())
                .await
            {
                Outcome::Ok(rows) => {
                    if rows == 0 && op.descriptor.is_versioned() {
                        return Outcome::Err(Error::OptimisticLock(OptimisticLockError {
                            entity: op.descriptor.entity_name,
                            identity,
                            expected,
                            actual: None,
                        }));
                    }
                    stats.deleted += 1;
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        for op in &plan.links {
            match self.execute_junction(cx, op).await {
                Outcome::Ok(rows) => stats.junction_rows += rows as usize,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            inserted = stats.inserted,
            updated = stats.updated,
            deleted = stats.deleted,
            junction_rows = stats.junction_rows,
            "commit plan executed"
        );
        Outcome::Ok(stats)
    }

    async fn execute_junction(&mut self, cx: &Cx, op: &JunctionOp) -> Outcome<u64, Error> {
        let (junction, owner, target, is_link) = match op {
            JunctionOp::Link {
                junction,
                owner,
                target,
            } => (junction, *owner, target, true),
            JunctionOp::Unlink {
                junction,
                owner,
                target,
            } => (junction, *owner, target, false),
        };

        let Some(managed) = self.managed.get(&owner) else {
            return Outcome::Ok(0);
        };
        let local = managed
            .entity
            .read()
            .identifier()
            .into_iter()
            .next()
            .unwrap_or(Value::Null);
        let remote = target
            .read()
            .identifier()
            .into_iter()
            .next()
            .unwrap_or(Value::Null);
        if local.is_null() || remote.is_null() {
            tracing::warn!(
                table = junction.table,
                "skipping junction row with an unresolved endpoint identifier"
            );
            return Outcome::Ok(0);
        }

        let outcome = if is_link {
            self.persister.link(cx, junction, &local, &remote).await
        } else {
            self.persister.unlink(cx, junction, &local, &remote).await
        };
        match outcome {
            Outcome::Ok(()) => Outcome::Ok(1),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    // ========================================================================
    // Post-commit synchronization
    // ========================================================================

    fn lock_cache_entries(&mut self, plan: &CommitPlan) {
        if !self.cache_active() {
            return;
        }
        let mut locks: Vec<(&'static str, u64)> = Vec::new();
        for (instance, descriptor) in plan
            .updates
            .iter()
            .map(|op| (op.instance, op.descriptor))
            .chain(plan.deletes.iter().map(|op| (op.instance, op.descriptor)))
        {
            if let Some(managed) = self.managed.get(&instance) {
                let identity = managed.entity.read().identifier();
                let key = EntityKey::new(descriptor.root_entity, &identity);
                locks.push((descriptor.root_entity, key.id_hash()));
            }
        }
        if let Some(cache) = self.cache.as_mut() {
            for (root, id_hash) in locks {
                cache.lock(root, id_hash);
            }
        }
    }

    fn synchronize_after_commit(&mut self, plan: &CommitPlan) {
        let mut touched_roots: HashSet<&'static str> = HashSet::new();

        for op in &plan.inserts {
            let Some(managed) = self.managed.get(&op.instance) else {
                continue;
            };
            let entity = managed.entity.clone();
            let descriptor = op.descriptor;

            if let Some(field) = descriptor.version_field {
                entity.write().set_field(field, Value::BigInt(1));
                self.tracker.set_version(op.instance, Value::BigInt(1));
            }

            self.tracker.set_state(op.instance, EntityState::Managed);
            let record = current_record_of(&entity);
            self.tracker.take_snapshot(op.instance, record.clone());

            let identity = entity.read().identifier();
            let key = EntityKey::new(descriptor.root_entity, &identity);
            let _ = self.identity_map.register(key, &entity);
            self.key_index.insert(key, op.instance);
            if let Some(managed) = self.managed.get_mut(&op.instance) {
                managed.key = Some(key);
            }

            if self.cache_active() {
                touched_roots.insert(descriptor.root_entity);
                let version = self.tracker.version(op.instance).cloned();
                if let Some(cache) = self.cache.as_mut() {
                    let _ = cache.put(
                        descriptor.root_entity,
                        key.id_hash(),
                        CachedEntity { record, version },
                    );
                }
            }
        }

        for op in &plan.updates {
            let Some(managed) = self.managed.get(&op.instance) else {
                continue;
            };
            let entity = managed.entity.clone();
            let descriptor = op.descriptor;

            if let Some(field) = descriptor.version_field {
                let next = self
                    .tracker
                    .version(op.instance)
                    .and_then(Value::as_i64)
                    .unwrap_or(0)
                    + 1;
                entity.write().set_field(field, Value::BigInt(next));
                self.tracker.set_version(op.instance, Value::BigInt(next));
            }

            let record = current_record_of(&entity);
            self.tracker.take_snapshot(op.instance, record.clone());
            self.explicitly_dirty.remove(&op.instance);
            self.recorded_changes.remove(&op.instance);

            if self.cache_active() {
                touched_roots.insert(descriptor.root_entity);
                let identity = entity.read().identifier();
                let key = EntityKey::new(descriptor.root_entity, &identity);
                let strategy = self
                    .cache
                    .as_ref()
                    .map(|c| c.strategy(descriptor.root_entity))
                    .unwrap_or_default();
                if let Some(cache) = self.cache.as_mut() {
                    match strategy {
                        ConcurrencyStrategy::ReadWrite => {
                            let version = self.tracker.version(op.instance).cloned();
                            let _ =
                                cache.put(descriptor.root_entity, key.id_hash(), CachedEntity {
                                    record,
                                    version,
                                });
                        }
                        _ => cache.evict(descriptor.root_entity, key.id_hash()),
                    }
                }
            }
        }

        for op in &plan.deletes {
            let Some(managed) = self.managed.get(&op.instance) else {
                continue;
            };
            let descriptor = op.descriptor;
            let identity = managed.entity.read().identifier();
            let key = EntityKey::new(descriptor.root_entity, &identity);

            self.forget_instance(op.instance);

            if self.cache_active() {
                touched_roots.insert(descriptor.root_entity);
                if let Some(cache) = self.cache.as_mut() {
                    cache.evict(descriptor.root_entity, key.id_hash());
                }
            }
        }

        for op in plan.links.iter().chain(plan.unlinks.iter()) {
            let (owner, target) = match op {
                JunctionOp::Link { owner, target, .. }
                | JunctionOp::Unlink { owner, target, .. } => (*owner, target),
            };
            if let Some(managed) = self.managed.get(&owner) {
                touched_roots.insert(managed.descriptor.root_entity);
            }
            touched_roots.insert(target.read().entity_descriptor().root_entity);
        }

        if self.cache_active() {
            if let Some(cache) = self.cache.as_mut() {
                for root in &touched_roots {
                    cache.invalidate_queries(root);
                }
            }
        }

        let inserted: HashSet<InstanceId> = plan.inserts.iter().map(|op| op.instance).collect();
        self.scheduled_insertions
            .retain(|instance| !inserted.contains(instance));
        let deleted: HashSet<InstanceId> = plan.deletes.iter().map(|op| op.instance).collect();
        self.scheduled_deletions
            .retain(|instance| !deleted.contains(instance));

        for instance in plan
            .collection_owners
            .iter()
            .chain(plan.inserts.iter().map(|op| &op.instance))
        {
            if let Some(managed) = self.managed.get(instance) {
                managed.entity.write().clear_collection_state();
            }
        }
    }

    // ========================================================================
    // Internal tracking
    // ========================================================================

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn instance_of(&self, shared: &EntityRef) -> Option<InstanceId> {
        self.addr_index.get(&entity_addr(shared)).copied()
    }

    fn register_instance(
        &mut self,
        entity: EntityRef,
        descriptor: &'static EntityDescriptor,
        state: EntityState,
        key: Option<EntityKey>,
    ) -> InstanceId {
        let instance = self.next_instance;
        self.next_instance += 1;
        self.addr_index.insert(entity_addr(&entity), instance);
        if let Some(key) = key {
            self.key_index.insert(key, instance);
        }
        self.managed.insert(
            instance,
            ManagedEntity {
                entity,
                descriptor,
                key,
            },
        );
        self.tracker.set_state(instance, state);
        instance
    }

    fn forget_instance(&mut self, instance: InstanceId) {
        if let Some(managed) = self.managed.remove(&instance) {
            self.addr_index.remove(&entity_addr(&managed.entity));
            if let Some(key) = managed.key {
                self.key_index.remove(&key);
                self.identity_map.remove(&key);
            }
        }
        self.tracker.forget(instance);
        self.explicitly_dirty.remove(&instance);
        self.recorded_changes.remove(&instance);
        self.scheduled_insertions.retain(|i| *i != instance);
        self.scheduled_deletions.retain(|i| *i != instance);
    }

    fn persist_entity(&mut self, shared: EntityRef, visited: &mut HashSet<usize>) -> Result<()> {
        let addr = entity_addr(&shared);
        if !visited.insert(addr) {
            return Ok(());
        }

        if let Some(weak) = self.detached.get(&addr) {
            match weak.upgrade() {
                Some(alive) if Arc::ptr_eq(&alive, &shared) => {
                    return Err(Error::invalid_argument(
                        "cannot persist a detached entity; merge it instead",
                    ));
                }
                _ => {
                    // Stale tombstone from a reused allocation.
                    self.detached.remove(&addr);
                }
            }
        }

        let descriptor = shared.read().entity_descriptor();
        match self.instance_of(&shared) {
            Some(instance) => {
                if self.tracker.state(instance) == Some(EntityState::Removed) {
                    // Persisting a removed entity revives it.
                    self.tracker.set_state(instance, EntityState::Managed);
                    self.scheduled_deletions.retain(|i| *i != instance);
                }
            }
            None => {
                descriptor.validate()?;
                let key = if descriptor.id_generation == IdGeneration::Assigned {
                    let identity = shared.read().identifier();
                    if identity.iter().any(Value::is_null) {
                        return Err(Error::invalid_argument(format!(
                            "{} uses application-assigned identifiers but none is set",
                            descriptor.entity_name
                        )));
                    }
                    let key = EntityKey::new(descriptor.root_entity, &identity);
                    self.identity_map.register(key, &shared)?;
                    Some(key)
                } else {
                    None
                };
                let instance =
                    self.register_instance(shared.clone(), descriptor, EntityState::New, key);
                self.scheduled_insertions.push(instance);
                tracing::debug!(entity = descriptor.entity_name, "scheduled for insertion");
            }
        }

        let cascades = cascade_targets(&shared, descriptor, |c| c.persist);
        for target in cascades {
            self.persist_entity(target, visited)?;
        }
        Ok(())
    }

    fn remove_entity(&mut self, shared: EntityRef, visited: &mut HashSet<usize>) -> Result<()> {
        let addr = entity_addr(&shared);
        if !visited.insert(addr) {
            return Ok(());
        }
        let descriptor = shared.read().entity_descriptor();

        match self.instance_of(&shared) {
            Some(instance) => match self.tracker.state(instance) {
                Some(EntityState::New) => {
                    // Never reached storage; drop it from tracking.
                    self.forget_instance(instance);
                }
                Some(EntityState::Managed) => {
                    self.tracker.set_state(instance, EntityState::Removed);
                    self.scheduled_deletions.push(instance);
                    self.explicitly_dirty.remove(&instance);
                    self.recorded_changes.remove(&instance);
                    tracing::debug!(entity = descriptor.entity_name, "scheduled for deletion");
                }
                _ => {}
            },
            None => {
                return Err(Error::invalid_argument(format!(
                    "cannot remove a {} instance that is not managed by this session",
                    descriptor.entity_name
                )));
            }
        }

        let cascades = cascade_targets(&shared, descriptor, |c| c.remove);
        for target in cascades {
            // Cascaded targets that are unknown to the session are skipped
            // rather than rejected; only the root must be managed.
            if self.instance_of(&target).is_some() {
                self.remove_entity(target, visited)?;
            }
        }
        Ok(())
    }

    fn detach_entity(&mut self, shared: EntityRef, visited: &mut HashSet<usize>) {
        let addr = entity_addr(&shared);
        if !visited.insert(addr) {
            return;
        }
        let Some(instance) = self.instance_of(&shared) else {
            return;
        };
        let descriptor = self
            .managed
            .get(&instance)
            .map(|managed| managed.descriptor);

        self.forget_instance(instance);
        self.detached.insert(addr, Arc::downgrade(&shared));

        if let Some(descriptor) = descriptor {
            let cascades = cascade_targets(&shared, descriptor, |c| c.detach);
            for target in cascades {
                self.detach_entity(target, visited);
            }
        }
    }

    /// Instances reachable from one entity through loaded associations.
    fn reachable_from(&self, root: EntityRef) -> HashSet<InstanceId> {
        let mut out = HashSet::new();
        let mut queue: VecDeque<EntityRef> = VecDeque::new();
        queue.push_back(root);
        let mut seen: HashSet<usize> = HashSet::new();

        while let Some(entity) = queue.pop_front() {
            if !seen.insert(entity_addr(&entity)) {
                continue;
            }
            if let Some(instance) = self.instance_of(&entity) {
                out.insert(instance);
            }
            let descriptor = entity.read().entity_descriptor();
            let mut targets = Vec::new();
            {
                let guard = entity.read();
                for assoc in descriptor.associations {
                    collect_targets(&guard.association(assoc.name), &mut targets);
                }
            }
            queue.extend(targets);
        }
        out
    }

    fn check_optimistic(
        &self,
        instance: InstanceId,
        descriptor: &'static EntityDescriptor,
        expected: Option<&Value>,
    ) -> Result<()> {
        if descriptor.version_field.is_none() {
            return Err(Error::invalid_argument(format!(
                "{} carries no version field; optimistic locking is unavailable",
                descriptor.entity_name
            )));
        }
        let Some(expected) = expected else {
            return Ok(());
        };
        let tracked = self.tracker.version(instance);
        match tracked {
            Some(actual) if identifier_equal(actual, expected) => Ok(()),
            actual => {
                let identity = self
                    .managed
                    .get(&instance)
                    .map(|managed| managed.entity.read().identifier())
                    .unwrap_or_default();
                Err(Error::OptimisticLock(OptimisticLockError {
                    entity: descriptor.entity_name,
                    identity,
                    expected: Some(expected.clone()),
                    actual: actual.cloned(),
                }))
            }
        }
    }

    fn manage_loaded<M: Entity>(
        &mut self,
        key: EntityKey,
        record: &EntityRecord,
    ) -> Result<(Ref<M>, InstanceId)> {
        let entity = M::hydrate(record)?;
        let typed = Ref::new(entity);
        let shared = typed.shared();
        self.identity_map.register(key, &shared)?;
        let instance =
            self.register_instance(shared, M::descriptor(), EntityState::Managed, Some(key));
        self.tracker.take_snapshot(instance, record.clone());
        if let Some(field) = M::descriptor().version_field {
            if let Some(version) = record.get(field) {
                self.tracker.set_version(instance, version.clone());
            }
        }
        Ok((typed, instance))
    }
}

impl<M: Entity, P: EntityPersister> ReferenceLoader<M> for Session<P> {
    async fn load_reference(
        &mut self,
        cx: &Cx,
        identity: &[Value],
    ) -> Outcome<Option<Ref<M>>, Error> {
        self.find_with::<M>(cx, identity, LockMode::None, None).await
    }
}

// ============================================================================
// Free helpers
// ============================================================================

/// The full current record of an entity: scalar fields plus the join
/// columns derived from its owning to-one associations.
fn current_record_of(entity: &EntityRef) -> EntityRecord {
    let (mut record, snapshots) = {
        let guard = entity.read();
        let snapshots: Vec<(&'static AssociationMeta, AssociationValue)> = guard
            .entity_descriptor()
            .associations
            .iter()
            .filter(|assoc| assoc.kind.is_to_one() && assoc.owning && assoc.join_column.is_some())
            .map(|assoc| (assoc, guard.association(assoc.name)))
            .collect();
        (guard.field_values(), snapshots)
    };

    for (assoc, snapshot) in snapshots {
        let Some(column) = assoc.join_column else {
            continue;
        };
        let value = match snapshot {
            AssociationValue::One(target) => target
                .read()
                .identifier()
                .into_iter()
                .next()
                .unwrap_or(Value::Null),
            AssociationValue::Reference(identity) => {
                identity.into_iter().next().unwrap_or(Value::Null)
            }
            AssociationValue::Many(_) | AssociationValue::Absent => Value::Null,
        };
        record.set(column, value);
    }
    record
}

/// Overwrite an entity's scalar fields from a freshly loaded record.
fn apply_record(entity: &EntityRef, descriptor: &'static EntityDescriptor, record: &EntityRecord) {
    let mut guard = entity.write();
    for (name, value) in record.iter() {
        if descriptor.field(name).is_some() {
            guard.set_field(name, value.clone());
        }
    }
}

/// Copy scalar fields (identifier and version excluded) into a target
/// instance.
fn copy_scalar_fields(
    descriptor: &'static EntityDescriptor,
    source: &EntityRecord,
    target: &EntityRef,
) {
    let mut guard = target.write();
    for field in descriptor.fields {
        if field.identifier || field.version {
            continue;
        }
        if let Some(value) = source.get(field.name) {
            guard.set_field(field.name, value.clone());
        }
    }
}

/// Collect the loaded targets of association snapshots into a list.
fn collect_targets(snapshot: &AssociationValue, out: &mut Vec<EntityRef>) {
    match snapshot {
        AssociationValue::One(target) => out.push(target.clone()),
        AssociationValue::Many(collection) => {
            out.extend(collection.items.iter().cloned());
            out.extend(collection.inserted.iter().cloned());
            out.extend(collection.removed.iter().cloned());
        }
        AssociationValue::Reference(_) | AssociationValue::Absent => {}
    }
}

/// The loaded targets of every association whose cascade matches.
fn cascade_targets(
    entity: &EntityRef,
    descriptor: &'static EntityDescriptor,
    cascade: impl Fn(&relmap_core::Cascade) -> bool,
) -> Vec<EntityRef> {
    let guard = entity.read();
    let mut targets = Vec::new();
    for assoc in descriptor.associations {
        if !cascade(&assoc.cascade) {
            continue;
        }
        collect_targets(&guard.association(assoc.name), &mut targets);
    }
    targets
}

/// Cascade targets read from a plain (not shared) source instance.
fn cascade_targets_of_source(
    source: &dyn AnyEntity,
    descriptor: &'static EntityDescriptor,
    cascade: impl Fn(&relmap_core::Cascade) -> bool,
) -> Vec<EntityRef> {
    let mut targets = Vec::new();
    for assoc in descriptor.associations {
        if !cascade(&assoc.cascade) {
            continue;
        }
        collect_targets(&source.association(assoc.name), &mut targets);
    }
    targets
}

/// Check an identifier argument's arity against the descriptor.
fn validate_identity_arity(
    descriptor: &'static EntityDescriptor,
    identity: &[Value],
) -> Result<()> {
    use std::cmp::Ordering;
    match identity.len().cmp(&descriptor.identifier.len()) {
        Ordering::Equal => Ok(()),
        Ordering::Less => Err(Error::Identifier(IdentifierError {
            kind: IdentifierErrorKind::MissingFields,
            entity: descriptor.entity_name,
            fields: descriptor.identifier[identity.len()..]
                .iter()
                .map(|f| (*f).to_string())
                .collect(),
        })),
        Ordering::Greater => Err(Error::Identifier(IdentifierError {
            kind: IdentifierErrorKind::UnrecognizedFields,
            entity: descriptor.entity_name,
            fields: vec![format!(
                "{} identifier values given, {} declared",
                identity.len(),
                descriptor.identifier.len()
            )],
        })),
    }
}
