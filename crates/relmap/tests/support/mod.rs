//! Shared fixtures for the unit-of-work integration tests: a recording
//! in-memory persister and a small mapped domain model.
//!
//! The entity impls here are what a mapping compiler would emit; writing
//! them by hand keeps the tests free of codegen.

// Each test binary uses its own subset of these fixtures.
#![allow(dead_code)]

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::Mutex;
use relmap::prelude::*;
use relmap::{AssociationValue, ChangeSet, InsertResult, hash_identity, loosely_equal};

// ============================================================================
// Recording mock persister
// ============================================================================

type RowKey = (&'static str, u64);

/// In-memory persister gateway that records every storage operation.
#[derive(Default)]
pub struct MockPersister {
    ops: Mutex<Vec<String>>,
    rows: Mutex<std::collections::HashMap<RowKey, EntityRecord>>,
    next_id: AtomicI64,
    in_tx: AtomicBool,
}

fn show(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Text(s) => s.clone(),
        other => other.as_i64().map_or_else(|| format!("{other:?}"), |i| i.to_string()),
    }
}

fn show_identity(identity: &[Value]) -> String {
    identity.iter().map(show).collect::<Vec<_>>().join(",")
}

impl MockPersister {
    pub fn new() -> Self {
        Self {
            ops: Mutex::new(Vec::new()),
            rows: Mutex::new(std::collections::HashMap::new()),
            next_id: AtomicI64::new(1),
            in_tx: AtomicBool::new(false),
        }
    }

    /// The recorded operations, in execution order.
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }

    /// Recorded operations whose text starts with the prefix.
    pub fn ops_matching(&self, prefix: &str) -> Vec<String> {
        self.ops
            .lock()
            .iter()
            .filter(|op| op.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().clear();
    }

    fn log(&self, op: String) {
        self.ops.lock().push(op);
    }

    /// Seed a storage row directly, bypassing the log.
    pub fn seed(&self, entity: &'static str, identity: &[Value], record: EntityRecord) {
        self.rows
            .lock()
            .insert((entity, hash_identity(identity)), record);
    }

    /// Read a stored row back.
    pub fn stored(&self, entity: &'static str, identity: &[Value]) -> Option<EntityRecord> {
        self.rows
            .lock()
            .get(&(entity, hash_identity(identity)))
            .cloned()
    }

    fn matches(record: &EntityRecord, criteria: &Criteria) -> bool {
        criteria.predicates().iter().all(|(field, expected)| {
            record
                .get(field)
                .is_some_and(|actual| loosely_equal(actual, expected, FieldType::Integer))
        })
    }
}

impl EntityPersister for MockPersister {
    async fn insert(
        &self,
        _cx: &Cx,
        descriptor: &'static EntityDescriptor,
        record: &EntityRecord,
    ) -> Outcome<InsertResult, Error> {
        let mut record = record.clone();
        let mut generated = None;
        if descriptor.id_generation == IdGeneration::Storage {
            let id_field = descriptor.identifier[0];
            if record.get(id_field).is_none_or(Value::is_null) {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                record.set(id_field, Value::BigInt(id));
                generated = Some(Value::BigInt(id));
            }
        }
        if let Some(field) = descriptor.version_field {
            record.set(field, Value::BigInt(1));
        }

        let identity: Vec<Value> = descriptor
            .identifier
            .iter()
            .map(|field| record.get(field).cloned().unwrap_or(Value::Null))
            .collect();
        self.log(format!(
            "INSERT {} id={}",
            descriptor.table,
            show_identity(&identity)
        ));
        self.rows
            .lock()
            .insert((descriptor.entity_name, hash_identity(&identity)), record);
        Outcome::Ok(InsertResult {
            generated_id: generated,
        })
    }

    async fn update(
        &self,
        _cx: &Cx,
        descriptor: &'static EntityDescriptor,
        identity: &[Value],
        changes: &ChangeSet,
        expected_version: Option<&Value>,
    ) -> Outcome<u64, Error> {
        self.log(format!(
            "UPDATE {} id={} set=[{}]",
            descriptor.table,
            show_identity(identity),
            changes.field_names().join(",")
        ));

        let mut rows = self.rows.lock();
        let Some(row) = rows.get_mut(&(descriptor.entity_name, hash_identity(identity))) else {
            return Outcome::Ok(0);
        };
        if let Some(expected) = expected_version {
            let Some(field) = descriptor.version_field else {
                return Outcome::Ok(0);
            };
            let stored = row.get(field).cloned().unwrap_or(Value::Null);
            if !loosely_equal(&stored, expected, FieldType::Integer) {
                return Outcome::Ok(0);
            }
            let next = stored.as_i64().unwrap_or(0) + 1;
            row.set(field, Value::BigInt(next));
        }
        for change in changes.iter() {
            row.set(change.field, change.new.clone());
        }
        Outcome::Ok(1)
    }

    async fn delete(
        &self,
        _cx: &Cx,
        descriptor: &'static EntityDescriptor,
        identity: &[Value],
        expected_version: Option<&Value>,
    ) -> Outcome<u64, Error> {
        self.log(format!(
            "DELETE {} id={}",
            descriptor.table,
            show_identity(identity)
        ));

        let mut rows = self.rows.lock();
        let key = (descriptor.entity_name, hash_identity(identity));
        let Some(row) = rows.get(&key) else {
            return Outcome::Ok(0);
        };
        if let Some(expected) = expected_version {
            let Some(field) = descriptor.version_field else {
                return Outcome::Ok(0);
            };
            let stored = row.get(field).cloned().unwrap_or(Value::Null);
            if !loosely_equal(&stored, expected, FieldType::Integer) {
                return Outcome::Ok(0);
            }
        }
        rows.remove(&key);
        Outcome::Ok(1)
    }

    async fn load(
        &self,
        _cx: &Cx,
        descriptor: &'static EntityDescriptor,
        identity: &[Value],
        lock: LockMode,
    ) -> Outcome<Option<EntityRecord>, Error> {
        let suffix = match lock {
            LockMode::PessimisticRead => " for-share",
            LockMode::PessimisticWrite => " for-update",
            _ => "",
        };
        self.log(format!(
            "SELECT {} id={}{}",
            descriptor.table,
            show_identity(identity),
            suffix
        ));
        Outcome::Ok(
            self.rows
                .lock()
                .get(&(descriptor.entity_name, hash_identity(identity)))
                .cloned(),
        )
    }

    async fn load_by_criteria(
        &self,
        _cx: &Cx,
        descriptor: &'static EntityDescriptor,
        criteria: &Criteria,
    ) -> Outcome<Vec<EntityRecord>, Error> {
        self.log(format!("SELECT {} by-criteria", descriptor.table));
        let rows = self.rows.lock();
        let mut out: Vec<EntityRecord> = rows
            .iter()
            .filter(|((entity, _), record)| {
                *entity == descriptor.entity_name && Self::matches(record, criteria)
            })
            .map(|(_, record)| record.clone())
            .collect();
        out.sort_by_key(|record| {
            record
                .get(descriptor.identifier[0])
                .and_then(Value::as_i64)
                .unwrap_or(0)
        });
        Outcome::Ok(out)
    }

    async fn count(
        &self,
        cx: &Cx,
        descriptor: &'static EntityDescriptor,
        criteria: &Criteria,
    ) -> Outcome<u64, Error> {
        match self.load_by_criteria(cx, descriptor, criteria).await {
            Outcome::Ok(records) => Outcome::Ok(records.len() as u64),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    async fn exists(
        &self,
        _cx: &Cx,
        descriptor: &'static EntityDescriptor,
        identity: &[Value],
    ) -> Outcome<bool, Error> {
        Outcome::Ok(
            self.rows
                .lock()
                .contains_key(&(descriptor.entity_name, hash_identity(identity))),
        )
    }

    async fn link(
        &self,
        _cx: &Cx,
        junction: &JunctionMeta,
        local: &Value,
        remote: &Value,
    ) -> Outcome<(), Error> {
        self.log(format!(
            "LINK {} {}->{}",
            junction.table,
            show(local),
            show(remote)
        ));
        Outcome::Ok(())
    }

    async fn unlink(
        &self,
        _cx: &Cx,
        junction: &JunctionMeta,
        local: &Value,
        remote: &Value,
    ) -> Outcome<(), Error> {
        self.log(format!(
            "UNLINK {} {}->{}",
            junction.table,
            show(local),
            show(remote)
        ));
        Outcome::Ok(())
    }

    async fn begin(&self, _cx: &Cx) -> Outcome<(), Error> {
        self.log("BEGIN".to_string());
        self.in_tx.store(true, Ordering::SeqCst);
        Outcome::Ok(())
    }

    async fn commit(&self, _cx: &Cx) -> Outcome<(), Error> {
        self.log("COMMIT".to_string());
        self.in_tx.store(false, Ordering::SeqCst);
        Outcome::Ok(())
    }

    async fn rollback(&self, _cx: &Cx) -> Outcome<(), Error> {
        self.log("ROLLBACK".to_string());
        self.in_tx.store(false, Ordering::SeqCst);
        Outcome::Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_tx.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Domain model
// ============================================================================

/// Customer: storage-generated identifier, no associations.
#[derive(Debug, Clone)]
pub struct Customer {
    pub id: Option<i64>,
    pub name: String,
}

const CUSTOMER_FIELDS: &[FieldMeta] = &[
    FieldMeta::new("id", "id", FieldType::Integer).identifier(),
    FieldMeta::new("name", "name", FieldType::Text),
];

pub static CUSTOMER: EntityDescriptor = EntityDescriptor {
    entity_name: "Customer",
    root_entity: "Customer",
    table: "customers",
    identifier: &["id"],
    id_generation: IdGeneration::Storage,
    fields: CUSTOMER_FIELDS,
    associations: &[],
    version_field: None,
    read_only: false,
    change_tracking: ChangeTrackingPolicy::DeferredImplicit,
};

impl Customer {
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
        }
    }
}

impl AnyEntity for Customer {
    fn entity_descriptor(&self) -> &'static EntityDescriptor {
        &CUSTOMER
    }

    fn field_values(&self) -> EntityRecord {
        EntityRecord::from_pairs(vec![
            ("id", Value::from(self.id)),
            ("name", Value::Text(self.name.clone())),
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
            "name" => {
                if let Value::Text(s) = value {
                    self.name = s;
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

impl Entity for Customer {
    fn descriptor() -> &'static EntityDescriptor {
        &CUSTOMER
    }

    fn hydrate(record: &EntityRecord) -> Result<Self> {
        Ok(Self {
            id: record.get("id").and_then(Value::as_i64),
            name: record
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

/// Tag: application-assigned identifier, used as a many-to-many target.
#[derive(Debug, Clone)]
pub struct Tag {
    pub id: Option<i64>,
    pub name: String,
}

const TAG_FIELDS: &[FieldMeta] = &[
    FieldMeta::new("id", "id", FieldType::Integer).identifier(),
    FieldMeta::new("name", "name", FieldType::Text),
];

pub static TAG: EntityDescriptor = EntityDescriptor {
    entity_name: "Tag",
    root_entity: "Tag",
    table: "tags",
    identifier: &["id"],
    id_generation: IdGeneration::Assigned,
    fields: TAG_FIELDS,
    associations: &[],
    version_field: None,
    read_only: false,
    change_tracking: ChangeTrackingPolicy::DeferredImplicit,
};

impl Tag {
    pub fn new(id: i64, name: &str) -> Self {
        Self {
            id: Some(id),
            name: name.to_string(),
        }
    }
}

impl AnyEntity for Tag {
    fn entity_descriptor(&self) -> &'static EntityDescriptor {
        &TAG
    }

    fn field_values(&self) -> EntityRecord {
        EntityRecord::from_pairs(vec![
            ("id", Value::from(self.id)),
            ("name", Value::Text(self.name.clone())),
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
            "name" => {
                if let Value::Text(s) = value {
                    self.name = s;
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

impl Entity for Tag {
    fn descriptor() -> &'static EntityDescriptor {
        &TAG
    }

    fn hydrate(record: &EntityRecord) -> Result<Self> {
        Ok(Self {
            id: record.get("id").and_then(Value::as_i64),
            name: record
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

/// Order: assigned identifier, an uncascaded to-one to `Customer`, and an
/// owning many-to-many to `Tag`.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: Option<i64>,
    pub total: i64,
    pub customer: Assoc<Customer>,
    pub tags: Collection<Tag>,
}

const ORDER_FIELDS: &[FieldMeta] = &[
    FieldMeta::new("id", "id", FieldType::Integer).identifier(),
    FieldMeta::new("total", "total", FieldType::Integer),
];

const ORDER_ASSOCS: &[AssociationMeta] = &[
    AssociationMeta::new("customer", "Customer", AssociationKind::ManyToOne)
        .owning()
        .join_column("customer_id"),
    AssociationMeta::new("tags", "Tag", AssociationKind::ManyToMany)
        .owning()
        .junction(JunctionMeta {
            table: "order_tags",
            local_column: "order_id",
            remote_column: "tag_id",
        }),
];

pub static ORDER: EntityDescriptor = EntityDescriptor {
    entity_name: "Order",
    root_entity: "Order",
    table: "orders",
    identifier: &["id"],
    id_generation: IdGeneration::Assigned,
    fields: ORDER_FIELDS,
    associations: ORDER_ASSOCS,
    version_field: None,
    read_only: false,
    change_tracking: ChangeTrackingPolicy::DeferredImplicit,
};

impl Order {
    pub fn new(id: i64, total: i64) -> Self {
        Self {
            id: Some(id),
            total,
            customer: Assoc::empty(),
            tags: Collection::new(),
        }
    }
}

impl AnyEntity for Order {
    fn entity_descriptor(&self) -> &'static EntityDescriptor {
        &ORDER
    }

    fn field_values(&self) -> EntityRecord {
        EntityRecord::from_pairs(vec![
            ("id", Value::from(self.id)),
            ("total", Value::BigInt(self.total)),
        ])
    }

    fn identifier(&self) -> Vec<Value> {
        vec![Value::from(self.id)]
    }

    fn association(&self, name: &str) -> AssociationValue {
        match name {
            "customer" => self.customer.snapshot(),
            "tags" => self.tags.snapshot(),
            _ => AssociationValue::Absent,
        }
    }

    fn set_field(&mut self, name: &str, value: Value) {
        match name {
            "id" => self.id = value.as_i64(),
            "total" => {
                if let Some(total) = value.as_i64() {
                    self.total = total;
                }
            }
            _ => {}
        }
    }

    fn clear_collection_state(&mut self) {
        self.tags.mark_synced();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Entity for Order {
    fn descriptor() -> &'static EntityDescriptor {
        &ORDER
    }

    fn hydrate(record: &EntityRecord) -> Result<Self> {
        let customer = match record.get("customer_id") {
            Some(value) if !value.is_null() => Assoc::unloaded(vec![value.clone()]),
            _ => Assoc::empty(),
        };
        Ok(Self {
            id: record.get("id").and_then(Value::as_i64),
            total: record.get("total").and_then(Value::as_i64).unwrap_or(0),
            customer,
            tags: Collection::uninitialized(),
        })
    }
}

/// Parent: assigned identifier, cascading one-to-many with orphan removal.
#[derive(Debug, Clone)]
pub struct Parent {
    pub id: Option<i64>,
    pub children: Collection<Child>,
}

const PARENT_FIELDS: &[FieldMeta] =
    &[FieldMeta::new("id", "id", FieldType::Integer).identifier()];

const PARENT_ASSOCS: &[AssociationMeta] =
    &[AssociationMeta::new("children", "Child", AssociationKind::OneToMany)
        .cascade(Cascade::NONE.persist().remove())
        .orphan_removal()];

pub static PARENT: EntityDescriptor = EntityDescriptor {
    entity_name: "Parent",
    root_entity: "Parent",
    table: "parents",
    identifier: &["id"],
    id_generation: IdGeneration::Assigned,
    fields: PARENT_FIELDS,
    associations: PARENT_ASSOCS,
    version_field: None,
    read_only: false,
    change_tracking: ChangeTrackingPolicy::DeferredImplicit,
};

impl Parent {
    pub fn new(id: i64) -> Self {
        Self {
            id: Some(id),
            children: Collection::new(),
        }
    }
}

impl AnyEntity for Parent {
    fn entity_descriptor(&self) -> &'static EntityDescriptor {
        &PARENT
    }

    fn field_values(&self) -> EntityRecord {
        EntityRecord::from_pairs(vec![("id", Value::from(self.id))])
    }

    fn identifier(&self) -> Vec<Value> {
        vec![Value::from(self.id)]
    }

    fn association(&self, name: &str) -> AssociationValue {
        match name {
            "children" => self.children.snapshot(),
            _ => AssociationValue::Absent,
        }
    }

    fn set_field(&mut self, name: &str, value: Value) {
        if name == "id" {
            self.id = value.as_i64();
        }
    }

    fn clear_collection_state(&mut self) {
        self.children.mark_synced();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Entity for Parent {
    fn descriptor() -> &'static EntityDescriptor {
        &PARENT
    }

    fn hydrate(record: &EntityRecord) -> Result<Self> {
        Ok(Self {
            id: record.get("id").and_then(Value::as_i64),
            children: Collection::uninitialized(),
        })
    }
}

/// Child: assigned identifier, non-nullable owning FK to `Parent`.
#[derive(Debug, Clone)]
pub struct Child {
    pub id: Option<i64>,
    pub label: String,
    pub parent: Assoc<Parent>,
}

const CHILD_FIELDS: &[FieldMeta] = &[
    FieldMeta::new("id", "id", FieldType::Integer).identifier(),
    FieldMeta::new("label", "label", FieldType::Text),
];

const CHILD_ASSOCS: &[AssociationMeta] =
    &[AssociationMeta::new("parent", "Parent", AssociationKind::ManyToOne)
        .owning()
        .join_column("parent_id")
        .nullable(false)];

pub static CHILD: EntityDescriptor = EntityDescriptor {
    entity_name: "Child",
    root_entity: "Child",
    table: "children",
    identifier: &["id"],
    id_generation: IdGeneration::Assigned,
    fields: CHILD_FIELDS,
    associations: CHILD_ASSOCS,
    version_field: None,
    read_only: false,
    change_tracking: ChangeTrackingPolicy::DeferredImplicit,
};

impl Child {
    pub fn new(id: i64, label: &str) -> Self {
        Self {
            id: Some(id),
            label: label.to_string(),
            parent: Assoc::empty(),
        }
    }
}

impl AnyEntity for Child {
    fn entity_descriptor(&self) -> &'static EntityDescriptor {
        &CHILD
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

    fn association(&self, name: &str) -> AssociationValue {
        match name {
            "parent" => self.parent.snapshot(),
            _ => AssociationValue::Absent,
        }
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

impl Entity for Child {
    fn descriptor() -> &'static EntityDescriptor {
        &CHILD
    }

    fn hydrate(record: &EntityRecord) -> Result<Self> {
        let parent = match record.get("parent_id") {
            Some(value) if !value.is_null() => Assoc::unloaded(vec![value.clone()]),
            _ => Assoc::empty(),
        };
        Ok(Self {
            id: record.get("id").and_then(Value::as_i64),
            label: record
                .get("label")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            parent,
        })
    }
}

/// Document: versioned for optimistic-lock scenarios.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: Option<i64>,
    pub title: String,
    pub revision: Option<i64>,
}

const DOCUMENT_FIELDS: &[FieldMeta] = &[
    FieldMeta::new("id", "id", FieldType::Integer).identifier(),
    FieldMeta::new("title", "title", FieldType::Text),
    FieldMeta::new("revision", "revision", FieldType::Integer).version(),
];

pub static DOCUMENT: EntityDescriptor = EntityDescriptor {
    entity_name: "Document",
    root_entity: "Document",
    table: "documents",
    identifier: &["id"],
    id_generation: IdGeneration::Assigned,
    fields: DOCUMENT_FIELDS,
    associations: &[],
    version_field: Some("revision"),
    read_only: false,
    change_tracking: ChangeTrackingPolicy::DeferredImplicit,
};

impl Document {
    pub fn new(id: i64, title: &str) -> Self {
        Self {
            id: Some(id),
            title: title.to_string(),
            revision: None,
        }
    }
}

impl AnyEntity for Document {
    fn entity_descriptor(&self) -> &'static EntityDescriptor {
        &DOCUMENT
    }

    fn field_values(&self) -> EntityRecord {
        EntityRecord::from_pairs(vec![
            ("id", Value::from(self.id)),
            ("title", Value::Text(self.title.clone())),
            ("revision", Value::from(self.revision)),
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
            "title" => {
                if let Value::Text(s) = value {
                    self.title = s;
                }
            }
            "revision" => self.revision = value.as_i64(),
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

impl Entity for Document {
    fn descriptor() -> &'static EntityDescriptor {
        &DOCUMENT
    }

    fn hydrate(record: &EntityRecord) -> Result<Self> {
        Ok(Self {
            id: record.get("id").and_then(Value::as_i64),
            title: record
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            revision: record.get("revision").and_then(Value::as_i64),
        })
    }
}

/// TreeNode: nullable self-referencing FK, exercising cycle breaking.
#[derive(Debug, Clone)]
pub struct TreeNode {
    pub id: Option<i64>,
    pub parent: Assoc<TreeNode>,
}

const TREE_NODE_FIELDS: &[FieldMeta] =
    &[FieldMeta::new("id", "id", FieldType::Integer).identifier()];

const TREE_NODE_ASSOCS: &[AssociationMeta] =
    &[AssociationMeta::new("parent", "TreeNode", AssociationKind::ManyToOne)
        .owning()
        .join_column("parent_id")];

pub static TREE_NODE: EntityDescriptor = EntityDescriptor {
    entity_name: "TreeNode",
    root_entity: "TreeNode",
    table: "tree_nodes",
    identifier: &["id"],
    id_generation: IdGeneration::Assigned,
    fields: TREE_NODE_FIELDS,
    associations: TREE_NODE_ASSOCS,
    version_field: None,
    read_only: false,
    change_tracking: ChangeTrackingPolicy::DeferredImplicit,
};

impl TreeNode {
    pub fn new(id: i64) -> Self {
        Self {
            id: Some(id),
            parent: Assoc::empty(),
        }
    }
}

impl AnyEntity for TreeNode {
    fn entity_descriptor(&self) -> &'static EntityDescriptor {
        &TREE_NODE
    }

    fn field_values(&self) -> EntityRecord {
        EntityRecord::from_pairs(vec![("id", Value::from(self.id))])
    }

    fn identifier(&self) -> Vec<Value> {
        vec![Value::from(self.id)]
    }

    fn association(&self, name: &str) -> AssociationValue {
        match name {
            "parent" => self.parent.snapshot(),
            _ => AssociationValue::Absent,
        }
    }

    fn set_field(&mut self, name: &str, value: Value) {
        if name == "id" {
            self.id = value.as_i64();
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Entity for TreeNode {
    fn descriptor() -> &'static EntityDescriptor {
        &TREE_NODE
    }

    fn hydrate(record: &EntityRecord) -> Result<Self> {
        let parent = match record.get("parent_id") {
            Some(value) if !value.is_null() => Assoc::unloaded(vec![value.clone()]),
            _ => Assoc::empty(),
        };
        Ok(Self {
            id: record.get("id").and_then(Value::as_i64),
            parent,
        })
    }
}

// ============================================================================
// Test harness helpers
// ============================================================================

/// Unwrap an `Outcome`, panicking with context on anything but `Ok`.
pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(value) => value,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

/// Unwrap the error from an `Outcome`.
pub fn unwrap_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}
