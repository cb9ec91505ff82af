//! Entity mapping metadata.
//!
//! `EntityDescriptor` is the immutable value object the unit of work reads
//! instead of introspecting live structures: identifier fields, persistent
//! scalar fields, associations with cascade rules, optimistic-lock version
//! field, and the change-tracking policy. Descriptors are `'static` data
//! produced by a mapping compiler (or written by hand in tests) and looked
//! up through [`crate::Entity::descriptor`]; the core never mutates them.

use crate::error::{Error, MetadataError, Result};
use crate::value::FieldType;

/// How identifier values come into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdGeneration {
    /// The application assigns identifier values before `persist`.
    Assigned,
    /// Storage generates the identifier on INSERT; the coordinator writes
    /// it back into the entity during post-commit synchronization.
    Storage,
}

/// Per-class change tracking policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangeTrackingPolicy {
    /// Diff every managed instance against its snapshot at flush time.
    #[default]
    DeferredImplicit,
    /// Diff only instances explicitly marked dirty.
    DeferredExplicit,
    /// The entity reports its own changes through the session's
    /// change-recording API; no diffing happens.
    Notify,
}

/// Cascade rules for one association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cascade {
    /// Propagate `persist` to the target(s).
    pub persist: bool,
    /// Propagate `remove` to the target(s).
    pub remove: bool,
    /// Propagate `refresh` to the target(s).
    pub refresh: bool,
    /// Propagate `merge` to the target(s).
    pub merge: bool,
    /// Propagate `detach` to the target(s).
    pub detach: bool,
}

impl Cascade {
    /// No cascades.
    pub const NONE: Cascade = Cascade {
        persist: false,
        remove: false,
        refresh: false,
        merge: false,
        detach: false,
    };

    /// All cascades.
    pub const ALL: Cascade = Cascade {
        persist: true,
        remove: true,
        refresh: true,
        merge: true,
        detach: true,
    };

    /// Enable the persist cascade.
    #[must_use]
    pub const fn persist(mut self) -> Self {
        self.persist = true;
        self
    }

    /// Enable the remove cascade.
    #[must_use]
    pub const fn remove(mut self) -> Self {
        self.remove = true;
        self
    }

    /// Enable the refresh cascade.
    #[must_use]
    pub const fn refresh(mut self) -> Self {
        self.refresh = true;
        self
    }

    /// Enable the merge cascade.
    #[must_use]
    pub const fn merge(mut self) -> Self {
        self.merge = true;
        self
    }

    /// Enable the detach cascade.
    #[must_use]
    pub const fn detach(mut self) -> Self {
        self.detach = true;
        self
    }
}

/// Kind of association between two entity classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationKind {
    /// Many instances reference one target; the FK column lives here.
    ManyToOne,
    /// One-to-one; owning side carries the FK column.
    OneToOne,
    /// Inverse side of a ManyToOne; a collection of targets.
    OneToMany,
    /// Collection joined through a junction table.
    ManyToMany,
}

impl AssociationKind {
    /// Does this association point at a single target?
    #[must_use]
    pub const fn is_to_one(self) -> bool {
        matches!(self, AssociationKind::ManyToOne | AssociationKind::OneToOne)
    }

    /// Does this association point at a collection of targets?
    #[must_use]
    pub const fn is_to_many(self) -> bool {
        !self.is_to_one()
    }
}

/// Junction table metadata for many-to-many associations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JunctionMeta {
    /// The junction table name.
    pub table: &'static str,
    /// Column referencing this (owning) side.
    pub local_column: &'static str,
    /// Column referencing the target side.
    pub remote_column: &'static str,
}

/// Metadata for one association field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociationMeta {
    /// The association field name on this entity.
    pub name: &'static str,
    /// The target entity name.
    pub target: &'static str,
    /// Association kind.
    pub kind: AssociationKind,
    /// Whether this side owns the FK column / junction rows. Only the
    /// owning side is written to storage.
    pub owning: bool,
    /// FK column on the owning side of a to-one association.
    pub join_column: Option<&'static str>,
    /// Whether the FK column accepts NULL. Non-nullable owning FKs force
    /// insertion ordering; nullable ones are preferred cycle-break points.
    pub nullable: bool,
    /// Junction table for many-to-many associations.
    pub junction: Option<JunctionMeta>,
    /// Cascade rules.
    pub cascade: Cascade,
    /// Delete children removed from this collection even without an
    /// explicit `remove` call.
    pub orphan_removal: bool,
}

impl AssociationMeta {
    /// Create association metadata with defaults (inverse, nullable, no
    /// cascades).
    #[must_use]
    pub const fn new(name: &'static str, target: &'static str, kind: AssociationKind) -> Self {
        Self {
            name,
            target,
            kind,
            owning: false,
            join_column: None,
            nullable: true,
            junction: None,
            cascade: Cascade::NONE,
            orphan_removal: false,
        }
    }

    /// Mark this side as the owning side.
    #[must_use]
    pub const fn owning(mut self) -> Self {
        self.owning = true;
        self
    }

    /// Set the FK column for an owning to-one association.
    #[must_use]
    pub const fn join_column(mut self, column: &'static str) -> Self {
        self.join_column = Some(column);
        self
    }

    /// Set FK nullability.
    #[must_use]
    pub const fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Set the junction table for a many-to-many association.
    #[must_use]
    pub const fn junction(mut self, junction: JunctionMeta) -> Self {
        self.junction = Some(junction);
        self
    }

    /// Set cascade rules.
    #[must_use]
    pub const fn cascade(mut self, cascade: Cascade) -> Self {
        self.cascade = cascade;
        self
    }

    /// Enable orphan removal.
    #[must_use]
    pub const fn orphan_removal(mut self) -> Self {
        self.orphan_removal = true;
        self
    }
}

/// Metadata for one persistent scalar field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMeta {
    /// The field name on the entity.
    pub name: &'static str,
    /// The storage column name.
    pub column: &'static str,
    /// Semantic type driving loose comparison.
    pub field_type: FieldType,
    /// Whether the column accepts NULL.
    pub nullable: bool,
    /// Whether this field is part of the identifier.
    pub identifier: bool,
    /// Whether this field is the optimistic-lock version column.
    pub version: bool,
}

impl FieldMeta {
    /// Create field metadata with defaults.
    #[must_use]
    pub const fn new(name: &'static str, column: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            column,
            field_type,
            nullable: false,
            identifier: false,
            version: false,
        }
    }

    /// Mark as nullable.
    #[must_use]
    pub const fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Mark as identifier field.
    #[must_use]
    pub const fn identifier(mut self) -> Self {
        self.identifier = true;
        self
    }

    /// Mark as the optimistic-lock version field.
    #[must_use]
    pub const fn version(mut self) -> Self {
        self.version = true;
        self
    }
}

/// Immutable mapping metadata for one entity class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityDescriptor {
    /// The entity name (unique within the mapped model).
    pub entity_name: &'static str,
    /// The root of the inheritance hierarchy this class belongs to.
    /// Identity-map keys and cache regions use the root so polymorphic
    /// lookups resolve to the same entry. Equal to `entity_name` for
    /// classes outside a hierarchy.
    pub root_entity: &'static str,
    /// The mapped table name.
    pub table: &'static str,
    /// Identifier field names, in composite order.
    pub identifier: &'static [&'static str],
    /// How identifier values are produced.
    pub id_generation: IdGeneration,
    /// Persistent scalar fields (including identifier and version fields).
    pub fields: &'static [FieldMeta],
    /// Associations to other entity classes.
    pub associations: &'static [AssociationMeta],
    /// The optimistic-lock version field, if the class is versioned.
    pub version_field: Option<&'static str>,
    /// Read-only classes never produce UPDATEs.
    pub read_only: bool,
    /// How changes to instances of this class are tracked.
    pub change_tracking: ChangeTrackingPolicy,
}

impl EntityDescriptor {
    /// Look up a scalar field by name.
    pub fn field(&self, name: &str) -> Option<&'static FieldMeta> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Look up an association by name.
    pub fn association(&self, name: &str) -> Option<&'static AssociationMeta> {
        self.associations.iter().find(|a| a.name == name)
    }

    /// Whether this class carries an optimistic-lock version field.
    #[must_use]
    pub fn is_versioned(&self) -> bool {
        self.version_field.is_some()
    }

    /// Check the descriptor for completeness.
    ///
    /// Raised eagerly at the call that first touches the descriptor, never
    /// deferred to flush.
    pub fn validate(&self) -> Result<()> {
        if self.identifier.is_empty() {
            return Err(self.metadata_error("no identifier fields declared"));
        }
        for id_field in self.identifier {
            if self.field(id_field).is_none() {
                return Err(self.metadata_error(format!(
                    "identifier field '{id_field}' is not a declared field"
                )));
            }
        }
        if self.id_generation == IdGeneration::Storage && self.identifier.len() > 1 {
            return Err(
                self.metadata_error("storage-generated composite identifiers are not supported")
            );
        }
        if let Some(version) = self.version_field {
            match self.field(version) {
                None => {
                    return Err(self.metadata_error(format!(
                        "version field '{version}' is not a declared field"
                    )));
                }
                Some(meta) if meta.field_type != FieldType::Integer => {
                    return Err(self.metadata_error(format!(
                        "version field '{version}' must be integer-typed"
                    )));
                }
                Some(_) => {}
            }
        }
        for assoc in self.associations {
            if assoc.kind.is_to_one() && assoc.owning && assoc.join_column.is_none() {
                return Err(self.metadata_error(format!(
                    "owning to-one association '{}' has no join column",
                    assoc.name
                )));
            }
            if assoc.kind == AssociationKind::ManyToMany && assoc.owning && assoc.junction.is_none()
            {
                return Err(self.metadata_error(format!(
                    "owning many-to-many association '{}' has no junction table",
                    assoc.name
                )));
            }
        }
        Ok(())
    }

    fn metadata_error(&self, message: impl Into<String>) -> Error {
        Error::Metadata(MetadataError {
            entity: self.entity_name,
            message: message.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIELDS: &[FieldMeta] = &[
        FieldMeta::new("id", "id", FieldType::Integer).identifier(),
        FieldMeta::new("name", "name", FieldType::Text),
        FieldMeta::new("revision", "revision", FieldType::Integer).version(),
    ];

    const DESCRIPTOR: EntityDescriptor = EntityDescriptor {
        entity_name: "Widget",
        root_entity: "Widget",
        table: "widgets",
        identifier: &["id"],
        id_generation: IdGeneration::Assigned,
        fields: FIELDS,
        associations: &[],
        version_field: Some("revision"),
        read_only: false,
        change_tracking: ChangeTrackingPolicy::DeferredImplicit,
    };

    #[test]
    fn test_valid_descriptor_passes() {
        assert!(DESCRIPTOR.validate().is_ok());
        assert!(DESCRIPTOR.is_versioned());
        assert_eq!(DESCRIPTOR.field("name").unwrap().column, "name");
    }

    #[test]
    fn test_missing_identifier_field_rejected() {
        let mut broken = DESCRIPTOR;
        broken.identifier = &["uuid"];
        let err = broken.validate().unwrap_err();
        assert!(err.to_string().contains("uuid"));
    }

    #[test]
    fn test_non_integer_version_rejected() {
        let mut broken = DESCRIPTOR;
        broken.version_field = Some("name");
        let err = broken.validate().unwrap_err();
        assert!(err.to_string().contains("integer-typed"));
    }

    #[test]
    fn test_owning_to_one_needs_join_column() {
        const BAD_ASSOC: &[AssociationMeta] = &[AssociationMeta::new(
            "owner",
            "Owner",
            AssociationKind::ManyToOne,
        )
        .owning()];

        let mut broken = DESCRIPTOR;
        broken.associations = BAD_ASSOC;
        let err = broken.validate().unwrap_err();
        assert!(err.to_string().contains("join column"));
    }

    #[test]
    fn test_cascade_builders() {
        const CASCADE: Cascade = Cascade::NONE.persist().remove();
        assert!(CASCADE.persist);
        assert!(CASCADE.remove);
        assert!(!CASCADE.merge);
        assert!(Cascade::ALL.detach);
    }

    #[test]
    fn test_association_kind_arity() {
        assert!(AssociationKind::ManyToOne.is_to_one());
        assert!(AssociationKind::OneToMany.is_to_many());
        assert!(AssociationKind::ManyToMany.is_to_many());
    }
}
