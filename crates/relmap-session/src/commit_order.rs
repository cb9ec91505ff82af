//! Commit order calculation.
//!
//! Builds a dependency graph over the entity classes participating in a
//! flush and produces a topological order: a class is placed after every
//! class it holds an owning to-one foreign key to, so referenced rows
//! exist before referencing rows are inserted. Deletion uses the exact
//! reverse order.
//!
//! Cycles (mutual foreign keys, self-references) are tolerated rather than
//! rejected: the edge that closes a cycle is broken by deferring its
//! foreign key column to a post-insert UPDATE, which guarantees progress
//! at the cost of one extra statement.
//!
//! The calculation is deterministic for a given set of classes: nodes are
//! visited in sorted-name order and association edges in declaration
//! order, so flush behavior is reproducible.

use std::collections::BTreeMap;
use std::collections::HashMap;

use relmap_core::EntityDescriptor;

/// A foreign key column whose write is deferred to a post-insert UPDATE
/// because it closed a dependency cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredConstraint {
    /// The class whose insert omits the column.
    pub entity: &'static str,
    /// The association whose foreign key is deferred.
    pub association: &'static str,
    /// The deferred column.
    pub join_column: &'static str,
}

/// The result of a commit-order calculation.
#[derive(Debug, Default)]
pub struct CommitOrder {
    order: Vec<&'static str>,
    deferred: Vec<DeferredConstraint>,
}

impl CommitOrder {
    /// Class names in insertion order (referenced classes first).
    #[must_use]
    pub fn classes(&self) -> &[&'static str] {
        &self.order
    }

    /// The position of a class in the order. Classes outside the
    /// calculation sort last.
    #[must_use]
    pub fn position(&self, entity: &str) -> usize {
        self.order
            .iter()
            .position(|name| *name == entity)
            .unwrap_or(self.order.len())
    }

    /// Foreign keys deferred to post-insert UPDATEs.
    #[must_use]
    pub fn deferred(&self) -> &[DeferredConstraint] {
        &self.deferred
    }

    /// Whether the given association's foreign key is deferred.
    #[must_use]
    pub fn is_deferred(&self, entity: &str, association: &str) -> bool {
        self.deferred
            .iter()
            .any(|d| d.entity == entity && d.association == association)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    InProgress,
    Done,
}

/// Calculates the commit order for a set of entity classes.
#[derive(Default)]
pub struct CommitOrderCalculator {
    nodes: BTreeMap<&'static str, &'static EntityDescriptor>,
}

impl CommitOrderCalculator {
    /// Create an empty calculator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
        }
    }

    /// Add a class to the calculation. Adding a class twice is a no-op.
    pub fn add_class(&mut self, descriptor: &'static EntityDescriptor) {
        self.nodes.entry(descriptor.entity_name).or_insert(descriptor);
    }

    /// Whether the class is part of the calculation.
    #[must_use]
    pub fn has_class(&self, entity: &str) -> bool {
        self.nodes.contains_key(entity)
    }

    /// Compute the topological order over the added classes.
    #[must_use]
    pub fn calculate(&self) -> CommitOrder {
        let mut states: HashMap<&'static str, VisitState> = HashMap::new();
        let mut result = CommitOrder::default();

        for name in self.nodes.keys() {
            if !states.contains_key(name) {
                self.visit(name, &mut states, &mut result);
            }
        }

        tracing::debug!(
            classes = ?result.order,
            deferred = result.deferred.len(),
            "commit order calculated"
        );
        result
    }

    fn visit(
        &self,
        name: &'static str,
        states: &mut HashMap<&'static str, VisitState>,
        result: &mut CommitOrder,
    ) {
        states.insert(name, VisitState::InProgress);
        let descriptor = self.nodes[name];

        for assoc in descriptor.associations {
            // Only owning to-one associations constrain insertion order:
            // the FK column lives in this class's row.
            if !assoc.kind.is_to_one() || !assoc.owning {
                continue;
            }
            let Some(join_column) = assoc.join_column else {
                continue;
            };
            let Some(target_descriptor) = self.nodes.get(assoc.target) else {
                // The referenced class has no scheduled work this flush.
                continue;
            };
            let target = target_descriptor.entity_name;

            if target == name {
                // Self-reference is a one-class cycle.
                result.deferred.push(DeferredConstraint {
                    entity: name,
                    association: assoc.name,
                    join_column,
                });
                continue;
            }

            match states.get(target) {
                None => self.visit(target, states, result),
                Some(VisitState::InProgress) => {
                    // Back edge: this FK closes a cycle. Defer it instead
                    // of failing.
                    result.deferred.push(DeferredConstraint {
                        entity: name,
                        association: assoc.name,
                        join_column,
                    });
                }
                Some(VisitState::Done) => {}
            }
        }

        states.insert(name, VisitState::Done);
        result.order.push(name);
    }
}
