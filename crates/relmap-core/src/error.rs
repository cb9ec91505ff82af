//! Error types for unit-of-work operations.
//!
//! Callers branch on error kind, so every failure condition gets its own
//! variant with a structured payload instead of a stringly-typed catch-all.

use std::fmt;

use crate::value::Value;

/// The primary error type for all relmap operations.
#[derive(Debug)]
pub enum Error {
    /// Caller passed something the operation cannot accept: a detached
    /// entity to `persist`, a malformed handle, or a NEW-and-uncascaded
    /// association target discovered during flush.
    InvalidArgument(InvalidArgumentError),
    /// A mutating operation was attempted after the session closed
    /// following a failed commit.
    Closed,
    /// Version mismatch detected proactively (`lock`) or reactively (zero
    /// rows affected by a versioned UPDATE/DELETE).
    OptimisticLock(OptimisticLockError),
    /// A pessimistic lock was requested with no active transaction.
    TransactionRequired(String),
    /// Two distinct instances claimed the same identity.
    DuplicateIdentity(DuplicateIdentityError),
    /// Malformed identifier argument to `find`/`get_reference`.
    Identifier(IdentifierError),
    /// Incomplete or inconsistent entity metadata.
    Metadata(MetadataError),
    /// A storage failure during the execute phase of a flush; the
    /// transaction was rolled back and the session closed.
    Commit(CommitFailureError),
    /// A storage-level error surfaced by a persister outside the commit
    /// execute phase (loads, explicit transaction control).
    Persister(PersisterError),
}

/// Payload for [`Error::InvalidArgument`].
#[derive(Debug)]
pub struct InvalidArgumentError {
    /// Human-readable description of what was rejected.
    pub message: String,
    /// The entity type involved, when known.
    pub entity: Option<&'static str>,
    /// The field or association involved, when known.
    pub field: Option<&'static str>,
}

/// Payload for [`Error::OptimisticLock`].
#[derive(Debug)]
pub struct OptimisticLockError {
    /// The entity type whose version check failed.
    pub entity: &'static str,
    /// The identity of the offending row.
    pub identity: Vec<Value>,
    /// The version the coordinator expected to find in storage.
    pub expected: Option<Value>,
    /// The version actually observed, when the check was proactive.
    pub actual: Option<Value>,
}

/// Payload for [`Error::DuplicateIdentity`].
#[derive(Debug)]
pub struct DuplicateIdentityError {
    /// The root entity type of the colliding instances.
    pub entity: &'static str,
    /// The contested identity.
    pub identity: Vec<Value>,
}

/// What went wrong with an identifier argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierErrorKind {
    /// Fewer values than the descriptor's identifier fields.
    MissingFields,
    /// Named fields that are not identifier fields of the descriptor.
    UnrecognizedFields,
}

/// Payload for [`Error::Identifier`].
#[derive(Debug)]
pub struct IdentifierError {
    /// Which malformation was detected.
    pub kind: IdentifierErrorKind,
    /// The entity type being looked up.
    pub entity: &'static str,
    /// The offending field names (missing or unrecognized).
    pub fields: Vec<String>,
}

/// Payload for [`Error::Metadata`].
#[derive(Debug)]
pub struct MetadataError {
    /// The entity type with broken metadata.
    pub entity: &'static str,
    /// What is missing or inconsistent.
    pub message: String,
}

/// Payload for [`Error::Commit`].
#[derive(Debug)]
pub struct CommitFailureError {
    /// Description of the failing operation.
    pub message: String,
    /// The underlying persister/storage error.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// Payload for [`Error::Persister`].
#[derive(Debug)]
pub struct PersisterError {
    /// Description of the storage failure.
    pub message: String,
    /// The underlying driver error, if any.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Build an invalid-argument error from a plain message.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument(InvalidArgumentError {
            message: message.into(),
            entity: None,
            field: None,
        })
    }

    /// The error raised when flush finds a NEW entity through an
    /// association that is not configured to cascade persist.
    pub fn uncascaded_new_entity(entity: &'static str, field: &'static str) -> Self {
        Error::InvalidArgument(InvalidArgumentError {
            message: format!(
                "a new entity was found through the association '{entity}.{field}' that is not \
                 configured to cascade persist; explicitly persist the target or add the \
                 persist cascade to the association"
            ),
            entity: Some(entity),
            field: Some(field),
        })
    }

    /// Build a persister error from a plain message.
    pub fn persister(message: impl Into<String>) -> Self {
        Error::Persister(PersisterError {
            message: message.into(),
            source: None,
        })
    }

    /// Wrap a storage error that aborted the commit phase.
    pub fn commit_failure(message: impl Into<String>, source: Error) -> Self {
        Error::Commit(CommitFailureError {
            message: message.into(),
            source: Some(Box::new(source)),
        })
    }

    /// Is this the closed-session error?
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }

    /// Is this an optimistic-lock conflict?
    #[must_use]
    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, Error::OptimisticLock(_))
    }

    /// Is this a commit-phase failure (transaction rolled back, session
    /// closed)?
    #[must_use]
    pub fn is_commit_failure(&self) -> bool {
        matches!(self, Error::Commit(_))
    }

    /// Validation errors abort an operation without touching storage and
    /// without closing the session.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument(_)
                | Error::Identifier(_)
                | Error::Metadata(_)
                | Error::DuplicateIdentity(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(e) => write!(f, "invalid argument: {}", e.message),
            Error::Closed => write!(
                f,
                "the session is closed after a failed commit; no further operations are permitted"
            ),
            Error::OptimisticLock(e) => {
                write!(
                    f,
                    "optimistic lock failed for {} with identity {:?}",
                    e.entity, e.identity
                )?;
                if let Some(expected) = &e.expected {
                    write!(f, " (expected version {expected:?}")?;
                    if let Some(actual) = &e.actual {
                        write!(f, ", found {actual:?}")?;
                    }
                    write!(f, ")")?;
                }
                Ok(())
            }
            Error::TransactionRequired(msg) => {
                write!(f, "an open transaction is required: {msg}")
            }
            Error::DuplicateIdentity(e) => write!(
                f,
                "another instance of {} is already registered for identity {:?}",
                e.entity, e.identity
            ),
            Error::Identifier(e) => match e.kind {
                IdentifierErrorKind::MissingFields => write!(
                    f,
                    "missing identifier field(s) {:?} for {}",
                    e.fields, e.entity
                ),
                IdentifierErrorKind::UnrecognizedFields => write!(
                    f,
                    "unrecognized identifier field(s) {:?} for {}",
                    e.fields, e.entity
                ),
            },
            Error::Metadata(e) => write!(f, "metadata error for {}: {}", e.entity, e.message),
            Error::Commit(e) => write!(f, "commit failed: {}", e.message),
            Error::Persister(e) => write!(f, "persister error: {}", e.message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Commit(e) => e
                .source
                .as_deref()
                .map(|s| s as &(dyn std::error::Error + 'static)),
            Error::Persister(e) => e
                .source
                .as_deref()
                .map(|s| s as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncascaded_message_names_entity_and_field() {
        let err = Error::uncascaded_new_entity("Order", "customer");
        let text = err.to_string();
        assert!(text.contains("Order.customer"));
        assert!(text.contains("cascade persist"));
        assert!(err.is_validation());
    }

    #[test]
    fn test_commit_failure_chains_source() {
        let inner = Error::persister("connection reset");
        let err = Error::commit_failure("INSERT orders", inner);

        assert!(err.is_commit_failure());
        let source = std::error::Error::source(&err).expect("source chained");
        assert!(source.to_string().contains("connection reset"));
    }

    #[test]
    fn test_kind_helpers() {
        assert!(Error::Closed.is_closed());
        assert!(
            Error::OptimisticLock(OptimisticLockError {
                entity: "Order",
                identity: vec![Value::BigInt(1)],
                expected: Some(Value::BigInt(2)),
                actual: None,
            })
            .is_optimistic_lock()
        );
        assert!(!Error::Closed.is_validation());
    }

    #[test]
    fn test_identifier_error_display() {
        let err = Error::Identifier(IdentifierError {
            kind: IdentifierErrorKind::UnrecognizedFields,
            entity: "Order",
            fields: vec!["colour".to_string()],
        });
        assert!(err.to_string().contains("unrecognized"));
        assert!(err.to_string().contains("colour"));
    }
}
