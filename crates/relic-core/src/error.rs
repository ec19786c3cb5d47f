use crate::key::Key;
use serde::Serialize;
use std::fmt;
use thiserror::Error as ThisError;

///
/// ErrorClass
///
/// Internal error taxonomy for runtime classification.
/// Not a stable API; may change without notice.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    Conflict,
    NotFound,
    Unsupported,
    InvariantViolation,
    Internal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::Unsupported => "unsupported",
            Self::InvariantViolation => "invariant_violation",
            Self::Internal => "internal",
        };
        write!(f, "{label}")
    }
}

///
/// StoreError
///
/// Single public error surface. Every subsystem folds into this enum so
/// callers can match one level deep and still reach the precise failure.
///

#[derive(Clone, Debug, ThisError)]
pub enum StoreError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Object(#[from] ObjectError),

    #[error(transparent)]
    Relation(#[from] RelationError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl StoreError {
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Registry(err) => err.class(),
            Self::Object(err) => err.class(),
            Self::Relation(err) => err.class(),
            Self::Transaction(err) => err.class(),
            Self::Backend(err) => err.class(),
        }
    }

    #[must_use]
    pub fn display_with_class(&self) -> String {
        format!("{}: {self}", self.class())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

///
/// RegistryError
///
/// Prototype registry failures, all raised at attach/detach time.
///

#[derive(Clone, Debug, ThisError)]
pub enum RegistryError {
    #[error("type '{0}' already attached")]
    DuplicateType(String),

    #[error("type '{0}' is not attached")]
    UnknownType(String),

    #[error("type '{0}' is abstract and cannot hold instances")]
    AbstractType(String),

    #[error("type '{0}' still in use: {1}")]
    TypeInUse(String, String),

    #[error("type '{0}' declares no primary key column")]
    MissingPrimaryKey(String),

    #[error("parent type '{0}' is not attached")]
    UnknownParent(String),

    #[error("endpoint pairing for '{source}.{field}' is ambiguous on '{target}'")]
    AmbiguousPair {
        source: String,
        field: String,
        target: String,
    },

    #[error("subtype '{derived}' does not cover endpoint '{field}' of base '{base}'")]
    SubtypeMissingEndpoint {
        derived: String,
        base: String,
        field: String,
    },
}

impl RegistryError {
    #[must_use]
    pub(crate) const fn class(&self) -> ErrorClass {
        match self {
            Self::DuplicateType(_) | Self::TypeInUse(..) => ErrorClass::Conflict,
            Self::UnknownType(_) | Self::UnknownParent(_) => ErrorClass::NotFound,
            Self::AbstractType(_) => ErrorClass::Unsupported,
            Self::MissingPrimaryKey(_)
            | Self::AmbiguousPair { .. }
            | Self::SubtypeMissingEndpoint { .. } => ErrorClass::InvariantViolation,
        }
    }
}

///
/// ObjectError
///
/// Identity-map and proxy lifecycle failures.
///

#[derive(Clone, Debug, ThisError)]
pub enum ObjectError {
    #[error("key {key} already present for '{entity}'")]
    KeyConflict { entity: &'static str, key: Key },

    #[error("'{entity}' requires an assigned key before insert")]
    UnassignedKey { entity: &'static str },

    #[error("stale handle for '{entity}' (key {key})")]
    StaleHandle { entity: &'static str, key: Key },

    #[error("'{entity}' (key {key}) is still referenced {count} time(s)")]
    NotRemovable {
        entity: &'static str,
        key: Key,
        count: u64,
    },

    #[error("proxy for '{entity}' (key {key}) has no loaded value")]
    HollowProxy { entity: &'static str, key: Key },

    #[error("object graph invariant violated: {0}")]
    GraphInvariant(String),
}

impl ObjectError {
    #[must_use]
    pub(crate) const fn class(&self) -> ErrorClass {
        match self {
            Self::KeyConflict { .. } | Self::NotRemovable { .. } => ErrorClass::Conflict,
            Self::StaleHandle { .. } => ErrorClass::NotFound,
            Self::UnassignedKey { .. } | Self::HollowProxy { .. } => ErrorClass::Unsupported,
            Self::GraphInvariant(_) => ErrorClass::InvariantViolation,
        }
    }

    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        Self::GraphInvariant(message.into())
    }
}

///
/// RelationError
///
/// Endpoint synchronizer failures, raised before any mutation is applied.
///

#[derive(Clone, Debug, ThisError)]
pub enum RelationError {
    #[error("'{entity}' has no relation field '{field}'")]
    UnknownField { entity: &'static str, field: String },

    #[error("field '{field}' is a {kind} endpoint and does not support this operation")]
    KindMismatch {
        field: String,
        kind: &'static str,
    },

    #[error("field '{field}' targets '{expected}', found '{found}'")]
    TargetMismatch {
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("'{entity}.{field}' references an object that is not attached and cascade forbids insert")]
    UnattachedReference { entity: &'static str, field: String },

    #[error("target (key {key}) is not linked through '{field}'")]
    TargetNotLinked { field: String, key: Key },

    #[error("element {value:?} is not present in '{field}'")]
    ElementNotFound { field: String, value: crate::value::Value },

    #[error("element value does not convert for field '{field}'")]
    ElementMismatch { field: String },

    #[error("relation field '{field}' of '{entity}' was mutated outside the store")]
    FieldTampered { entity: &'static str, field: String },
}

impl RelationError {
    #[must_use]
    pub(crate) const fn class(&self) -> ErrorClass {
        match self {
            Self::UnknownField { .. } | Self::TargetNotLinked { .. } | Self::ElementNotFound { .. } => {
                ErrorClass::NotFound
            }
            Self::KindMismatch { .. }
            | Self::TargetMismatch { .. }
            | Self::ElementMismatch { .. } => ErrorClass::Unsupported,
            Self::UnattachedReference { .. } => ErrorClass::Conflict,
            Self::FieldTampered { .. } => ErrorClass::InvariantViolation,
        }
    }
}

///
/// TransactionError
///

#[derive(Clone, Debug, ThisError)]
pub enum TransactionError {
    #[error("no active transaction")]
    NoActiveTransaction,

    #[error("load is not allowed inside an active transaction")]
    LoadDuringTransaction,

    #[error("rollback invariant violated: {0}")]
    RollbackInvariant(String),
}

impl TransactionError {
    #[must_use]
    pub(crate) const fn class(&self) -> ErrorClass {
        match self {
            Self::NoActiveTransaction | Self::LoadDuringTransaction => ErrorClass::Unsupported,
            Self::RollbackInvariant(_) => ErrorClass::InvariantViolation,
        }
    }
}

///
/// BackendError
///
/// Raised by backend implementations at the flush/load boundary. The store
/// never constructs these itself apart from `MissingColumn` during load.
///

#[derive(Clone, Debug, Serialize, ThisError)]
pub enum BackendError {
    #[error("backend i/o failure: {0}")]
    Io(String),

    #[error("backend rejected write on '{table}': {reason}")]
    Rejected { table: String, reason: String },

    #[error("row for '{table}' is missing column '{column}'")]
    MissingColumn { table: String, column: String },

    #[error("backend does not support: {0}")]
    Unsupported(String),
}

impl BackendError {
    #[must_use]
    pub(crate) const fn class(&self) -> ErrorClass {
        match self {
            Self::Io(_) => ErrorClass::Internal,
            Self::Rejected { .. } => ErrorClass::Conflict,
            Self::MissingColumn { .. } => ErrorClass::InvariantViolation,
            Self::Unsupported(_) => ErrorClass::Unsupported,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_is_preserved_through_the_public_surface() {
        let err: StoreError = RegistryError::DuplicateType("person".to_string()).into();
        assert_eq!(err.class(), ErrorClass::Conflict);
        assert!(err.to_string().contains("already attached"));
    }

    #[test]
    fn display_with_class_prefixes_the_classification() {
        let err: StoreError = TransactionError::NoActiveTransaction.into();
        assert_eq!(
            err.display_with_class(),
            "unsupported: no active transaction"
        );
    }

    #[test]
    fn stale_handles_classify_as_not_found() {
        let err: StoreError = ObjectError::StaleHandle {
            entity: "person",
            key: Key::Uint(9),
        }
        .into();
        assert_eq!(err.class(), ErrorClass::NotFound);
    }
}
