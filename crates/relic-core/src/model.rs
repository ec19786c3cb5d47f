//! Runtime schema models.
//!
//! Types in this module are the *runtime representations* of declared
//! schema facts: what the registry, the endpoint synchronizer, cascade
//! logic and the flush boundary consume. The declarative side lives in the
//! `schema` builder; nothing here holds accessor closures.

use serde::Serialize;
use std::fmt;

///
/// PrototypeModel
///
/// Per-type node metadata recorded at attach time.
///

#[derive(Clone, Debug, Serialize)]
pub struct PrototypeModel {
    /// Stable entity name used in buckets, handles and diagnostics.
    pub entity: &'static str,
    /// Backing table name for the flush boundary.
    pub table: &'static str,
    /// Abstract types cannot hold instances; they anchor hierarchy views.
    pub is_abstract: bool,
    /// Parent entity name for subtype nodes.
    pub parent: Option<&'static str>,
    /// Primary-key column name.
    pub key_column: &'static str,
}

///
/// RelationKind
///

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum RelationKind {
    BelongsTo,
    HasOne,
    HasMany,
}

impl RelationKind {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::BelongsTo => "belongs_to",
            Self::HasOne => "has_one",
            Self::HasMany => "has_many",
        }
    }

    /// Single-target endpoints assign; collection endpoints append.
    #[must_use]
    pub const fn is_single(self) -> bool {
        matches!(self, Self::BelongsTo | Self::HasOne)
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

///
/// Cascade
///
/// Propagation policy of one relation endpoint.
///

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub enum Cascade {
    #[default]
    None,
    Insert,
    Update,
    Delete,
    All,
}

impl Cascade {
    #[must_use]
    pub const fn allows_insert(self) -> bool {
        matches!(self, Self::Insert | Self::All)
    }

    #[must_use]
    pub const fn allows_update(self) -> bool {
        matches!(self, Self::Update | Self::All)
    }

    #[must_use]
    pub const fn allows_delete(self) -> bool {
        matches!(self, Self::Delete | Self::All)
    }
}

///
/// JoinTable
///
/// Names of the intermediate join relation backing a many-to-many or
/// scalar-element endpoint.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct JoinTable {
    pub table: &'static str,
    pub source_column: &'static str,
    pub target_column: &'static str,
}

impl JoinTable {
    #[must_use]
    pub const fn new(
        table: &'static str,
        source_column: &'static str,
        target_column: &'static str,
    ) -> Self {
        Self {
            table,
            source_column,
            target_column,
        }
    }
}

///
/// RelationBacking
///
/// How an endpoint is persisted. `Mirrored` endpoints carry no storage of
/// their own; their membership is the reflection of the paired foreign key.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum RelationBacking {
    ForeignKey { column: &'static str },
    JoinTable(JoinTable),
    Mirrored,
}

///
/// RelationModel
///
/// Metadata half of one endpoint descriptor.
///

#[derive(Clone, Debug, Serialize)]
pub struct RelationModel {
    /// Field name on the source entity.
    pub field: &'static str,
    pub kind: RelationKind,
    pub cascade: Cascade,
    /// Source entity name.
    pub source: &'static str,
    /// Target entity name.
    pub target: &'static str,
    pub backing: RelationBacking,
}

impl RelationModel {
    /// An endpoint counts toward its target's reference count iff it bears
    /// a foreign key: belongs_to and has_one always, join-table entries per
    /// entry, mirrored has_many membership never.
    #[must_use]
    pub const fn counts_reference(&self) -> bool {
        match self.kind {
            RelationKind::BelongsTo | RelationKind::HasOne => true,
            RelationKind::HasMany => matches!(self.backing, RelationBacking::JoinTable(_)),
        }
    }
}

///
/// ElementModel
///
/// Metadata of one scalar-element collection (join-row backed values that
/// are not entities and take no part in reference counting).
///

#[derive(Clone, Debug, Serialize)]
pub struct ElementModel {
    pub field: &'static str,
    pub source: &'static str,
    pub join: JoinTable,
}

///
/// AttributeModel
///

#[derive(Clone, Debug, Serialize)]
pub struct AttributeModel {
    /// Field and column name (a single name serves both).
    pub name: &'static str,
}
