//! Backend capability boundary.
//!
//! The store consumes this minimal interface for flush and load; it owns
//! no dialect, wire format or connection handling. A backend receives
//! fully resolved write operations (table and column names come from the
//! prototype registry) and serves raw rows back.

use crate::{error::BackendError, key::Key, value::Value};
use serde::{Deserialize, Serialize};

///
/// WriteOp
///
/// One resolved write. `Join` replaces the join rows of one owner wholesale;
/// delta computation is a backend concern.
///

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum WriteOp {
    Insert {
        table: String,
        key: (String, Value),
        columns: Vec<(String, Value)>,
    },
    Update {
        table: String,
        key: (String, Value),
        columns: Vec<(String, Value)>,
    },
    Delete {
        table: String,
        key: (String, Value),
    },
    Join {
        table: String,
        owner: (String, Value),
        entries: Vec<(String, Value)>,
    },
}

impl WriteOp {
    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::Insert { table, .. }
            | Self::Update { table, .. }
            | Self::Delete { table, .. }
            | Self::Join { table, .. } => table,
        }
    }
}

///
/// RawRow
///
/// One persisted row: the primary key plus named column values.
///

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RawRow {
    pub key: Key,
    pub columns: Vec<(String, Value)>,
}

impl RawRow {
    #[must_use]
    pub fn new(key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            columns: Vec::new(),
        }
    }

    #[must_use]
    pub fn column(mut self, name: impl Into<String>, value: Value) -> Self {
        self.columns.push((name.into(), value));
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }
}

///
/// Backend
///

pub trait Backend {
    /// Apply one write; per-op results feed the flush report.
    fn apply(&mut self, op: &WriteOp) -> Result<(), BackendError>;

    /// Stream the rows of one table.
    fn load(&mut self, table: &str) -> Result<Box<dyn Iterator<Item = RawRow>>, BackendError>;
}

///
/// FlushScope
///

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum FlushScope {
    #[default]
    All,
    Keys(Vec<Key>),
}

impl FlushScope {
    #[must_use]
    pub fn covers(&self, key: &Key) -> bool {
        match self {
            Self::All => true,
            Self::Keys(keys) => keys.contains(key),
        }
    }
}

///
/// FlushReport
///
/// Per-entity outcome of one flush pass.
///

#[derive(Clone, Debug, Default, Serialize)]
pub struct FlushReport {
    pub entity: String,
    pub written: u64,
    pub deleted: u64,
    pub failed: Vec<(Key, BackendError)>,
}

impl FlushReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}
