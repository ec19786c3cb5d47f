use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

///
/// Key
///
/// Typed primary key of an attached object. Keys are unique per entity type
/// and immutable once a proxy is attached. `Uint(0)` and `Text("")` are the
/// unassigned sentinels used by values that have not been inserted yet.
///

#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum Key {
    Uint(u64),
    Text(String),
}

impl Key {
    /// The unassigned integer key, used by freshly constructed values.
    pub const UNSET: Self = Self::Uint(0);

    /// Returns `true` if this key still carries the unassigned sentinel.
    #[must_use]
    pub fn is_unassigned(&self) -> bool {
        match self {
            Self::Uint(v) => *v == 0,
            Self::Text(v) => v.is_empty(),
        }
    }

    /// Project the key into the scalar value space (for column emission).
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Uint(v) => Value::Uint(*v),
            Self::Text(v) => Value::Text(v.clone()),
        }
    }

    /// Recover a key from a scalar column value, if the value is key-shaped.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Uint(v) => Some(Self::Uint(*v)),
            Value::Int(v) => u64::try_from(*v).ok().map(Self::Uint),
            Value::Text(v) => Some(Self::Text(v.clone())),
            _ => None,
        }
    }
}

impl Default for Key {
    fn default() -> Self {
        Self::UNSET
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uint(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "'{v}'"),
        }
    }
}

impl From<u64> for Key {
    fn from(value: u64) -> Self {
        Self::Uint(value)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}
