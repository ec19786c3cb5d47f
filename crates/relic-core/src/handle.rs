use crate::key::Key;
use std::{fmt, marker::PhantomData};

///
/// RawPtr
///
/// Untyped arena handle: slot index plus the identity the slot carried when
/// the handle was issued. The store validates both on every dereference, so
/// a handle that outlives its proxy is detected instead of resolving to a
/// recycled slot.
///

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RawPtr {
    pub(crate) slot: usize,
    pub(crate) key: Key,
}

impl RawPtr {
    #[must_use]
    pub(crate) const fn new(slot: usize, key: Key) -> Self {
        Self { slot, key }
    }

    /// Identity snapshot carried by this handle.
    #[must_use]
    pub const fn key(&self) -> &Key {
        &self.key
    }
}

impl fmt::Display for RawPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{}", self.key, self.slot)
    }
}

///
/// ObjectPtr
///
/// Typed handle to an attached object. Handles never own the value; the
/// store is the sole owner and handles are index-plus-identity views into
/// it. Cheap to clone, comparable by identity.
///

pub struct ObjectPtr<T> {
    pub(crate) raw: RawPtr,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ObjectPtr<T> {
    #[must_use]
    pub(crate) const fn from_raw(raw: RawPtr) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// Primary key this handle was issued for.
    #[must_use]
    pub const fn key(&self) -> &Key {
        &self.raw.key
    }

    #[must_use]
    pub(crate) fn raw(&self) -> RawPtr {
        self.raw.clone()
    }
}

impl<T> Clone for ObjectPtr<T> {
    fn clone(&self) -> Self {
        Self::from_raw(self.raw.clone())
    }
}

impl<T> PartialEq for ObjectPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for ObjectPtr<T> {}

impl<T> fmt::Debug for ObjectPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPtr")
            .field("slot", &self.raw.slot)
            .field("key", &self.raw.key)
            .finish()
    }
}

impl<T> fmt::Display for ObjectPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}
