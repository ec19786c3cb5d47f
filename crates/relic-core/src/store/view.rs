//! Lazy, restartable iteration over attached proxies.
//!
//! Views borrow the store shared, so the borrow checker rules out store
//! mutation while an iteration is in flight. Iteration order is the
//! identity-map order: ascending primary key, subtype buckets after their
//! base for hierarchy views.

use crate::{
    error::Result,
    handle::{ObjectPtr, RawPtr},
    key::Key,
    schema::Entity,
    store::ObjectStore,
    value::Value,
};
use std::marker::PhantomData;

///
/// ObjectView
///
/// Typed view over the proxies of one concrete entity type. Each `iter`
/// call restarts from the first key.
///

pub struct ObjectView<'a, T: Entity> {
    store: &'a ObjectStore,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T: Entity> ObjectView<'a, T> {
    pub(crate) const fn new(store: &'a ObjectStore) -> Self {
        Self {
            store,
            _marker: PhantomData,
        }
    }

    /// Iterate handles in key order.
    pub fn iter(&self) -> impl Iterator<Item = ObjectPtr<T>> + 'a {
        let store = self.store;
        store
            .arena
            .bucket(T::NAME)
            .into_iter()
            .flat_map(|bucket| bucket.index.iter())
            .map(|(key, slot)| ObjectPtr::from_raw(RawPtr::new(*slot, key.clone())))
    }

    /// Iterate handles together with their values, skipping hollow
    /// proxies.
    pub fn values(&self) -> impl Iterator<Item = (ObjectPtr<T>, &'a T)> + 'a {
        let store = self.store;
        self.iter().filter_map(move |ptr| {
            let slot = store.arena.resolve_untyped(&ptr.raw)?;
            let value = store
                .arena
                .proxy(slot)?
                .value
                .as_ref()?
                .as_any()
                .downcast_ref::<T>()?;
            Some((ptr, value))
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.store.arena.count(T::NAME)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn first(&self) -> Option<ObjectPtr<T>> {
        self.iter().next()
    }
}

///
/// ProxyRef
///
/// Type-erased proxy record yielded by hierarchy views.
///

pub struct ProxyRef<'a> {
    store: &'a ObjectStore,
    entity: &'static str,
    slot: usize,
    key: Key,
}

impl<'a> ProxyRef<'a> {
    #[must_use]
    pub const fn entity(&self) -> &'static str {
        self.entity
    }

    #[must_use]
    pub const fn key(&self) -> &Key {
        &self.key
    }

    #[must_use]
    pub fn reference_count(&self) -> u64 {
        self.store
            .arena
            .proxy(self.slot)
            .map_or(0, |proxy| proxy.refcount)
    }

    /// Read one declared attribute by name.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<Value> {
        let node = self.store.registry().get(self.entity)?;
        let desc = node
            .attributes
            .iter()
            .find(|attr| attr.model.name == name)?;
        let proxy = self.store.arena.proxy(self.slot)?;
        let value = proxy.value.as_ref()?;

        (desc.get)(value.as_any())
    }

    /// Typed handle, when the record is of type `T`.
    #[must_use]
    pub fn downcast<T: Entity>(&self) -> Option<ObjectPtr<T>> {
        (self.entity == T::NAME)
            .then(|| ObjectPtr::from_raw(RawPtr::new(self.slot, self.key.clone())))
    }

    /// Typed value borrow, when the record is of type `T`.
    #[must_use]
    pub fn value<T: Entity>(&self) -> Option<&'a T> {
        if self.entity != T::NAME {
            return None;
        }
        self.store
            .arena
            .proxy(self.slot)?
            .value
            .as_ref()?
            .as_any()
            .downcast_ref::<T>()
    }
}

///
/// HierarchyView
///
/// View over an entity and every attached subtype, yielding type-erased
/// records. Anchoring at an abstract type iterates all concrete
/// descendants.
///

pub struct HierarchyView<'a> {
    store: &'a ObjectStore,
    names: Vec<&'static str>,
}

impl<'a> HierarchyView<'a> {
    pub(crate) fn new(store: &'a ObjectStore, names: Vec<&'static str>) -> Self {
        Self { store, names }
    }

    pub fn iter(&self) -> impl Iterator<Item = ProxyRef<'a>> + '_ {
        let store = self.store;
        self.names.iter().copied().flat_map(move |entity| {
            store
                .arena
                .bucket(entity)
                .into_iter()
                .flat_map(|bucket| bucket.index.iter())
                .map(move |(key, slot)| ProxyRef {
                    store,
                    entity,
                    slot: *slot,
                    key: key.clone(),
                })
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names
            .iter()
            .map(|entity| self.store.arena.count(entity))
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore {
    /// Lazy, restartable view over one concrete type's proxies.
    #[must_use]
    pub fn view<T: Entity>(&self) -> ObjectView<'_, T> {
        ObjectView::new(self)
    }

    /// View over a type and all of its attached subtypes.
    pub fn hierarchy_view<T: Entity>(&self) -> Result<HierarchyView<'_>> {
        self.registry().node_of::<T>()?;
        Ok(HierarchyView::new(self, self.registry().subtree(T::NAME)))
    }
}
