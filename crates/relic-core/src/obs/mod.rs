//! Observability: store observers and per-instance operation counters.
//!
//! Nothing here is global; every store owns its observer set and counter
//! state. Core graph logic never reaches into this module directly beyond
//! the notify helpers, so instrumentation stays at the operation boundary.

use crate::{key::Key, model::PrototypeModel, tx::CommitRecord};
use serde::Serialize;
use std::rc::Rc;

///
/// StoreObserver
///
/// Lifecycle hooks around store operations. All methods default to no-ops
/// so observers implement only what they watch. Observers run after the
/// mutation they describe has fully applied.
///

pub trait StoreObserver {
    fn on_attach(&self, _prototype: &PrototypeModel) {}

    fn on_detach(&self, _prototype: &PrototypeModel) {}

    fn on_insert(&self, _entity: &'static str, _key: &Key) {}

    fn on_update(&self, _entity: &'static str, _key: &Key) {}

    fn on_delete(&self, _entity: &'static str, _key: &Key) {}

    fn on_begin(&self, _depth: usize) {}

    /// Called on every commit with the frame's compacted records; the
    /// outermost commit is the flush-on-commit hook for sessions.
    fn on_commit(&self, _depth: usize, _records: &[CommitRecord]) {}

    fn on_rollback(&self, _depth: usize) {}
}

///
/// ObserverSet
///

#[derive(Clone, Default)]
pub(crate) struct ObserverSet {
    observers: Vec<Rc<dyn StoreObserver>>,
}

impl ObserverSet {
    pub fn register(&mut self, observer: Rc<dyn StoreObserver>) {
        if !self
            .observers
            .iter()
            .any(|existing| Rc::ptr_eq(existing, &observer))
        {
            self.observers.push(observer);
        }
    }

    pub fn unregister(&mut self, observer: &Rc<dyn StoreObserver>) {
        self.observers
            .retain(|existing| !Rc::ptr_eq(existing, observer));
    }

    pub fn notify(&self, f: impl Fn(&dyn StoreObserver)) {
        for observer in &self.observers {
            f(observer.as_ref());
        }
    }
}

///
/// OpCounters
///
/// Monotonic per-store operation counters; `snapshot` them for endpoints
/// or assertions. Saturating so instrumentation can never panic.
///

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct OpCounters {
    pub inserts: u64,
    pub cascade_inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub cascade_deletes: u64,
    pub links: u64,
    pub unlinks: u64,
    pub element_ops: u64,
    pub begins: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub actions_rolled_back: u64,
    pub flush_ops: u64,
    pub rows_loaded: u64,
}

impl OpCounters {
    pub(crate) fn bump(field: &mut u64) {
        *field = field.saturating_add(1);
    }

    pub(crate) fn add(field: &mut u64, amount: u64) {
        *field = field.saturating_add(amount);
    }

    /// Point-in-time copy for reporting.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Default)]
    struct CountingObserver {
        inserts: Cell<u64>,
    }

    impl StoreObserver for CountingObserver {
        fn on_insert(&self, _entity: &'static str, _key: &Key) {
            self.inserts.set(self.inserts.get() + 1);
        }
    }

    #[test]
    fn observers_register_once_and_unregister() {
        let mut set = ObserverSet::default();
        let observer: Rc<CountingObserver> = Rc::default();
        let as_dyn: Rc<dyn StoreObserver> = observer.clone();

        set.register(as_dyn.clone());
        set.register(as_dyn.clone());
        assert_eq!(set.observers.len(), 1);

        set.notify(|o| o.on_insert("department", &Key::Uint(1)));
        assert_eq!(observer.inserts.get(), 1);

        set.unregister(&as_dyn);
        assert!(set.observers.is_empty());
        set.notify(|o| o.on_insert("department", &Key::Uint(2)));
        assert_eq!(observer.inserts.get(), 1);
    }

    #[test]
    fn counters_saturate_instead_of_wrapping() {
        let mut counters = OpCounters::default();
        counters.inserts = u64::MAX;
        OpCounters::bump(&mut counters.inserts);
        assert_eq!(counters.inserts, u64::MAX);

        OpCounters::add(&mut counters.rows_loaded, 3);
        assert_eq!(counters.rows_loaded, 3);
        assert_eq!(counters.snapshot().rows_loaded, 3);
    }
}
