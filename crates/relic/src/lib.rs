//! Relic: an in-memory object graph store.
//!
//! ## Crate layout
//! - `core`: the runtime — prototype registry, identity map, relation
//!   endpoint synchronization, transactions, views, and the backend
//!   boundary.
//!
//! The `prelude` module mirrors the surface a typical application uses:
//! declare entities, attach them, and work through the store handle.

pub use relic_core as core;

/// Workspace version re-export for downstream tooling/tests.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use relic_core::{
    CommitRecord,
    backend::{Backend, FlushReport, FlushScope, RawRow, WriteOp},
    error::{ErrorClass, Result, StoreError},
    obs::{OpCounters, StoreObserver},
    store::{HierarchyView, ObjectStore, ObjectView, ProxyRef, ProxyState, StoreConfig},
};

///
/// Prelude
///

pub mod prelude {
    pub use relic_core::prelude::*;

    pub use relic_core::{
        CommitRecord,
        backend::{Backend, FlushScope, RawRow},
        error::{Result, StoreError},
        obs::StoreObserver,
        store::ProxyState,
    };
}
