//! The object store: identity map, endpoint synchronization, cascade
//! handling and the transaction surface.
//!
//! One store instance owns every attached value; handles are arena
//! indices with identity checks. All operations are synchronous and run
//! to completion; a store must not be shared across threads without
//! external locking.

pub(crate) mod arena;
mod flush;
pub(crate) mod sync;
mod view;

#[cfg(test)]
mod tests;

pub use arena::ProxyState;
pub use view::{HierarchyView, ObjectView, ProxyRef};

use crate::{
    error::{ObjectError, RegistryError, RelationError, Result},
    handle::{ObjectPtr, RawPtr},
    key::Key,
    model::{PrototypeModel, RelationBacking, RelationModel},
    obs::{ObserverSet, OpCounters, StoreObserver},
    relation::RelationSlot,
    schema::{Entity, ErasedEntity, registry::TypeRegistry},
    store::{
        arena::Arena,
        sync::EndpointRef,
    },
    tx::{self, Action, CommitRecord, TransactionLog},
    value::FieldValue,
};
use std::collections::HashMap;
use std::rc::Rc;

///
/// StoreConfig
///

#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// First value handed out by the identity sequence is
    /// `sequence_start + 1`.
    pub sequence_start: u64,
    /// Detect relation fields mutated inside `modify` closures (bypassing
    /// the synchronizer) and reject the mutation.
    pub guard_relation_fields: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sequence_start: 0,
            guard_relation_fields: true,
        }
    }
}

///
/// ObjectStore
///

pub struct ObjectStore {
    config: StoreConfig,
    registry: TypeRegistry,
    pub(crate) arena: Arena,
    sequence: u64,
    tx: TransactionLog,
    observers: ObserverSet,
    counters: OpCounters,
    /// join table -> claiming endpoint, so each join relation loads once
    loaded_joins: HashMap<&'static str, EndpointRef>,
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    #[must_use]
    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            sequence: config.sequence_start,
            config,
            registry: TypeRegistry::new(),
            arena: Arena::new(),
            tx: TransactionLog::default(),
            observers: ObserverSet::default(),
            counters: OpCounters::default(),
            loaded_joins: HashMap::new(),
        }
    }

    // ------------------------------------------------------------------
    // Prototype surface
    // ------------------------------------------------------------------

    /// Attach a concrete leaf type.
    pub fn attach<T: Entity>(&mut self, table: &'static str) -> Result<()> {
        self.registry.attach::<T>(table)?;
        self.notify_attach(T::NAME);
        Ok(())
    }

    /// Attach a type that anchors a hierarchy but holds no instances.
    pub fn attach_abstract<T: Entity>(&mut self, table: &'static str) -> Result<()> {
        self.registry.attach_abstract::<T>(table)?;
        self.notify_attach(T::NAME);
        Ok(())
    }

    /// Attach a concrete subtype below an already attached base.
    pub fn attach_subtype<D: Entity, B: Entity>(&mut self, table: &'static str) -> Result<()> {
        self.registry.attach_subtype::<D, B>(table)?;
        self.notify_attach(D::NAME);
        Ok(())
    }

    fn notify_attach(&self, entity: &'static str) {
        if let Some(node) = self.registry.get(entity) {
            let model = node.model.clone();
            self.observers.notify(|o| o.on_attach(&model));
        }
    }

    /// Detach a prototype. Fails while proxies of the type are attached,
    /// while unflushed tombstones remain, or while another prototype still
    /// targets it.
    pub fn detach<T: Entity>(&mut self) -> Result<()> {
        let name = T::NAME;
        if self.tx.is_active() {
            return Err(RegistryError::TypeInUse(
                name.to_string(),
                "a transaction is in flight".to_string(),
            )
            .into());
        }

        let live = self.arena.count(name);
        if live > 0 {
            return Err(
                RegistryError::TypeInUse(name.to_string(), format!("{live} live object(s)")).into(),
            );
        }
        if let Some(bucket) = self.arena.bucket(name)
            && !bucket.tombstones.is_empty()
        {
            return Err(RegistryError::TypeInUse(
                name.to_string(),
                "unflushed removals remain".to_string(),
            )
            .into());
        }

        let model = self.registry.node(name)?.model.clone();
        self.registry.detach(name)?;
        self.observers.notify(|o| o.on_detach(&model));

        Ok(())
    }

    /// Prototype metadata of an attached type.
    pub fn prototype<T: Entity>(&self) -> Result<PrototypeModel> {
        Ok(self.registry.node_of::<T>()?.model.clone())
    }

    /// Attached prototype names in attach order.
    pub fn prototypes(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.registry.names()
    }

    #[must_use]
    pub fn is_attached(&self, entity: &str) -> bool {
        self.registry.contains(entity)
    }

    // ------------------------------------------------------------------
    // Identity map
    // ------------------------------------------------------------------

    /// Insert a value, wiring every populated relation endpoint. The whole
    /// staged graph is validated before the first mutation.
    pub fn insert<T: Entity>(&mut self, value: T) -> Result<ObjectPtr<T>> {
        let boxed: Box<dyn ErasedEntity> = Box::new(value);
        let mut planned = Vec::new();
        self.validate_insert_value(boxed.as_ref(), &mut planned)?;

        let raw = self.apply_insert(boxed, false)?;
        Ok(ObjectPtr::from_raw(raw))
    }

    /// Identity-map lookup; `None` is the empty handle.
    #[must_use]
    pub fn get<T: Entity>(&self, key: impl Into<Key>) -> Option<ObjectPtr<T>> {
        let key = key.into();
        let slot = self.arena.lookup(T::NAME, &key)?;
        Some(ObjectPtr::from_raw(RawPtr::new(slot, key)))
    }

    /// Borrow the value behind a handle.
    pub fn value<T: Entity>(&self, ptr: &ObjectPtr<T>) -> Result<&T> {
        let slot = self.arena.resolve(&ptr.raw, T::NAME)?;
        let proxy = self
            .arena
            .proxy(slot)
            .ok_or_else(|| ObjectError::invariant(format!("slot {slot} is vacant")))?;
        let value = proxy.value.as_ref().ok_or_else(|| ObjectError::HollowProxy {
            entity: T::NAME,
            key: proxy.key.clone(),
        })?;

        value
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| ObjectError::invariant(format!("value downcast failed for '{}'", T::NAME)).into())
    }

    /// Number of live relation endpoints (foreign-key bearing) targeting
    /// the object.
    pub fn reference_count<T: Entity>(&self, ptr: &ObjectPtr<T>) -> Result<u64> {
        let slot = self.arena.resolve(&ptr.raw, T::NAME)?;
        Ok(self.arena.proxy(slot).map_or(0, |proxy| proxy.refcount))
    }

    /// Pure removability predicate: no live references.
    pub fn is_removable<T: Entity>(&self, ptr: &ObjectPtr<T>) -> Result<bool> {
        Ok(self.reference_count(ptr)? == 0)
    }

    /// Flush lifecycle state of the proxy behind a handle.
    pub fn state<T: Entity>(&self, ptr: &ObjectPtr<T>) -> Result<ProxyState> {
        let slot = self.arena.resolve(&ptr.raw, T::NAME)?;
        Ok(self
            .arena
            .proxy(slot)
            .map_or(ProxyState::Clean, |proxy| proxy.state))
    }

    #[must_use]
    pub fn count<T: Entity>(&self) -> usize {
        self.arena.count(T::NAME)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Drop every object, tombstone and transaction frame; prototypes
    /// stay attached.
    pub fn clear(&mut self) {
        self.arena.clear();
        self.tx.reset();
        self.loaded_joins.clear();
        self.sequence = self.config.sequence_start;
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Mutate scalar state through a closure. The pre-image is backed up
    /// into the active frame first; relation fields changed inside the
    /// closure are rejected when the guard is enabled.
    pub fn modify<T: Entity, R>(
        &mut self,
        ptr: &ObjectPtr<T>,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R> {
        let slot = self.arena.resolve(&ptr.raw, T::NAME)?;
        let guard = self.config.guard_relation_fields;
        let backup_needed = self.tx.is_active() && !self.tx.is_backed_up(slot);

        let (mut pre_image, prior_state, key) = {
            let proxy = self
                .arena
                .proxy(slot)
                .ok_or_else(|| ObjectError::invariant(format!("slot {slot} is vacant")))?;
            let value = proxy.value.as_ref().ok_or_else(|| ObjectError::HollowProxy {
                entity: T::NAME,
                key: proxy.key.clone(),
            })?;
            let clone = (guard || backup_needed).then(|| value.clone_box());
            (clone, proxy.state, proxy.key.clone())
        };

        let before = if guard {
            Some(self.endpoint_snapshot(T::NAME, slot)?)
        } else {
            None
        };

        let result = {
            let proxy = self
                .arena
                .proxy_mut(slot)
                .ok_or_else(|| ObjectError::invariant(format!("slot {slot} is vacant")))?;
            let value = proxy
                .value
                .as_mut()
                .and_then(|value| value.as_any_mut().downcast_mut::<T>())
                .ok_or_else(|| {
                    ObjectError::invariant(format!("value downcast failed for '{}'", T::NAME))
                })?;
            f(value)
        };

        if let Some(before) = before {
            let after = self.endpoint_snapshot(T::NAME, slot)?;
            if let Some(index) = differing_endpoint(&before, &after) {
                if let Some(pre) = pre_image.take()
                    && let Some(proxy) = self.arena.proxy_mut(slot)
                {
                    proxy.value = Some(pre);
                }
                let field = self
                    .registry
                    .node(T::NAME)?
                    .endpoints
                    .get(index)
                    .map_or("<unknown>", |desc| desc.model.field);
                return Err(RelationError::FieldTampered {
                    entity: T::NAME,
                    field: field.to_string(),
                }
                .into());
            }
        }

        if backup_needed
            && let Some(pre) = pre_image.take()
        {
            self.tx.record(Action::Update {
                entity: T::NAME,
                slot,
                key: key.clone(),
                pre_image: pre,
                prior_state,
            });
        }

        self.mark_dirty_slot(slot);
        OpCounters::bump(&mut self.counters.updates);
        self.observers.notify(|o| o.on_update(T::NAME, &key));

        Ok(result)
    }

    /// Flag a proxy dirty for a future flush, backing up its pre-image
    /// into the active frame.
    pub fn mark_modified<T: Entity>(&mut self, ptr: &ObjectPtr<T>) -> Result<()> {
        let slot = self.arena.resolve(&ptr.raw, T::NAME)?;
        let backup_needed = self.tx.is_active() && !self.tx.is_backed_up(slot);

        let (pre_image, prior_state, key) = {
            let proxy = self
                .arena
                .proxy(slot)
                .ok_or_else(|| ObjectError::invariant(format!("slot {slot} is vacant")))?;
            let clone = backup_needed
                .then(|| proxy.value.as_ref().map(|value| value.clone_box()))
                .flatten();
            (clone, proxy.state, proxy.key.clone())
        };

        if let Some(pre) = pre_image {
            self.tx.record(Action::Update {
                entity: T::NAME,
                slot,
                key: key.clone(),
                pre_image: pre,
                prior_state,
            });
        }

        self.mark_dirty_slot(slot);
        OpCounters::bump(&mut self.counters.updates);
        self.observers.notify(|o| o.on_update(T::NAME, &key));

        Ok(())
    }

    /// Remove an object. Cascade-delete endpoints pull their dependents
    /// into the removal; everything else is disconnected on both sides
    /// first. Validation happens before any mutation.
    pub fn remove<T: Entity>(&mut self, ptr: &ObjectPtr<T>) -> Result<()> {
        let slot = self.arena.resolve(&ptr.raw, T::NAME)?;

        let closure = {
            let Self { registry, arena, .. } = &*self;
            let closure = sync::delete_closure(registry, arena, slot)?;
            sync::validate_delete(registry, arena, &closure)?;
            closure
        };

        // sever every relation of every member, both sides, logged
        for &member in &closure {
            let (entity, owner_raw) = {
                let proxy = self
                    .arena
                    .proxy(member)
                    .ok_or_else(|| ObjectError::invariant(format!("slot {member} is vacant")))?;
                (proxy.entity, proxy.raw(member))
            };
            if self
                .arena
                .proxy(member)
                .is_some_and(arena::Proxy::is_hollow)
            {
                continue;
            }

            let endpoint_count = self.registry.node(entity)?.endpoints.len();
            for index in 0..endpoint_count {
                let ep = EndpointRef::new(entity, index);
                let targets = {
                    let Self { registry, arena, .. } = &*self;
                    sync::slot_targets(registry, arena, ep, member)?
                };
                for target in targets {
                    let unlinked = {
                        let Self { registry, arena, .. } = &mut *self;
                        sync::unlink(registry, arena, ep, member, &target)?
                    };
                    self.tx.record(Action::Unlink {
                        ep,
                        owner: owner_raw.clone(),
                        target,
                        index: unlinked,
                    });
                    OpCounters::bump(&mut self.counters.unlinks);
                }
            }
        }

        // detach dependents first
        for &member in closure.iter().rev() {
            let proxy = self.arena.detach(member)?;
            if proxy.refcount != 0 {
                return Err(ObjectError::invariant(format!(
                    "'{}' (key {}) kept {} reference(s) after severing",
                    proxy.entity, proxy.key, proxy.refcount
                ))
                .into());
            }

            let tombstoned = proxy.state != ProxyState::New;
            if tombstoned {
                self.arena.push_tombstone(proxy.entity, proxy.key.clone());
            }

            let entity = proxy.entity;
            let key = proxy.key.clone();
            self.tx.record(Action::Delete {
                entity,
                slot: member,
                key: key.clone(),
                image: proxy.value,
                prior_state: proxy.state,
                tombstoned,
            });

            if member == slot {
                OpCounters::bump(&mut self.counters.deletes);
            } else {
                OpCounters::bump(&mut self.counters.cascade_deletes);
            }
            self.observers.notify(|o| o.on_delete(entity, &key));
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Relation mutation surface
    // ------------------------------------------------------------------

    /// Assign a single-target endpoint. Replaces (and fully unlinks) any
    /// previous target; assigning the current target is a no-op.
    pub fn set_one<T: Entity, U: Entity>(
        &mut self,
        owner: &ObjectPtr<T>,
        field: &str,
        target: &ObjectPtr<U>,
    ) -> Result<()> {
        let owner_slot = self.arena.resolve(&owner.raw, T::NAME)?;
        let (ep, _model) = self.endpoint_info::<U>(T::NAME, field, true)?;
        let target_slot = self.arena.resolve(&target.raw, U::NAME).map_err(|_| {
            RelationError::UnattachedReference {
                entity: T::NAME,
                field: field.to_string(),
            }
        })?;

        let current = {
            let Self { registry, arena, .. } = &*self;
            sync::slot_targets(registry, arena, ep, owner_slot)?
        };
        if current.first() == Some(&target.raw) {
            return Ok(());
        }

        if let Some(prev) = current.first() {
            self.logged_unlink(ep, owner_slot, prev)?;
        }
        self.sever_conflicting_pair(ep, owner_slot, target_slot)?;
        self.logged_link(ep, owner_slot, target_slot)?;

        self.observers
            .notify(|o| o.on_update(T::NAME, owner.key()));
        Ok(())
    }

    /// Clear a single-target endpoint; clearing an empty endpoint is a
    /// no-op.
    pub fn clear_one<T: Entity>(&mut self, owner: &ObjectPtr<T>, field: &str) -> Result<()> {
        let owner_slot = self.arena.resolve(&owner.raw, T::NAME)?;
        let (ep, kind_single) = {
            let node = self.registry.node(T::NAME)?;
            match node.endpoint(field) {
                Some((index, desc)) => (
                    EndpointRef::new(T::NAME, index),
                    desc.model.kind.is_single(),
                ),
                None => {
                    return Err(RelationError::UnknownField {
                        entity: T::NAME,
                        field: field.to_string(),
                    }
                    .into());
                }
            }
        };
        if !kind_single {
            return Err(RelationError::KindMismatch {
                field: field.to_string(),
                kind: "has_many",
            }
            .into());
        }

        let current = {
            let Self { registry, arena, .. } = &*self;
            sync::slot_targets(registry, arena, ep, owner_slot)?
        };
        if let Some(prev) = current.first() {
            self.logged_unlink(ep, owner_slot, prev)?;
            self.observers
                .notify(|o| o.on_update(T::NAME, owner.key()));
        }

        Ok(())
    }

    /// Insert an unattached value through a single-target endpoint; the
    /// endpoint cascade must permit insert.
    pub fn set_new<T: Entity, U: Entity>(
        &mut self,
        owner: &ObjectPtr<T>,
        field: &str,
        value: U,
    ) -> Result<ObjectPtr<U>> {
        let owner_slot = self.arena.resolve(&owner.raw, T::NAME)?;
        let (ep, model) = self.endpoint_info::<U>(T::NAME, field, true)?;
        if !model.cascade.allows_insert() {
            return Err(RelationError::UnattachedReference {
                entity: T::NAME,
                field: field.to_string(),
            }
            .into());
        }

        let boxed: Box<dyn ErasedEntity> = Box::new(value);
        let mut planned = Vec::new();
        self.validate_insert_value(boxed.as_ref(), &mut planned)?;

        let current = {
            let Self { registry, arena, .. } = &*self;
            sync::slot_targets(registry, arena, ep, owner_slot)?
        };

        let child = self.apply_insert(boxed, true)?;
        let child_slot = self
            .arena
            .resolve_untyped(&child)
            .ok_or_else(|| ObjectError::invariant("cascade insert lost its proxy".to_string()))?;

        if let Some(prev) = current.first() {
            self.logged_unlink(ep, owner_slot, prev)?;
        }
        self.sever_conflicting_pair(ep, owner_slot, child_slot)?;
        self.logged_link(ep, owner_slot, child_slot)?;

        self.observers
            .notify(|o| o.on_update(T::NAME, owner.key()));
        Ok(ObjectPtr::from_raw(child))
    }

    /// Append an attached object to a collection endpoint.
    pub fn push_many<T: Entity, U: Entity>(
        &mut self,
        owner: &ObjectPtr<T>,
        field: &str,
        target: &ObjectPtr<U>,
    ) -> Result<()> {
        let owner_slot = self.arena.resolve(&owner.raw, T::NAME)?;
        let (ep, model) = self.endpoint_info::<U>(T::NAME, field, false)?;
        let target_slot = self.arena.resolve(&target.raw, U::NAME).map_err(|_| {
            RelationError::UnattachedReference {
                entity: T::NAME,
                field: field.to_string(),
            }
        })?;

        // a mirrored collection reflects one foreign key; re-pushing the
        // same member is a no-op
        if matches!(model.backing, RelationBacking::Mirrored) {
            let present = {
                let Self { registry, arena, .. } = &*self;
                sync::with_slot(registry, arena, ep, owner_slot, |slot| {
                    slot.contains_target(&target.raw)
                })?
            };
            if present {
                return Ok(());
            }
        }

        self.sever_conflicting_pair(ep, owner_slot, target_slot)?;
        self.logged_link(ep, owner_slot, target_slot)?;

        self.observers
            .notify(|o| o.on_update(T::NAME, owner.key()));
        Ok(())
    }

    /// Insert an unattached value through a collection endpoint; the
    /// endpoint cascade must permit insert.
    pub fn push_new<T: Entity, U: Entity>(
        &mut self,
        owner: &ObjectPtr<T>,
        field: &str,
        value: U,
    ) -> Result<ObjectPtr<U>> {
        let owner_slot = self.arena.resolve(&owner.raw, T::NAME)?;
        let (ep, model) = self.endpoint_info::<U>(T::NAME, field, false)?;
        if !model.cascade.allows_insert() {
            return Err(RelationError::UnattachedReference {
                entity: T::NAME,
                field: field.to_string(),
            }
            .into());
        }

        let boxed: Box<dyn ErasedEntity> = Box::new(value);
        let mut planned = Vec::new();
        self.validate_insert_value(boxed.as_ref(), &mut planned)?;

        let child = self.apply_insert(boxed, true)?;
        let child_slot = self
            .arena
            .resolve_untyped(&child)
            .ok_or_else(|| ObjectError::invariant("cascade insert lost its proxy".to_string()))?;

        self.sever_conflicting_pair(ep, owner_slot, child_slot)?;
        self.logged_link(ep, owner_slot, child_slot)?;

        self.observers
            .notify(|o| o.on_update(T::NAME, owner.key()));
        Ok(ObjectPtr::from_raw(child))
    }

    /// Remove one member from a collection endpoint.
    pub fn remove_many<T: Entity, U: Entity>(
        &mut self,
        owner: &ObjectPtr<T>,
        field: &str,
        target: &ObjectPtr<U>,
    ) -> Result<()> {
        let owner_slot = self.arena.resolve(&owner.raw, T::NAME)?;
        let (ep, _model) = self.endpoint_info::<U>(T::NAME, field, false)?;

        let present = {
            let Self { registry, arena, .. } = &*self;
            sync::with_slot(registry, arena, ep, owner_slot, |slot| {
                slot.contains_target(&target.raw)
            })?
        };
        if !present {
            return Err(RelationError::TargetNotLinked {
                field: field.to_string(),
                key: target.key().clone(),
            }
            .into());
        }

        self.logged_unlink(ep, owner_slot, &target.raw)?;
        self.observers
            .notify(|o| o.on_update(T::NAME, owner.key()));

        Ok(())
    }

    /// Append a scalar element to a join-row backed collection.
    pub fn push_element<T: Entity, V: FieldValue>(
        &mut self,
        owner: &ObjectPtr<T>,
        field: &str,
        value: V,
    ) -> Result<()> {
        let owner_slot = self.arena.resolve(&owner.raw, T::NAME)?;
        let element = self.element_index(T::NAME, field)?;
        let raw_value = value.to_value();

        let pushed = {
            let Self { registry, arena, .. } = &mut *self;
            sync::with_element_mut(registry, arena, T::NAME, element, owner_slot, |slot| {
                let index = slot.element_count();
                slot.push_value(&raw_value).then_some(index)
            })?
        };
        let index = pushed.ok_or_else(|| RelationError::ElementMismatch {
            field: field.to_string(),
        })?;

        self.tx.record(Action::ElementPush {
            entity: T::NAME,
            element,
            owner: owner.raw(),
            index,
        });
        OpCounters::bump(&mut self.counters.element_ops);
        self.mark_dirty_slot(owner_slot);
        self.observers
            .notify(|o| o.on_update(T::NAME, owner.key()));

        Ok(())
    }

    /// Remove the first matching scalar element.
    pub fn remove_element<T: Entity, V: FieldValue>(
        &mut self,
        owner: &ObjectPtr<T>,
        field: &str,
        value: V,
    ) -> Result<()> {
        let owner_slot = self.arena.resolve(&owner.raw, T::NAME)?;
        let element = self.element_index(T::NAME, field)?;
        let raw_value = value.to_value();

        let removed = {
            let Self { registry, arena, .. } = &mut *self;
            sync::with_element_mut(registry, arena, T::NAME, element, owner_slot, |slot| {
                slot.remove_value(&raw_value)
            })?
        };
        let index = removed.ok_or_else(|| RelationError::ElementNotFound {
            field: field.to_string(),
            value: raw_value.clone(),
        })?;

        self.tx.record(Action::ElementRemove {
            entity: T::NAME,
            element,
            owner: owner.raw(),
            value: raw_value,
            index,
        });
        OpCounters::bump(&mut self.counters.element_ops);
        self.mark_dirty_slot(owner_slot);
        self.observers
            .notify(|o| o.on_update(T::NAME, owner.key()));

        Ok(())
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Open a new frame (savepoint).
    pub fn begin(&mut self) {
        self.tx.begin();
        OpCounters::bump(&mut self.counters.begins);
        let depth = self.tx.depth();
        self.observers.notify(|o| o.on_begin(depth));
    }

    /// Commit the current frame: observers see the compacted records, and
    /// the raw frame folds into the parent so an outer rollback can still
    /// undo it.
    pub fn commit(&mut self) -> Result<Vec<CommitRecord>> {
        let frame = self.tx.pop()?;
        let records = tx::compact(&frame.actions);
        let depth = self.tx.depth();
        self.observers.notify(|o| o.on_commit(depth, &records));
        self.tx.merge(frame);
        OpCounters::bump(&mut self.counters.commits);

        Ok(records)
    }

    /// Roll the current frame back, replaying its actions in strict
    /// reverse order. Enclosing frames are unaffected.
    pub fn rollback(&mut self) -> Result<()> {
        let frame = self.tx.pop()?;
        let undone = frame.actions.len() as u64;
        for action in frame.actions.into_iter().rev() {
            let Self { registry, arena, .. } = &mut *self;
            tx::undo(action, registry, arena)?;
        }

        OpCounters::bump(&mut self.counters.rollbacks);
        OpCounters::add(&mut self.counters.actions_rolled_back, undone);
        let depth = self.tx.depth();
        self.observers.notify(|o| o.on_rollback(depth));

        Ok(())
    }

    #[must_use]
    pub fn transaction_depth(&self) -> usize {
        self.tx.depth()
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.tx.is_active()
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    pub fn register_observer(&mut self, observer: Rc<dyn StoreObserver>) {
        self.observers.register(observer);
    }

    pub fn unregister_observer(&mut self, observer: &Rc<dyn StoreObserver>) {
        self.observers.unregister(observer);
    }

    /// Point-in-time operation counters.
    #[must_use]
    pub fn metrics(&self) -> OpCounters {
        self.counters.snapshot()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn validate_insert_value(
        &self,
        value: &dyn ErasedEntity,
        planned: &mut Vec<(&'static str, Key)>,
    ) -> Result<()> {
        let entity = value.entity_name();
        let node = self.registry.node(entity)?;
        if node.model.is_abstract {
            return Err(RegistryError::AbstractType(entity.to_string()).into());
        }

        let key = value.key();
        if key.is_unassigned() {
            if matches!(key, Key::Text(_)) {
                return Err(ObjectError::UnassignedKey { entity }.into());
            }
        } else {
            let conflict = self.arena.lookup(entity, &key).is_some()
                || planned.iter().any(|(e, k)| *e == entity && *k == key);
            if conflict {
                return Err(ObjectError::KeyConflict { entity, key }.into());
            }
            planned.push((entity, key));
        }

        for desc in &node.endpoints {
            let slot = (desc.read)(value.as_any()).ok_or_else(|| {
                ObjectError::invariant(format!(
                    "descriptor capability for '{entity}.{}' did not match",
                    desc.model.field
                ))
            })?;

            for target in slot.targets() {
                if self.arena.resolve(&target, desc.model.target).is_err() {
                    return Err(RelationError::UnattachedReference {
                        entity,
                        field: desc.model.field.to_string(),
                    }
                    .into());
                }
            }

            let staged = slot.staged_refs();
            if !staged.is_empty() && !desc.model.cascade.allows_insert() {
                return Err(RelationError::UnattachedReference {
                    entity,
                    field: desc.model.field.to_string(),
                }
                .into());
            }
            for staged_value in staged {
                self.validate_insert_value(staged_value, planned)?;
            }
        }

        Ok(())
    }

    fn apply_insert(&mut self, mut value: Box<dyn ErasedEntity>, cascade: bool) -> Result<RawPtr> {
        let entity = value.entity_name();

        let mut key = value.key();
        if key.is_unassigned() {
            loop {
                self.sequence = self.sequence.saturating_add(1);
                key = Key::Uint(self.sequence);
                if self.arena.lookup(entity, &key).is_none() {
                    break;
                }
            }
            value.assign_key(key.clone());
        } else if let Key::Uint(preset) = key
            && preset > self.sequence
        {
            // keep the sequence ahead of user-assigned identities
            self.sequence = preset;
        }

        let slot = self
            .arena
            .attach(entity, key.clone(), Some(value), ProxyState::New);
        self.tx.record(Action::Insert {
            entity,
            slot,
            key: key.clone(),
        });
        OpCounters::bump(&mut self.counters.inserts);
        if cascade {
            OpCounters::bump(&mut self.counters.cascade_inserts);
        }

        let endpoint_count = self.registry.node(entity)?.endpoints.len();
        for index in 0..endpoint_count {
            let ep = EndpointRef::new(entity, index);

            let staged = {
                let Self { registry, arena, .. } = &mut *self;
                sync::with_slot_mut(registry, arena, ep, slot, RelationSlot::take_staged)?
            };
            for staged_value in staged {
                let child = self.apply_insert(staged_value, true)?;
                let Self { registry, arena, .. } = &mut *self;
                sync::with_slot_mut(registry, arena, ep, slot, |relation| {
                    relation.put(child.clone());
                })?;
            }

            let targets = {
                let Self { registry, arena, .. } = &*self;
                sync::slot_targets(registry, arena, ep, slot)?
            };
            for target in targets {
                let target_slot = self.arena.resolve_untyped(&target).ok_or_else(|| {
                    ObjectError::invariant(format!("insert wiring target {target} vanished"))
                })?;
                self.sever_conflicting_pair(ep, slot, target_slot)?;
                {
                    let Self { registry, arena, .. } = &mut *self;
                    sync::wire_existing(registry, arena, ep, slot, target_slot)?;
                }
                self.dirty_after_link(ep, slot, Some(target_slot))?;
            }
        }

        self.observers.notify(|o| o.on_insert(entity, &key));

        Ok(RawPtr::new(slot, key))
    }

    /// When the target's paired endpoint is single-valued and already
    /// linked elsewhere, that prior relation is fully severed (and logged)
    /// before the new link is made.
    fn sever_conflicting_pair(
        &mut self,
        ep: EndpointRef,
        owner_slot: usize,
        target_slot: usize,
    ) -> Result<()> {
        let pair = {
            let node = self.registry.node(ep.entity)?;
            node.endpoints
                .get(ep.index)
                .and_then(|desc| desc.pair)
        };
        let Some(pair) = pair else { return Ok(()) };

        let pair_single = {
            let node = self.registry.node(pair.entity)?;
            node.endpoints
                .get(pair.endpoint)
                .is_some_and(|desc| desc.model.kind.is_single())
        };
        if !pair_single {
            return Ok(());
        }
        if self
            .arena
            .proxy(target_slot)
            .is_none_or(arena::Proxy::is_hollow)
        {
            return Ok(());
        }

        let owner_raw = self
            .arena
            .proxy(owner_slot)
            .map(|proxy| proxy.raw(owner_slot))
            .ok_or_else(|| ObjectError::invariant(format!("slot {owner_slot} is vacant")))?;

        let pair_ep = EndpointRef::new(pair.entity, pair.endpoint);
        let previous = {
            let Self { registry, arena, .. } = &*self;
            sync::slot_targets(registry, arena, pair_ep, target_slot)?
        };

        if let Some(prev) = previous.first()
            && *prev != owner_raw
        {
            let target_raw = self
                .arena
                .proxy(target_slot)
                .map(|proxy| proxy.raw(target_slot))
                .ok_or_else(|| ObjectError::invariant(format!("slot {target_slot} is vacant")))?;

            let index = {
                let Self { registry, arena, .. } = &mut *self;
                sync::unlink(registry, arena, pair_ep, target_slot, prev)?
            };
            self.tx.record(Action::Unlink {
                ep: pair_ep,
                owner: target_raw,
                target: prev.clone(),
                index,
            });
            OpCounters::bump(&mut self.counters.unlinks);
            self.dirty_after_link(pair_ep, target_slot, None)?;
        }

        Ok(())
    }

    fn logged_link(&mut self, ep: EndpointRef, owner_slot: usize, target_slot: usize) -> Result<()> {
        let (owner_raw, target_raw) = self.link_endpoints(owner_slot, target_slot)?;

        {
            let Self { registry, arena, .. } = &mut *self;
            sync::link(registry, arena, ep, owner_slot, target_slot, None)?;
        }
        self.tx.record(Action::Link {
            ep,
            owner: owner_raw,
            target: target_raw,
        });
        OpCounters::bump(&mut self.counters.links);
        self.dirty_after_link(ep, owner_slot, Some(target_slot))?;

        Ok(())
    }

    fn logged_unlink(&mut self, ep: EndpointRef, owner_slot: usize, target: &RawPtr) -> Result<()> {
        let owner_raw = self
            .arena
            .proxy(owner_slot)
            .map(|proxy| proxy.raw(owner_slot))
            .ok_or_else(|| ObjectError::invariant(format!("slot {owner_slot} is vacant")))?;
        let target_slot = self.arena.resolve_untyped(target);

        let index = {
            let Self { registry, arena, .. } = &mut *self;
            sync::unlink(registry, arena, ep, owner_slot, target)?
        };
        self.tx.record(Action::Unlink {
            ep,
            owner: owner_raw,
            target: target.clone(),
            index,
        });
        OpCounters::bump(&mut self.counters.unlinks);
        self.dirty_after_link(ep, owner_slot, target_slot)?;

        Ok(())
    }

    fn link_endpoints(&self, owner_slot: usize, target_slot: usize) -> Result<(RawPtr, RawPtr)> {
        let owner_raw = self
            .arena
            .proxy(owner_slot)
            .map(|proxy| proxy.raw(owner_slot))
            .ok_or_else(|| ObjectError::invariant(format!("slot {owner_slot} is vacant")))?;
        let target_raw = self
            .arena
            .proxy(target_slot)
            .map(|proxy| proxy.raw(target_slot))
            .ok_or_else(|| ObjectError::invariant(format!("slot {target_slot} is vacant")))?;

        Ok((owner_raw, target_raw))
    }

    /// Dirty-flag the rows whose foreign-key state a (un)link touched:
    /// the owner when its endpoint bears the key, the target when the
    /// mirrored pair does.
    fn dirty_after_link(
        &mut self,
        ep: EndpointRef,
        owner_slot: usize,
        target_slot: Option<usize>,
    ) -> Result<()> {
        let (owner_fk, pair) = {
            let node = self.registry.node(ep.entity)?;
            let desc = node
                .endpoints
                .get(ep.index)
                .ok_or_else(|| ObjectError::invariant("endpoint index out of range".to_string()))?;
            (
                !matches!(desc.model.backing, RelationBacking::Mirrored),
                desc.pair,
            )
        };

        if owner_fk {
            self.mark_dirty_slot(owner_slot);
        }
        if let (Some(pair), Some(target_slot)) = (pair, target_slot) {
            let pair_fk = {
                let node = self.registry.node(pair.entity)?;
                node.endpoints
                    .get(pair.endpoint)
                    .is_some_and(|desc| !matches!(desc.model.backing, RelationBacking::Mirrored))
            };
            if pair_fk {
                self.mark_dirty_slot(target_slot);
            }
        }

        Ok(())
    }

    fn mark_dirty_slot(&mut self, slot: usize) {
        if let Some(proxy) = self.arena.proxy_mut(slot)
            && proxy.state == ProxyState::Clean
        {
            proxy.state = ProxyState::Dirty;
        }
    }

    fn endpoint_info<U: Entity>(
        &self,
        entity: &'static str,
        field: &str,
        want_single: bool,
    ) -> Result<(EndpointRef, RelationModel)> {
        let node = self.registry.node(entity)?;
        match node.endpoint(field) {
            Some((index, desc)) => {
                if desc.model.target != U::NAME {
                    return Err(RelationError::TargetMismatch {
                        field: field.to_string(),
                        expected: desc.model.target,
                        found: U::NAME,
                    }
                    .into());
                }
                if desc.model.kind.is_single() != want_single {
                    return Err(RelationError::KindMismatch {
                        field: field.to_string(),
                        kind: desc.model.kind.label(),
                    }
                    .into());
                }
                Ok((EndpointRef::new(entity, index), desc.model.clone()))
            }
            None if node.element(field).is_some() => Err(RelationError::KindMismatch {
                field: field.to_string(),
                kind: "scalar elements",
            }
            .into()),
            None => Err(RelationError::UnknownField {
                entity,
                field: field.to_string(),
            }
            .into()),
        }
    }

    fn element_index(&self, entity: &'static str, field: &str) -> Result<usize> {
        let node = self.registry.node(entity)?;
        match node.element(field) {
            Some((index, _)) => Ok(index),
            None if node.endpoint(field).is_some() => Err(RelationError::KindMismatch {
                field: field.to_string(),
                kind: "relation endpoint",
            }
            .into()),
            None => Err(RelationError::UnknownField {
                entity,
                field: field.to_string(),
            }
            .into()),
        }
    }

    fn endpoint_snapshot(
        &self,
        entity: &'static str,
        slot: usize,
    ) -> Result<Vec<(Vec<RawPtr>, usize)>> {
        let endpoint_count = self.registry.node(entity)?.endpoints.len();
        let mut snapshot = Vec::with_capacity(endpoint_count);
        for index in 0..endpoint_count {
            let ep = EndpointRef::new(entity, index);
            let Self { registry, arena, .. } = &*self;
            let entry = sync::with_slot(registry, arena, ep, slot, |relation| {
                (relation.targets(), relation.staged_refs().len())
            })?;
            snapshot.push(entry);
        }
        Ok(snapshot)
    }

    pub(crate) fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub(crate) fn claim_join(&mut self, table: &'static str, ep: EndpointRef) -> bool {
        if self.loaded_joins.contains_key(table) {
            return false;
        }
        self.loaded_joins.insert(table, ep);
        true
    }

    pub(crate) fn counters_mut(&mut self) -> &mut OpCounters {
        &mut self.counters
    }

    pub(crate) fn sync_sequence(&mut self, key: &Key) {
        if let Key::Uint(preset) = key
            && *preset > self.sequence
        {
            self.sequence = *preset;
        }
    }
}

/// First endpoint position where two relation snapshots disagree.
fn differing_endpoint(
    before: &[(Vec<RawPtr>, usize)],
    after: &[(Vec<RawPtr>, usize)],
) -> Option<usize> {
    before.iter().zip(after.iter()).position(|(b, a)| b != a)
}
