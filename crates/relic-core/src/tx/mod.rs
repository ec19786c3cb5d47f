//! Nested transaction frames and reverse-replay rollback.
//!
//! Every mutating store operation appends a self-inverting action to the
//! current frame. Rollback replays the frame strictly in reverse through
//! the raw synchronizer primitives; commit folds the frame into its parent
//! so an enclosing rollback can still undo it. Nothing here reaches a
//! backend.

use crate::{
    error::{StoreError, TransactionError},
    handle::RawPtr,
    key::Key,
    schema::{ErasedEntity, registry::TypeRegistry},
    store::{
        arena::{Arena, ProxyState},
        sync::{self, EndpointRef},
    },
    value::Value,
};
use serde::Serialize;
use std::collections::HashSet;

///
/// Action
///
/// One reversible mutation record. Pre-images are captured on first touch
/// per frame; link records carry the position needed to restore container
/// order.
///

pub(crate) enum Action {
    Insert {
        entity: &'static str,
        slot: usize,
        key: Key,
    },
    Update {
        entity: &'static str,
        slot: usize,
        key: Key,
        pre_image: Box<dyn ErasedEntity>,
        prior_state: ProxyState,
    },
    Delete {
        entity: &'static str,
        slot: usize,
        key: Key,
        image: Option<Box<dyn ErasedEntity>>,
        prior_state: ProxyState,
        tombstoned: bool,
    },
    Link {
        ep: EndpointRef,
        owner: RawPtr,
        target: RawPtr,
    },
    Unlink {
        ep: EndpointRef,
        owner: RawPtr,
        target: RawPtr,
        index: usize,
    },
    ElementPush {
        entity: &'static str,
        element: usize,
        owner: RawPtr,
        index: usize,
    },
    ElementRemove {
        entity: &'static str,
        element: usize,
        owner: RawPtr,
        value: Value,
        index: usize,
    },
}

///
/// Frame
///
/// Actions of one nesting level plus the slots already backed up in it.
///

#[derive(Default)]
pub(crate) struct Frame {
    pub actions: Vec<Action>,
    touched: HashSet<usize>,
}

impl Frame {
    fn merge_into(self, parent: &mut Self) {
        parent.actions.extend(self.actions);
        parent.touched.extend(self.touched);
    }
}

///
/// TransactionLog
///
/// The store's single transaction stack.
///

#[derive(Default)]
pub(crate) struct TransactionLog {
    frames: Vec<Frame>,
}

impl TransactionLog {
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_active(&self) -> bool {
        !self.frames.is_empty()
    }

    pub fn begin(&mut self) {
        self.frames.push(Frame::default());
    }

    /// Record an action in the active frame; a no-op outside transactions.
    pub fn record(&mut self, action: Action) {
        if let Some(frame) = self.frames.last_mut() {
            if let Action::Insert { slot, .. } | Action::Update { slot, .. } = &action {
                frame.touched.insert(*slot);
            }
            frame.actions.push(action);
        }
    }

    /// Whether `slot` already has a pre-image (or birth record) in the
    /// active frame.
    pub fn is_backed_up(&self, slot: usize) -> bool {
        self.frames
            .last()
            .is_some_and(|frame| frame.touched.contains(&slot))
    }

    pub fn pop(&mut self) -> Result<Frame, TransactionError> {
        self.frames.pop().ok_or(TransactionError::NoActiveTransaction)
    }

    /// Fold a committed frame into its parent, if one exists.
    pub fn merge(&mut self, frame: Frame) {
        if let Some(parent) = self.frames.last_mut() {
            frame.merge_into(parent);
        }
    }

    pub fn reset(&mut self) {
        self.frames.clear();
    }
}

///
/// CommitRecord
///
/// Observer-facing view of one committed frame, compacted: a delete
/// cancels a same-frame insert, relation and element changes collapse
/// into updates of their owner.
///

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub enum CommitRecord {
    Inserted { entity: &'static str, key: Key },
    Updated { entity: &'static str, key: Key },
    Deleted { entity: &'static str, key: Key },
}

impl CommitRecord {
    #[must_use]
    pub const fn key(&self) -> &Key {
        match self {
            Self::Inserted { key, .. } | Self::Updated { key, .. } | Self::Deleted { key, .. } => {
                key
            }
        }
    }

    #[must_use]
    pub const fn entity(&self) -> &'static str {
        match self {
            Self::Inserted { entity, .. }
            | Self::Updated { entity, .. }
            | Self::Deleted { entity, .. } => entity,
        }
    }
}

/// Compact a frame's raw actions into observer records.
pub(crate) fn compact(actions: &[Action]) -> Vec<CommitRecord> {
    let mut records: Vec<Option<CommitRecord>> = Vec::new();
    let mut positions: std::collections::HashMap<(&'static str, Key), usize> =
        std::collections::HashMap::new();

    let upsert_update = |records: &mut Vec<Option<CommitRecord>>,
                             positions: &mut std::collections::HashMap<(&'static str, Key), usize>,
                             entity: &'static str,
                             key: &Key| {
        if !positions.contains_key(&(entity, key.clone())) {
            positions.insert((entity, key.clone()), records.len());
            records.push(Some(CommitRecord::Updated {
                entity,
                key: key.clone(),
            }));
        }
    };

    for action in actions {
        match action {
            Action::Insert { entity, key, .. } => {
                positions.insert((*entity, key.clone()), records.len());
                records.push(Some(CommitRecord::Inserted {
                    entity: *entity,
                    key: key.clone(),
                }));
            }
            Action::Update { entity, key, .. } => {
                upsert_update(&mut records, &mut positions, *entity, key);
            }
            Action::Delete { entity, key, .. } => {
                match positions.get(&(*entity, key.clone())) {
                    Some(&position) => {
                        let was_insert =
                            matches!(records[position], Some(CommitRecord::Inserted { .. }));
                        if was_insert {
                            // born and removed inside the frame: invisible
                            records[position] = None;
                            positions.remove(&(*entity, key.clone()));
                        } else {
                            records[position] = Some(CommitRecord::Deleted {
                                entity: *entity,
                                key: key.clone(),
                            });
                        }
                    }
                    None => {
                        positions.insert((*entity, key.clone()), records.len());
                        records.push(Some(CommitRecord::Deleted {
                            entity: *entity,
                            key: key.clone(),
                        }));
                    }
                }
            }
            Action::Link { owner, ep, .. } | Action::Unlink { owner, ep, .. } => {
                upsert_update(&mut records, &mut positions, ep.entity, &owner.key);
            }
            Action::ElementPush { entity, owner, .. }
            | Action::ElementRemove { entity, owner, .. } => {
                upsert_update(&mut records, &mut positions, *entity, &owner.key);
            }
        }
    }

    records.into_iter().flatten().collect()
}

/// Undo one action against the live graph. Called in strict reverse frame
/// order; raw primitives only, nothing is re-logged or re-notified.
pub(crate) fn undo(
    action: Action,
    registry: &TypeRegistry,
    arena: &mut Arena,
) -> Result<(), StoreError> {
    match action {
        Action::Insert { entity, slot, key } => {
            // later actions have already been undone, so the endpoints
            // hold exactly the insert-time wiring
            let node = registry.node(entity)?;
            let endpoint_count = node.endpoints.len();
            for index in 0..endpoint_count {
                let ep = EndpointRef::new(entity, index);
                for target in sync::slot_targets(registry, arena, ep, slot)? {
                    let Some(target_slot) = arena.resolve_untyped(&target) else {
                        continue;
                    };
                    sync::unwire_existing(registry, arena, ep, slot, target_slot)?;
                }
            }

            let proxy = arena.detach(slot)?;
            if proxy.refcount != 0 {
                return Err(TransactionError::RollbackInvariant(format!(
                    "insert undo of '{entity}' (key {key}) left {} live reference(s)",
                    proxy.refcount
                ))
                .into());
            }
            Ok(())
        }

        Action::Update {
            entity,
            slot,
            key,
            pre_image,
            prior_state,
        } => {
            let proxy = arena.proxy_mut(slot).ok_or_else(|| {
                StoreError::from(TransactionError::RollbackInvariant(format!(
                    "update undo of '{entity}' (key {key}) found a vacant slot"
                )))
            })?;
            proxy.value = Some(pre_image);
            proxy.state = prior_state;
            Ok(())
        }

        Action::Delete {
            entity,
            slot,
            key,
            image,
            prior_state,
            tombstoned,
        } => {
            arena.attach_at(slot, entity, key.clone(), image, prior_state)?;
            if tombstoned {
                arena.pop_tombstone(entity, &key);
            }
            Ok(())
        }

        Action::Link { ep, owner, target } => {
            let owner_slot = arena.resolve_untyped(&owner).ok_or_else(|| {
                rollback_handle_error("link undo owner", &owner)
            })?;
            sync::unlink(registry, arena, ep, owner_slot, &target)?;
            Ok(())
        }

        Action::Unlink {
            ep,
            owner,
            target,
            index,
        } => {
            let owner_slot = arena.resolve_untyped(&owner).ok_or_else(|| {
                rollback_handle_error("unlink undo owner", &owner)
            })?;
            let target_slot = arena.resolve_untyped(&target).ok_or_else(|| {
                rollback_handle_error("unlink undo target", &target)
            })?;
            sync::link(registry, arena, ep, owner_slot, target_slot, Some(index))?;
            Ok(())
        }

        Action::ElementPush {
            entity,
            element,
            owner,
            index,
        } => {
            let owner_slot = arena.resolve_untyped(&owner).ok_or_else(|| {
                rollback_handle_error("element push undo owner", &owner)
            })?;
            sync::with_element_mut(registry, arena, entity, element, owner_slot, |slot| {
                slot.remove_value_at(index);
            })
        }

        Action::ElementRemove {
            entity,
            element,
            owner,
            value,
            index,
        } => {
            let owner_slot = arena.resolve_untyped(&owner).ok_or_else(|| {
                rollback_handle_error("element remove undo owner", &owner)
            })?;
            sync::with_element_mut(registry, arena, entity, element, owner_slot, |slot| {
                slot.insert_value_at(&value, index);
            })
        }
    }
}

fn rollback_handle_error(context: &str, raw: &RawPtr) -> StoreError {
    TransactionError::RollbackInvariant(format!("{context} {raw} is not attached")).into()
}
