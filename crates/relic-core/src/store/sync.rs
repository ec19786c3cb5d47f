//! Endpoint synchronizer primitives.
//!
//! Everything here is raw: no validation, no transaction logging, no
//! observer notification. Public store operations compose these after
//! validating; rollback replays them directly. Every primitive keeps the
//! pair invariant: owner-side slot first, then reference counts, then the
//! mirrored foreign slot, so no caller ever observes a half-updated pair.

use crate::{
    error::{ObjectError, StoreError},
    handle::RawPtr,
    relation::RelationSlot,
    schema::{PairRef, registry::TypeRegistry},
    store::arena::{Arena, PendingMirror},
};
use std::collections::{HashMap, HashSet, VecDeque};

///
/// EndpointRef
///
/// Addresses one endpoint descriptor: entity name plus position in the
/// node's endpoint list. Kept small so it can live inside log actions.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct EndpointRef {
    pub entity: &'static str,
    pub index: usize,
}

impl EndpointRef {
    pub const fn new(entity: &'static str, index: usize) -> Self {
        Self { entity, index }
    }
}

fn capability_error(ep: EndpointRef) -> StoreError {
    ObjectError::invariant(format!(
        "descriptor capability for '{}' endpoint {} did not match the stored value",
        ep.entity, ep.index
    ))
    .into()
}

/// Run a closure against the mutable relation slot of `slot`'s value.
pub(crate) fn with_slot_mut<R>(
    registry: &TypeRegistry,
    arena: &mut Arena,
    ep: EndpointRef,
    slot: usize,
    f: impl FnOnce(&mut dyn RelationSlot) -> R,
) -> Result<R, StoreError> {
    let node = registry.node(ep.entity)?;
    let desc = node
        .endpoints
        .get(ep.index)
        .ok_or_else(|| capability_error(ep))?;
    let proxy = arena
        .proxy_mut(slot)
        .ok_or_else(|| ObjectError::invariant(format!("slot {slot} is vacant")))?;
    let value = proxy
        .value
        .as_mut()
        .ok_or_else(|| ObjectError::invariant(format!("slot {slot} is hollow")))?;
    let relation = (desc.write)(value.as_any_mut()).ok_or_else(|| capability_error(ep))?;

    Ok(f(relation))
}

/// Run a closure against the shared relation slot of `slot`'s value.
pub(crate) fn with_slot<R>(
    registry: &TypeRegistry,
    arena: &Arena,
    ep: EndpointRef,
    slot: usize,
    f: impl FnOnce(&dyn RelationSlot) -> R,
) -> Result<R, StoreError> {
    let node = registry.node(ep.entity)?;
    let desc = node
        .endpoints
        .get(ep.index)
        .ok_or_else(|| capability_error(ep))?;
    let proxy = arena
        .proxy(slot)
        .ok_or_else(|| ObjectError::invariant(format!("slot {slot} is vacant")))?;
    let value = proxy
        .value
        .as_ref()
        .ok_or_else(|| ObjectError::invariant(format!("slot {slot} is hollow")))?;
    let relation = (desc.read)(value.as_any()).ok_or_else(|| capability_error(ep))?;

    Ok(f(relation))
}

/// Run a closure against the mutable scalar-element slot of `slot`'s value.
pub(crate) fn with_element_mut<R>(
    registry: &TypeRegistry,
    arena: &mut Arena,
    entity: &'static str,
    element: usize,
    slot: usize,
    f: impl FnOnce(&mut dyn crate::relation::ScalarSlot) -> R,
) -> Result<R, StoreError> {
    let node = registry.node(entity)?;
    let desc = node.elements.get(element).ok_or_else(|| {
        ObjectError::invariant(format!("element descriptor {element} missing on '{entity}'"))
    })?;
    let proxy = arena
        .proxy_mut(slot)
        .ok_or_else(|| ObjectError::invariant(format!("slot {slot} is vacant")))?;
    let value = proxy
        .value
        .as_mut()
        .ok_or_else(|| ObjectError::invariant(format!("slot {slot} is hollow")))?;
    let scalar = (desc.write)(value.as_any_mut()).ok_or_else(|| {
        ObjectError::invariant(format!("element capability mismatch on '{entity}'"))
    })?;

    Ok(f(scalar))
}

/// Snapshot the linked targets of one endpoint.
pub(crate) fn slot_targets(
    registry: &TypeRegistry,
    arena: &Arena,
    ep: EndpointRef,
    slot: usize,
) -> Result<Vec<RawPtr>, StoreError> {
    with_slot(registry, arena, ep, slot, RelationSlot::targets)
}

/// Whether an endpoint's pair bears the foreign key of the relation.
fn pair_counts(registry: &TypeRegistry, pair: PairRef) -> Result<bool, StoreError> {
    let node = registry.node(pair.entity)?;
    let desc = node
        .endpoints
        .get(pair.endpoint)
        .ok_or_else(|| capability_error(EndpointRef::new(pair.entity, pair.endpoint)))?;

    Ok(desc.model.counts_reference())
}

fn endpoint_facts(
    registry: &TypeRegistry,
    ep: EndpointRef,
) -> Result<(bool, Option<PairRef>), StoreError> {
    let node = registry.node(ep.entity)?;
    let desc = node
        .endpoints
        .get(ep.index)
        .ok_or_else(|| capability_error(ep))?;

    Ok((desc.model.counts_reference(), desc.pair))
}

fn mirror_put(
    registry: &TypeRegistry,
    arena: &mut Arena,
    pair: PairRef,
    target_slot: usize,
    owner: RawPtr,
) -> Result<(), StoreError> {
    let hollow = arena
        .proxy(target_slot)
        .is_some_and(super::arena::Proxy::is_hollow);

    if hollow {
        if let Some(proxy) = arena.proxy_mut(target_slot) {
            proxy.pending_mirrors.push(PendingMirror {
                entity: pair.entity,
                endpoint: pair.endpoint,
                owner,
            });
        }
        return Ok(());
    }

    with_slot_mut(
        registry,
        arena,
        EndpointRef::new(pair.entity, pair.endpoint),
        target_slot,
        |slot| {
            slot.put(owner);
        },
    )
}

fn mirror_take(
    registry: &TypeRegistry,
    arena: &mut Arena,
    pair: PairRef,
    target_slot: usize,
    owner: &RawPtr,
) -> Result<(), StoreError> {
    let hollow = arena
        .proxy(target_slot)
        .is_some_and(super::arena::Proxy::is_hollow);

    if hollow {
        if let Some(proxy) = arena.proxy_mut(target_slot) {
            if let Some(position) = proxy.pending_mirrors.iter().position(|pending| {
                pending.entity == pair.entity
                    && pending.endpoint == pair.endpoint
                    && pending.owner == *owner
            }) {
                proxy.pending_mirrors.remove(position);
            }
        }
        return Ok(());
    }

    with_slot_mut(
        registry,
        arena,
        EndpointRef::new(pair.entity, pair.endpoint),
        target_slot,
        |slot| {
            slot.take(owner);
        },
    )
}

/// Reference-count and mirror half of a link; the owner-side entry must
/// already be present.
pub(crate) fn wire_existing(
    registry: &TypeRegistry,
    arena: &mut Arena,
    ep: EndpointRef,
    owner_slot: usize,
    target_slot: usize,
) -> Result<(), StoreError> {
    let (counts, pair) = endpoint_facts(registry, ep)?;
    let owner_raw = arena
        .proxy(owner_slot)
        .map(|proxy| proxy.raw(owner_slot))
        .ok_or_else(|| ObjectError::invariant(format!("slot {owner_slot} is vacant")))?;

    if counts
        && let Some(target) = arena.proxy_mut(target_slot)
    {
        target.refcount = target.refcount.saturating_add(1);
    }

    if let Some(pair) = pair {
        if pair_counts(registry, pair)?
            && let Some(owner) = arena.proxy_mut(owner_slot)
        {
            owner.refcount = owner.refcount.saturating_add(1);
        }
        mirror_put(registry, arena, pair, target_slot, owner_raw)?;
    }

    Ok(())
}

/// Reverse of [`wire_existing`]; the owner-side entry is left in place.
pub(crate) fn unwire_existing(
    registry: &TypeRegistry,
    arena: &mut Arena,
    ep: EndpointRef,
    owner_slot: usize,
    target_slot: usize,
) -> Result<(), StoreError> {
    let (counts, pair) = endpoint_facts(registry, ep)?;
    let owner_raw = arena
        .proxy(owner_slot)
        .map(|proxy| proxy.raw(owner_slot))
        .ok_or_else(|| ObjectError::invariant(format!("slot {owner_slot} is vacant")))?;

    if counts
        && let Some(target) = arena.proxy_mut(target_slot)
    {
        target.refcount = target.refcount.saturating_sub(1);
    }

    if let Some(pair) = pair {
        if pair_counts(registry, pair)?
            && let Some(owner) = arena.proxy_mut(owner_slot)
        {
            owner.refcount = owner.refcount.saturating_sub(1);
        }
        mirror_take(registry, arena, pair, target_slot, &owner_raw)?;
    }

    Ok(())
}

/// Full link: owner-side entry plus reference counts and mirror. Returns
/// the position the entry landed at.
pub(crate) fn link(
    registry: &TypeRegistry,
    arena: &mut Arena,
    ep: EndpointRef,
    owner_slot: usize,
    target_slot: usize,
    at: Option<usize>,
) -> Result<usize, StoreError> {
    let target_raw = arena
        .proxy(target_slot)
        .map(|proxy| proxy.raw(target_slot))
        .ok_or_else(|| ObjectError::invariant(format!("slot {target_slot} is vacant")))?;

    let index = with_slot_mut(registry, arena, ep, owner_slot, |slot| match at {
        Some(index) => {
            slot.put_at(target_raw.clone(), index);
            index
        }
        None => slot.put(target_raw.clone()),
    })?;

    wire_existing(registry, arena, ep, owner_slot, target_slot)?;

    Ok(index)
}

/// Full unlink: removes the owner-side entry, reverses reference counts
/// and the mirror. Returns the position the entry was removed from.
pub(crate) fn unlink(
    registry: &TypeRegistry,
    arena: &mut Arena,
    ep: EndpointRef,
    owner_slot: usize,
    target: &RawPtr,
) -> Result<usize, StoreError> {
    let target_slot = arena.resolve_untyped(target).ok_or_else(|| {
        ObjectError::invariant(format!("unlink target {target} is not attached"))
    })?;

    let index = with_slot_mut(registry, arena, ep, owner_slot, |slot| slot.take(target))?
        .ok_or_else(|| {
            ObjectError::invariant(format!(
                "unlink target {target} is not linked through '{}' endpoint {}",
                ep.entity, ep.index
            ))
        })?;

    unwire_existing(registry, arena, ep, owner_slot, target_slot)?;

    Ok(index)
}

///
/// Cascade closure
///

/// Collect the delete closure of `root`: the root plus, transitively, the
/// targets of every cascade-delete endpoint. Owners come before their
/// dependents.
pub(crate) fn delete_closure(
    registry: &TypeRegistry,
    arena: &Arena,
    root: usize,
) -> Result<Vec<usize>, StoreError> {
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([root]);

    while let Some(slot) = queue.pop_front() {
        if !seen.insert(slot) {
            continue;
        }
        order.push(slot);

        let entity = arena
            .proxy(slot)
            .map(|proxy| proxy.entity)
            .ok_or_else(|| ObjectError::invariant(format!("slot {slot} is vacant")))?;
        let node = registry.node(entity)?;

        for (index, desc) in node.endpoints.iter().enumerate() {
            if !desc.model.cascade.allows_delete() {
                continue;
            }
            let targets = slot_targets(registry, arena, EndpointRef::new(entity, index), slot)?;
            for target in targets {
                let target_slot = arena.resolve_untyped(&target).ok_or_else(|| {
                    ObjectError::invariant(format!("cascade target {target} is not attached"))
                })?;
                queue.push_back(target_slot);
            }
        }
    }

    Ok(order)
}

/// Validate that every closure member becomes unreferenced once the
/// closure's own relations are severed. Reference counts are discounted
/// per relation instance; an instance visible from both sides (mirrored
/// membership) is counted once.
pub(crate) fn validate_delete(
    registry: &TypeRegistry,
    arena: &Arena,
    closure: &[usize],
) -> Result<(), StoreError> {
    let members: HashSet<usize> = closure.iter().copied().collect();
    let mut discounts: HashMap<usize, u64> = HashMap::new();

    for &member in closure {
        let entity = arena
            .proxy(member)
            .map(|proxy| proxy.entity)
            .ok_or_else(|| ObjectError::invariant(format!("slot {member} is vacant")))?;
        let node = registry.node(entity)?;

        for (index, desc) in node.endpoints.iter().enumerate() {
            let ep = EndpointRef::new(entity, index);
            let counts = desc.model.counts_reference();
            let pair = desc.pair;

            for target in slot_targets(registry, arena, ep, member)? {
                let Some(target_slot) = arena.resolve_untyped(&target) else {
                    continue;
                };
                let target_in_closure = members.contains(&target_slot);

                // one relation instance is enumerable from both mirrored
                // sides; let the lower (slot, endpoint) side account for it
                if let Some(pair) = pair
                    && target_in_closure
                    && (target_slot, pair.endpoint) < (member, index)
                {
                    continue;
                }

                if counts && target_in_closure {
                    *discounts.entry(target_slot).or_default() += 1;
                }
                if let Some(pair) = pair
                    && target_in_closure
                    && pair_counts(registry, pair)?
                {
                    *discounts.entry(member).or_default() += 1;
                }
            }
        }
    }

    for &member in closure {
        let proxy = arena
            .proxy(member)
            .ok_or_else(|| ObjectError::invariant(format!("slot {member} is vacant")))?;
        let discounted = discounts.get(&member).copied().unwrap_or_default();
        if proxy.refcount > discounted {
            return Err(ObjectError::NotRemovable {
                entity: proxy.entity,
                key: proxy.key.clone(),
                count: proxy.refcount - discounted,
            }
            .into());
        }
    }

    Ok(())
}
