//! Flush and load at the backend boundary.
//!
//! Flush turns dirty/new/removed proxies into resolved write operations
//! using the prototype metadata; load rehydrates proxies from raw rows
//! and rewires their endpoints, creating hollow placeholders for
//! foreign keys whose type has not loaded yet.

use crate::{
    backend::{Backend, FlushReport, FlushScope, RawRow, WriteOp},
    error::{ObjectError, RegistryError, Result, TransactionError},
    key::Key,
    model::{JoinTable, RelationBacking},
    obs::OpCounters,
    schema::Entity,
    store::{
        ObjectStore,
        arena::ProxyState,
        sync::{self, EndpointRef},
    },
    value::Value,
};

impl ObjectStore {
    /// Flush every dirty, new and removed proxy of `T` within `scope`.
    /// Failed writes stay pending and are reported per key.
    pub fn flush<T: Entity>(
        &mut self,
        backend: &mut dyn Backend,
        scope: &FlushScope,
    ) -> Result<FlushReport> {
        self.flush_entity(T::NAME, backend, scope)
    }

    fn flush_entity(
        &mut self,
        entity: &'static str,
        backend: &mut dyn Backend,
        scope: &FlushScope,
    ) -> Result<FlushReport> {
        let (table, key_column) = {
            let model = &self.registry().node(entity)?.model;
            (model.table, model.key_column)
        };
        let mut report = FlushReport {
            entity: entity.to_string(),
            ..FlushReport::default()
        };

        // removals first, so a re-inserted identity lands after its delete
        let pending: Vec<Key> = self.arena.bucket(entity).map_or_else(Vec::new, |bucket| {
            bucket
                .tombstones
                .iter()
                .filter(|key| scope.covers(key))
                .cloned()
                .collect()
        });
        for key in pending {
            let op = WriteOp::Delete {
                table: table.to_string(),
                key: (key_column.to_string(), key.to_value()),
            };
            OpCounters::bump(&mut self.counters_mut().flush_ops);
            match backend.apply(&op) {
                Ok(()) => {
                    self.arena.pop_tombstone(entity, &key);
                    report.deleted += 1;
                }
                Err(err) => report.failed.push((key, err)),
            }
        }

        let rows: Vec<(Key, usize, ProxyState)> =
            self.arena.bucket(entity).map_or_else(Vec::new, |bucket| {
                bucket
                    .index
                    .iter()
                    .filter_map(|(key, slot)| {
                        let proxy = self.arena.proxy(*slot)?;
                        (!proxy.is_hollow()
                            && proxy.state != ProxyState::Clean
                            && scope.covers(key))
                        .then(|| (key.clone(), *slot, proxy.state))
                    })
                    .collect()
            });

        for (key, slot, state) in rows {
            let ops = self.row_write_ops(entity, table, key_column, slot, &key, state)?;
            let mut failed = false;
            for op in &ops {
                OpCounters::bump(&mut self.counters_mut().flush_ops);
                if let Err(err) = backend.apply(op) {
                    report.failed.push((key.clone(), err));
                    failed = true;
                    break;
                }
            }
            if !failed {
                if let Some(proxy) = self.arena.proxy_mut(slot) {
                    proxy.state = ProxyState::Clean;
                }
                report.written += 1;
            }
        }

        Ok(report)
    }

    fn row_write_ops(
        &self,
        entity: &'static str,
        table: &'static str,
        key_column: &'static str,
        slot: usize,
        key: &Key,
        state: ProxyState,
    ) -> Result<Vec<WriteOp>> {
        let node = self.registry().node(entity)?;
        let proxy = self
            .arena
            .proxy(slot)
            .ok_or_else(|| ObjectError::invariant(format!("slot {slot} is vacant")))?;
        let value = proxy
            .value
            .as_ref()
            .ok_or_else(|| ObjectError::invariant(format!("slot {slot} is hollow")))?;

        let mut columns = Vec::new();
        for attr in &node.attributes {
            let extracted = (attr.get)(value.as_any()).ok_or_else(|| {
                ObjectError::invariant(format!(
                    "attribute capability for '{entity}.{}' did not match",
                    attr.model.name
                ))
            })?;
            columns.push((attr.model.name.to_string(), extracted));
        }

        let mut join_ops = Vec::new();
        for (index, desc) in node.endpoints.iter().enumerate() {
            let relation = (desc.read)(value.as_any()).ok_or_else(|| {
                ObjectError::invariant(format!(
                    "descriptor capability for '{entity}.{}' did not match",
                    desc.model.field
                ))
            })?;

            match desc.model.backing {
                RelationBacking::ForeignKey { column } => {
                    let targets = relation.targets();
                    columns.push((
                        column.to_string(),
                        Value::from_key(targets.first().map(crate::handle::RawPtr::key)),
                    ));
                }
                RelationBacking::JoinTable(join) => {
                    // one shared join relation; the lexically lower side
                    // of the pair owns its emission
                    let canonical = desc
                        .pair
                        .is_none_or(|pair| (entity, index) <= (pair.entity, pair.endpoint));
                    if canonical {
                        let entries = relation
                            .targets()
                            .iter()
                            .map(|raw| (join.target_column.to_string(), raw.key().to_value()))
                            .collect();
                        join_ops.push(WriteOp::Join {
                            table: join.table.to_string(),
                            owner: (join.source_column.to_string(), key.to_value()),
                            entries,
                        });
                    }
                }
                RelationBacking::Mirrored => {}
            }
        }

        for element in &node.elements {
            let scalar = (element.read)(value.as_any()).ok_or_else(|| {
                ObjectError::invariant(format!(
                    "element capability for '{entity}.{}' did not match",
                    element.model.field
                ))
            })?;
            let join = element.model.join;
            join_ops.push(WriteOp::Join {
                table: join.table.to_string(),
                owner: (join.source_column.to_string(), key.to_value()),
                entries: scalar
                    .values()
                    .into_iter()
                    .map(|v| (join.target_column.to_string(), v))
                    .collect(),
            });
        }

        let row_key = (key_column.to_string(), key.to_value());
        let head = if state == ProxyState::New {
            WriteOp::Insert {
                table: table.to_string(),
                key: row_key,
                columns,
            }
        } else {
            WriteOp::Update {
                table: table.to_string(),
                key: row_key,
                columns,
            }
        };

        let mut ops = vec![head];
        ops.extend(join_ops);
        Ok(ops)
    }

    /// Rehydrate proxies of `T` from the backend. Existing proxies keep
    /// their in-memory state (the identity map is authoritative); hollow
    /// placeholders are filled in place. Not allowed inside a
    /// transaction.
    pub fn load<T: Entity>(&mut self, backend: &mut dyn Backend) -> Result<u64> {
        self.load_entity(T::NAME, backend)
    }

    fn load_entity(&mut self, entity: &'static str, backend: &mut dyn Backend) -> Result<u64> {
        if self.in_transaction() {
            return Err(TransactionError::LoadDuringTransaction.into());
        }

        let (table, is_abstract) = {
            let model = &self.registry().node(entity)?.model;
            (model.table, model.is_abstract)
        };
        if is_abstract {
            return Err(RegistryError::AbstractType(entity.to_string()).into());
        }

        let rows: Vec<RawRow> = backend.load(table)?.collect();
        let mut loaded = 0u64;
        for row in rows {
            if self.load_row(entity, &row)? {
                loaded += 1;
            }
        }

        self.load_join_endpoints(entity, backend)?;
        OpCounters::add(&mut self.counters_mut().rows_loaded, loaded);

        Ok(loaded)
    }

    fn load_row(&mut self, entity: &'static str, row: &RawRow) -> Result<bool> {
        let key = row.key.clone();
        if key.is_unassigned() {
            return Err(ObjectError::UnassignedKey { entity }.into());
        }

        if let Some(slot) = self.arena.lookup(entity, &key)
            && self.arena.proxy(slot).is_some_and(|proxy| !proxy.is_hollow())
        {
            return Ok(false);
        }

        let mut value = {
            let node = self.registry().node(entity)?;
            (node.produce)()
        };
        value.assign_key(key.clone());
        {
            let node = self.registry().node(entity)?;
            for attr in &node.attributes {
                if let Some(column) = row.get(attr.model.name) {
                    (attr.set)(value.as_any_mut(), column);
                }
            }
        }

        let slot = match self.arena.lookup(entity, &key) {
            Some(slot) => {
                // fill the hollow placeholder and apply deferred mirrors
                let pending = {
                    let proxy = self.arena.proxy_mut(slot).ok_or_else(|| {
                        ObjectError::invariant(format!("slot {slot} is vacant"))
                    })?;
                    proxy.value = Some(value);
                    proxy.state = ProxyState::Clean;
                    std::mem::take(&mut proxy.pending_mirrors)
                };
                for mirror in pending {
                    let Self { registry, arena, .. } = &mut *self;
                    sync::with_slot_mut(
                        registry,
                        arena,
                        EndpointRef::new(mirror.entity, mirror.endpoint),
                        slot,
                        |relation| {
                            relation.put(mirror.owner);
                        },
                    )?;
                }
                slot
            }
            None => {
                self.sync_sequence(&key);
                self.arena
                    .attach(entity, key.clone(), Some(value), ProxyState::Clean)
            }
        };

        // wire foreign keys; unseen targets become hollow placeholders
        let foreign_keys: Vec<(usize, &'static str, &'static str)> = self
            .registry()
            .node(entity)?
            .endpoints
            .iter()
            .enumerate()
            .filter_map(|(index, desc)| match desc.model.backing {
                RelationBacking::ForeignKey { column } => {
                    Some((index, column, desc.model.target))
                }
                _ => None,
            })
            .collect();

        for (index, column, target_entity) in foreign_keys {
            let Some(raw_value) = row.get(column) else {
                continue;
            };
            if raw_value.is_null() {
                continue;
            }
            let Some(target_key) = Key::from_value(raw_value) else {
                continue;
            };

            let target_slot = match self.arena.lookup(target_entity, &target_key) {
                Some(existing) => existing,
                None => self
                    .arena
                    .attach(target_entity, target_key, None, ProxyState::Clean),
            };

            let ep = EndpointRef::new(entity, index);
            let Self { registry, arena, .. } = &mut *self;
            let target_raw = arena
                .proxy(target_slot)
                .map(|proxy| proxy.raw(target_slot))
                .ok_or_else(|| ObjectError::invariant(format!("slot {target_slot} is vacant")))?;
            sync::with_slot_mut(registry, arena, ep, slot, |relation| {
                relation.put(target_raw);
            })?;
            sync::wire_existing(registry, arena, ep, slot, target_slot)?;
        }

        Ok(true)
    }

    fn load_join_endpoints(
        &mut self,
        entity: &'static str,
        backend: &mut dyn Backend,
    ) -> Result<()> {
        let joins: Vec<(usize, JoinTable, &'static str)> = self
            .registry()
            .node(entity)?
            .endpoints
            .iter()
            .enumerate()
            .filter_map(|(index, desc)| match desc.model.backing {
                RelationBacking::JoinTable(join) => Some((index, join, desc.model.target)),
                _ => None,
            })
            .collect();

        for (index, join, target_entity) in joins {
            let ep = EndpointRef::new(entity, index);
            if !self.claim_join(join.table, ep) {
                continue;
            }

            let rows: Vec<RawRow> = backend.load(join.table)?.collect();
            for row in rows {
                let Some(owner_slot) = self.join_owner_slot(entity, &row, join) else {
                    continue;
                };
                let Some(target_value) = row.get(join.target_column) else {
                    continue;
                };
                let Some(target_key) = Key::from_value(target_value) else {
                    continue;
                };

                let target_slot = match self.arena.lookup(target_entity, &target_key) {
                    Some(existing) => existing,
                    None => self
                        .arena
                        .attach(target_entity, target_key, None, ProxyState::Clean),
                };

                let Self { registry, arena, .. } = &mut *self;
                let target_raw = arena
                    .proxy(target_slot)
                    .map(|proxy| proxy.raw(target_slot))
                    .ok_or_else(|| {
                        ObjectError::invariant(format!("slot {target_slot} is vacant"))
                    })?;
                sync::with_slot_mut(registry, arena, ep, owner_slot, |relation| {
                    relation.put(target_raw);
                })?;
                sync::wire_existing(registry, arena, ep, owner_slot, target_slot)?;
            }
        }

        let elements: Vec<(usize, JoinTable)> = self
            .registry()
            .node(entity)?
            .elements
            .iter()
            .enumerate()
            .map(|(index, desc)| (index, desc.model.join))
            .collect();

        for (index, join) in elements {
            if !self.claim_join(join.table, EndpointRef::new(entity, index)) {
                continue;
            }

            let rows: Vec<RawRow> = backend.load(join.table)?.collect();
            for row in rows {
                let Some(owner_slot) = self.join_owner_slot(entity, &row, join) else {
                    continue;
                };
                let Some(element_value) = row.get(join.target_column) else {
                    continue;
                };

                let Self { registry, arena, .. } = &mut *self;
                sync::with_element_mut(registry, arena, entity, index, owner_slot, |scalar| {
                    scalar.push_value(element_value);
                })?;
            }
        }

        Ok(())
    }

    fn join_owner_slot(&self, entity: &str, row: &RawRow, join: JoinTable) -> Option<usize> {
        let owner_value = row.get(join.source_column)?;
        let owner_key = Key::from_value(owner_value)?;
        self.arena.lookup(entity, &owner_key)
    }
}
