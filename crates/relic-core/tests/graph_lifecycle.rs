//! End-to-end pass over the public surface: declare a schema, mutate the
//! graph under transactions, flush through a backend and reload into a
//! fresh store.

use relic_core::{
    CommitRecord,
    backend::{Backend, FlushScope, RawRow, WriteOp},
    error::BackendError,
    prelude::*,
};
use std::collections::HashMap;

#[derive(Clone, Debug, Default, PartialEq)]
struct Invoice {
    id: u64,
    number: String,
    lines: HasMany<Line>,
}

impl Entity for Invoice {
    const NAME: &'static str = "invoice";

    fn schema(schema: &mut SchemaBuilder<Self>) {
        schema.primary_key("id");
        schema.attribute("number", |i: &Self| i.number.clone(), |i, v| i.number = v);
        schema.has_many(
            "lines",
            Cascade::All,
            |i: &Self| &i.lines,
            |i| &mut i.lines,
        );
    }

    fn key(&self) -> Key {
        Key::Uint(self.id)
    }

    fn assign_key(&mut self, key: Key) {
        if let Key::Uint(id) = key {
            self.id = id;
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
struct Line {
    id: u64,
    amount: i64,
    invoice: BelongsTo<Invoice>,
}

impl Line {
    fn amounting(amount: i64) -> Self {
        Self {
            amount,
            ..Self::default()
        }
    }
}

impl Entity for Line {
    const NAME: &'static str = "line";

    fn schema(schema: &mut SchemaBuilder<Self>) {
        schema.primary_key("id");
        schema.attribute("amount", |l: &Self| l.amount, |l, v| l.amount = v);
        schema.belongs_to(
            "invoice",
            "invoice_id",
            Cascade::None,
            |l: &Self| &l.invoice,
            |l| &mut l.invoice,
        );
    }

    fn key(&self) -> Key {
        Key::Uint(self.id)
    }

    fn assign_key(&mut self, key: Key) {
        if let Key::Uint(id) = key {
            self.id = id;
        }
    }
}

/// Minimal in-memory backend: tables of rows, writes applied eagerly.
#[derive(Default)]
struct MemoryBackend {
    tables: HashMap<String, Vec<RawRow>>,
}

impl Backend for MemoryBackend {
    fn apply(&mut self, op: &WriteOp) -> Result<(), BackendError> {
        match op {
            WriteOp::Insert { table, key, columns } | WriteOp::Update { table, key, columns } => {
                let rows = self.tables.entry(table.clone()).or_default();
                let row_key = Key::from_value(&key.1).ok_or_else(|| BackendError::MissingColumn {
                    table: table.clone(),
                    column: key.0.clone(),
                })?;
                rows.retain(|row| row.key != row_key);
                let mut row = RawRow::new(row_key);
                for (name, value) in columns {
                    row = row.column(name.clone(), value.clone());
                }
                rows.push(row);
            }
            WriteOp::Delete { table, key } => {
                if let Some(rows) = self.tables.get_mut(table)
                    && let Some(row_key) = Key::from_value(&key.1)
                {
                    rows.retain(|row| row.key != row_key);
                }
            }
            WriteOp::Join { .. } => {
                return Err(BackendError::Unsupported("join tables".to_string()));
            }
        }

        Ok(())
    }

    fn load(&mut self, table: &str) -> Result<Box<dyn Iterator<Item = RawRow>>, BackendError> {
        let rows = self.tables.get(table).cloned().unwrap_or_default();
        Ok(Box::new(rows.into_iter()))
    }
}

fn billing_store() -> ObjectStore {
    let mut store = ObjectStore::new();
    store.attach::<Invoice>("invoice").unwrap();
    store.attach::<Line>("line").unwrap();
    store
}

#[test]
fn graph_survives_flush_and_reload() {
    let mut store = billing_store();
    let mut backend = MemoryBackend::default();

    let invoice = store
        .insert(Invoice {
            number: "INV-100".to_string(),
            ..Invoice::default()
        })
        .unwrap();
    store.push_new(&invoice, "lines", Line::amounting(250)).unwrap();
    store.push_new(&invoice, "lines", Line::amounting(-40)).unwrap();

    store.flush::<Invoice>(&mut backend, &FlushScope::All).unwrap();
    store.flush::<Line>(&mut backend, &FlushScope::All).unwrap();

    let mut reloaded = billing_store();
    reloaded.load::<Line>(&mut backend).unwrap();
    reloaded.load::<Invoice>(&mut backend).unwrap();

    let invoice = reloaded.get::<Invoice>(1u64).expect("reloaded invoice");
    let value = reloaded.value(&invoice).unwrap();
    assert_eq!(value.number, "INV-100");
    assert_eq!(value.lines.len(), 2);

    let amounts: Vec<i64> = reloaded
        .view::<Line>()
        .values()
        .map(|(_, line)| line.amount)
        .collect();
    assert_eq!(amounts, vec![250, -40]);
    assert_eq!(reloaded.reference_count(&invoice).unwrap(), 2);
}

#[test]
fn rolled_back_work_never_reaches_the_backend() {
    let mut store = billing_store();
    let mut backend = MemoryBackend::default();

    store.begin();
    let invoice = store
        .insert(Invoice {
            number: "INV-draft".to_string(),
            ..Invoice::default()
        })
        .unwrap();
    store.rollback().unwrap();
    assert!(store.value(&invoice).is_err());

    store.flush::<Invoice>(&mut backend, &FlushScope::All).unwrap();
    assert!(backend.tables.get("invoice").is_none_or(Vec::is_empty));
}

#[test]
fn commit_records_describe_the_frame_for_sessions() {
    let mut store = billing_store();

    store.begin();
    let invoice = store
        .insert(Invoice {
            number: "INV-7".to_string(),
            ..Invoice::default()
        })
        .unwrap();
    store.push_new(&invoice, "lines", Line::amounting(99)).unwrap();
    let records = store.commit().unwrap();

    assert_eq!(records.len(), 2);
    assert!(matches!(
        records[0],
        CommitRecord::Inserted { entity: "invoice", .. }
    ));
    assert!(matches!(
        records[1],
        CommitRecord::Inserted { entity: "line", .. }
    ));

    // records encode for session-side tooling
    let encoded = serde_json::to_string(&records).unwrap();
    assert!(encoded.contains("invoice"));
    assert!(encoded.contains("Inserted"));
}

#[test]
fn cascading_removal_takes_dependent_lines_along() {
    let mut store = billing_store();
    let invoice = store
        .insert(Invoice {
            number: "INV-9".to_string(),
            ..Invoice::default()
        })
        .unwrap();
    let line = store.push_new(&invoice, "lines", Line::amounting(10)).unwrap();
    assert!(!store.is_removable(&invoice).unwrap());

    store.remove(&invoice).unwrap();
    assert!(store.is_empty());
    assert!(store.value(&line).is_err());
}
