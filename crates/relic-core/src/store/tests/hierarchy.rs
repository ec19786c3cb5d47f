use crate::{
    error::{RegistryError, StoreError},
    key::Key,
    prelude::*,
    test_support::{Manager, Person},
    value::Value,
};

fn people_store() -> ObjectStore {
    let mut store = ObjectStore::new();
    store.attach_abstract::<Person>("person").unwrap();
    store.attach_subtype::<Manager, Person>("manager").unwrap();
    store
}

#[test]
fn abstract_types_hold_no_instances() {
    let mut store = people_store();
    let err = store
        .insert(Person {
            id: 0,
            name: "nobody".to_string(),
        })
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Registry(RegistryError::AbstractType(name)) if name == "person"
    ));
}

#[test]
fn hierarchy_views_cover_concrete_subtypes() {
    let mut store = people_store();
    let m1 = store.insert(Manager::named("ada", 2)).unwrap();
    store.insert(Manager::named("ben", 1)).unwrap();

    let view = store.hierarchy_view::<Person>().unwrap();
    assert_eq!(view.len(), 2);

    let rows: Vec<(String, Key)> = view
        .iter()
        .map(|proxy| (proxy.entity().to_string(), proxy.key().clone()))
        .collect();
    assert_eq!(
        rows,
        vec![
            ("manager".to_string(), Key::Uint(1)),
            ("manager".to_string(), Key::Uint(2)),
        ]
    );

    // restartable: a fresh pass sees the same records
    let first = view.iter().next().unwrap();
    assert_eq!(first.attribute("name"), Some(Value::text("ada")));
    assert_eq!(first.attribute("grade"), Some(Value::Uint(2)));
    assert_eq!(first.attribute("missing"), None);
    assert_eq!(first.reference_count(), 0);

    let typed = first.downcast::<Manager>().unwrap();
    assert_eq!(typed, m1);
    assert!(first.downcast::<Person>().is_none());
    assert_eq!(first.value::<Manager>().unwrap().grade, 2);
}

#[test]
fn typed_views_stay_per_concrete_type() {
    let mut store = people_store();
    store.insert(Manager::named("ada", 2)).unwrap();

    assert!(store.view::<Person>().is_empty());
    assert_eq!(store.view::<Manager>().len(), 1);
}

#[test]
fn hierarchy_view_requires_an_attached_anchor() {
    let store = ObjectStore::new();
    let err = store.hierarchy_view::<Person>().unwrap_err();
    assert!(matches!(
        err,
        StoreError::Registry(RegistryError::UnknownType(_))
    ));
}

#[test]
fn base_types_stay_attached_while_subtypes_exist() {
    let mut store = people_store();
    let err = store.detach::<Person>().unwrap_err();
    assert!(matches!(err, StoreError::Registry(RegistryError::TypeInUse(..))));

    store.detach::<Manager>().unwrap();
    store.detach::<Person>().unwrap();
}

// Subtype coverage: a derived prototype must re-declare the endpoints its
// base carries, since descriptor capabilities cannot cross Rust types.

#[derive(Clone, Debug, Default, PartialEq)]
struct Asset {
    id: u64,
    holder: BelongsTo<Person>,
}

impl Entity for Asset {
    const NAME: &'static str = "asset";

    fn schema(schema: &mut SchemaBuilder<Self>) {
        schema.primary_key("id");
        schema.belongs_to(
            "holder",
            "holder_id",
            Cascade::None,
            |a: &Self| &a.holder,
            |a| &mut a.holder,
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
struct Vehicle {
    id: u64,
}

impl Entity for Vehicle {
    const NAME: &'static str = "vehicle";

    fn schema(schema: &mut SchemaBuilder<Self>) {
        schema.primary_key("id");
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
struct Truck {
    id: u64,
    holder: BelongsTo<Person>,
}

impl Entity for Truck {
    const NAME: &'static str = "truck";

    fn schema(schema: &mut SchemaBuilder<Self>) {
        schema.primary_key("id");
        schema.belongs_to(
            "holder",
            "holder_id",
            Cascade::None,
            |t: &Self| &t.holder,
            |t| &mut t.holder,
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

#[test]
fn subtypes_must_cover_base_endpoints() {
    let mut store = ObjectStore::new();
    store.attach_abstract::<Person>("person").unwrap();
    store.attach_abstract::<Asset>("asset").unwrap();

    let err = store.attach_subtype::<Vehicle, Asset>("vehicle").unwrap_err();
    assert!(matches!(
        err,
        StoreError::Registry(RegistryError::SubtypeMissingEndpoint { field, .. }) if field == "holder"
    ));

    store.attach_subtype::<Truck, Asset>("truck").unwrap();
    assert_eq!(
        store.prototype::<Truck>().unwrap().parent,
        Some("asset")
    );
}
