use crate::{
    error::{ObjectError, RelationError, StoreError},
    key::Key,
    prelude::*,
    test_support::{
        Author, Biography, Course, Department, Employee, Player, Playlist, Student, Team,
        company_store, school_store,
    },
};

#[test]
fn department_scenario() {
    // attach department (has_many employees) / employee (belongs_to
    // department); insert D, E; E.dep(D)
    let mut store = company_store();
    let d = store.insert(Department::named("research")).unwrap();
    let e = store.insert(Employee::named("george")).unwrap();

    store.set_one(&e, "department", &d).unwrap();

    assert_eq!(store.value(&d).unwrap().employees.len(), 1);
    assert_eq!(store.reference_count(&d).unwrap(), 1);
    assert_eq!(store.reference_count(&e).unwrap(), 0);
    assert!(!store.is_removable(&d).unwrap());
    assert!(store.is_removable(&e).unwrap());

    store.remove(&e).unwrap();
    assert_eq!(store.value(&d).unwrap().employees.len(), 0);
    assert_eq!(store.reference_count(&d).unwrap(), 0);
}

#[test]
fn pushing_from_the_owner_side_is_equivalent() {
    let mut store = company_store();
    let d = store.insert(Department::named("research")).unwrap();
    let e = store.insert(Employee::named("george")).unwrap();

    store.push_many(&d, "employees", &e).unwrap();

    assert_eq!(store.value(&e).unwrap().department.target(), Some(&d));
    assert_eq!(store.reference_count(&d).unwrap(), 1);
    assert_eq!(store.reference_count(&e).unwrap(), 0);
}

#[test]
fn mirrored_membership_is_not_duplicated() {
    let mut store = company_store();
    let d = store.insert(Department::named("research")).unwrap();
    let e = store.insert(Employee::named("george")).unwrap();

    store.push_many(&d, "employees", &e).unwrap();
    store.push_many(&d, "employees", &e).unwrap();

    assert_eq!(store.value(&d).unwrap().employees.len(), 1);
    assert_eq!(store.reference_count(&d).unwrap(), 1);
}

#[test]
fn reassignment_moves_the_membership() {
    let mut store = company_store();
    let d1 = store.insert(Department::named("research")).unwrap();
    let d2 = store.insert(Department::named("sales")).unwrap();
    let e = store.insert(Employee::named("george")).unwrap();

    store.set_one(&e, "department", &d1).unwrap();
    store.set_one(&e, "department", &d2).unwrap();

    assert_eq!(store.value(&d1).unwrap().employees.len(), 0);
    assert_eq!(store.value(&d2).unwrap().employees.len(), 1);
    assert_eq!(store.reference_count(&d1).unwrap(), 0);
    assert_eq!(store.reference_count(&d2).unwrap(), 1);
}

#[test]
fn pushing_claims_the_member_from_its_previous_owner() {
    let mut store = company_store();
    let d1 = store.insert(Department::named("research")).unwrap();
    let d2 = store.insert(Department::named("sales")).unwrap();
    let e = store.insert(Employee::named("george")).unwrap();
    store.set_one(&e, "department", &d1).unwrap();

    store.push_many(&d2, "employees", &e).unwrap();

    assert_eq!(store.value(&d1).unwrap().employees.len(), 0);
    assert_eq!(store.value(&e).unwrap().department.target(), Some(&d2));
    assert_eq!(store.reference_count(&d1).unwrap(), 0);
    assert_eq!(store.reference_count(&d2).unwrap(), 1);
}

#[test]
fn assigning_the_current_target_is_a_noop() {
    let mut store = company_store();
    let d = store.insert(Department::named("research")).unwrap();
    let e = store.insert(Employee::named("george")).unwrap();

    store.set_one(&e, "department", &d).unwrap();
    store.set_one(&e, "department", &d).unwrap();

    assert_eq!(store.value(&d).unwrap().employees.len(), 1);
    assert_eq!(store.reference_count(&d).unwrap(), 1);
    assert_eq!(store.metrics().links, 1);
}

#[test]
fn clearing_restores_the_reference_count() {
    // A.ref = B; A.ref = null restores B's count
    let mut store = ObjectStore::new();
    store.attach::<Author>("author").unwrap();
    store.attach::<Biography>("biography").unwrap();

    let author = store.insert(Author::named("iain")).unwrap();
    let bio = store.insert(Biography::of("born 1954")).unwrap();
    assert_eq!(store.reference_count(&bio).unwrap(), 0);

    store.set_one(&author, "bio", &bio).unwrap();
    assert_eq!(store.reference_count(&bio).unwrap(), 1);
    // the paired belongs_to holds a foreign key back at the author
    assert_eq!(store.reference_count(&author).unwrap(), 1);
    assert_eq!(store.value(&bio).unwrap().author.target(), Some(&author));

    store.clear_one(&author, "bio").unwrap();
    assert_eq!(store.reference_count(&bio).unwrap(), 0);
    assert_eq!(store.reference_count(&author).unwrap(), 0);
    assert!(store.value(&bio).unwrap().author.is_empty());
}

#[test]
fn many_to_many_membership_is_visible_from_both_sides() {
    let mut store = school_store();
    let tom = store.insert(Student::named("tom")).unwrap();
    let art = store.insert(Course::titled("art")).unwrap();

    store.push_many(&art, "students", &tom).unwrap();

    assert!(store.value(&art).unwrap().students.contains(&tom));
    assert!(store.value(&tom).unwrap().courses.contains(&art));
    // the shared join row references both sides
    assert_eq!(store.reference_count(&tom).unwrap(), 1);
    assert_eq!(store.reference_count(&art).unwrap(), 1);

    store.remove_many(&art, "students", &tom).unwrap();
    assert!(store.value(&art).unwrap().students.is_empty());
    assert!(store.value(&tom).unwrap().courses.is_empty());
    assert_eq!(store.reference_count(&tom).unwrap(), 0);
    assert_eq!(store.reference_count(&art).unwrap(), 0);
}

#[test]
fn many_to_many_pushes_agree_across_initiating_sides() {
    let mut store = school_store();
    let tom = store.insert(Student::named("tom")).unwrap();
    let art = store.insert(Course::titled("art")).unwrap();
    store.push_many(&art, "students", &tom).unwrap();

    let mut mirror = school_store();
    let tom2 = mirror.insert(Student::named("tom")).unwrap();
    let art2 = mirror.insert(Course::titled("art")).unwrap();
    mirror.push_many(&tom2, "courses", &art2).unwrap();

    assert_eq!(
        store.reference_count(&tom).unwrap(),
        mirror.reference_count(&tom2).unwrap()
    );
    assert_eq!(
        store.reference_count(&art).unwrap(),
        mirror.reference_count(&art2).unwrap()
    );
    assert!(mirror.value(&art2).unwrap().students.contains(&tom2));
    assert!(mirror.value(&tom2).unwrap().courses.contains(&art2));
}

#[test]
fn removal_is_blocked_while_references_remain() {
    let mut store = company_store();
    let d = store.insert(Department::named("research")).unwrap();
    let e = store.insert(Employee::named("george")).unwrap();
    store.set_one(&e, "department", &d).unwrap();

    let err = store.remove(&d).unwrap_err();
    assert!(matches!(
        err,
        StoreError::Object(ObjectError::NotRemovable {
            entity: "department",
            count: 1,
            ..
        })
    ));
    // validate-then-apply: nothing changed
    assert_eq!(store.value(&d).unwrap().employees.len(), 1);
    assert_eq!(store.count::<Department>(), 1);
}

#[test]
fn staged_values_require_cascade_insert() {
    let mut store = company_store();
    let mut dep = Department::named("research");
    dep.employees.stage(Employee::named("george"));

    // department.employees carries cascade NONE
    let err = store.insert(dep).unwrap_err();
    assert!(matches!(
        err,
        StoreError::Relation(RelationError::UnattachedReference {
            entity: "department",
            ..
        })
    ));
    assert!(store.is_empty());
}

#[test]
fn cascade_insert_wires_the_staged_graph() {
    let mut store = ObjectStore::new();
    store.attach::<Author>("author").unwrap();
    store.attach::<Biography>("biography").unwrap();

    let mut author = Author::named("iain");
    author.bio = HasOne::staged(Biography::of("born 1954"));

    let author = store.insert(author).unwrap();
    let bio = store.get::<Biography>(2u64).expect("cascade-inserted");

    assert_eq!(store.value(&author).unwrap().bio.target(), Some(&bio));
    assert_eq!(store.value(&bio).unwrap().author.target(), Some(&author));
    assert_eq!(store.reference_count(&bio).unwrap(), 1);
    assert_eq!(store.metrics().cascade_inserts, 1);
}

#[test]
fn push_new_respects_the_endpoint_cascade() {
    let mut store = company_store();
    let d = store.insert(Department::named("research")).unwrap();

    let err = store
        .push_new(&d, "employees", Employee::named("george"))
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Relation(RelationError::UnattachedReference { .. })
    ));
    assert_eq!(store.count::<Employee>(), 0);
}

#[test]
fn set_new_replaces_and_keeps_the_old_target_attached() {
    let mut store = ObjectStore::new();
    store.attach::<Author>("author").unwrap();
    store.attach::<Biography>("biography").unwrap();
    let author = store.insert(Author::named("iain")).unwrap();

    let first = store
        .set_new(&author, "bio", Biography::of("draft"))
        .unwrap();
    let second = store
        .set_new(&author, "bio", Biography::of("final"))
        .unwrap();

    assert_eq!(store.value(&author).unwrap().bio.target(), Some(&second));
    assert_eq!(store.reference_count(&first).unwrap(), 0);
    assert!(store.value(&first).unwrap().author.is_empty());
    assert_eq!(store.count::<Biography>(), 2);
}

#[test]
fn cascade_delete_removes_the_dependent_side_first() {
    let mut store = ObjectStore::new();
    store.attach::<Author>("author").unwrap();
    store.attach::<Biography>("biography").unwrap();

    let author = store.insert(Author::named("iain")).unwrap();
    let bio = store.set_new(&author, "bio", Biography::of("born 1954")).unwrap();
    assert_eq!(store.reference_count(&author).unwrap(), 1);

    store.remove(&author).unwrap();
    assert_eq!(store.count::<Author>(), 0);
    assert_eq!(store.count::<Biography>(), 0);
    assert!(store.value(&bio).is_err());
    assert_eq!(store.metrics().cascade_deletes, 1);
}

#[test]
fn field_addressing_is_checked() {
    let mut store = company_store();
    let d = store.insert(Department::named("research")).unwrap();
    let d2 = store.insert(Department::named("sales")).unwrap();
    let e = store.insert(Employee::named("george")).unwrap();

    let err = store.set_one(&d, "employees", &e).unwrap_err();
    assert!(matches!(
        err,
        StoreError::Relation(RelationError::KindMismatch { .. })
    ));

    let err = store.push_many(&d, "employees", &d2).unwrap_err();
    assert!(matches!(
        err,
        StoreError::Relation(RelationError::TargetMismatch { .. })
    ));

    let err = store.set_one(&e, "boss", &d).unwrap_err();
    assert!(matches!(
        err,
        StoreError::Relation(RelationError::UnknownField { .. })
    ));
}

#[test]
fn stale_targets_are_unattached_references() {
    let mut store = company_store();
    let d = store.insert(Department::named("research")).unwrap();
    let e = store.insert(Employee::named("george")).unwrap();
    store.remove(&d).unwrap();

    let err = store.set_one(&e, "department", &d).unwrap_err();
    assert!(matches!(
        err,
        StoreError::Relation(RelationError::UnattachedReference { .. })
    ));

    // the same applies to pointers carried by inserted values
    let d2 = store.insert(Department::named("sales")).unwrap();
    store.remove(&d2).unwrap();
    let err = store
        .insert(Employee::in_department("jane", d2))
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Relation(RelationError::UnattachedReference { .. })
    ));
}

#[test]
fn insert_wires_populated_relation_fields() {
    let mut store = company_store();
    let d = store.insert(Department::named("research")).unwrap();

    let e = store
        .insert(Employee::in_department("george", d.clone()))
        .unwrap();

    assert_eq!(store.value(&d).unwrap().employees.len(), 1);
    assert_eq!(store.reference_count(&d).unwrap(), 1);
    assert_eq!(store.value(&e).unwrap().department.target(), Some(&d));
}

#[test]
fn scalar_elements_push_and_remove_by_value() {
    // has_many<int, list>: push 7, push 90, remove 7
    let mut store = ObjectStore::new();
    store.attach::<Playlist>("playlist").unwrap();
    let p = store.insert(Playlist::named("mix")).unwrap();

    store.push_element(&p, "track_ids", 7i64).unwrap();
    store.push_element(&p, "track_ids", 90i64).unwrap();
    store.remove_element(&p, "track_ids", 7i64).unwrap();

    let value = store.value(&p).unwrap();
    assert_eq!(value.track_ids.len(), 1);
    assert_eq!(value.track_ids.get(0), Some(&90));

    let err = store.remove_element(&p, "track_ids", 7i64).unwrap_err();
    assert!(matches!(
        err,
        StoreError::Relation(RelationError::ElementNotFound { .. })
    ));

    let err = store
        .push_element(&p, "track_ids", "seven".to_string())
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Relation(RelationError::ElementMismatch { .. })
    ));

    let err = store.set_one(&p, "track_ids", &p).unwrap_err();
    assert!(matches!(
        err,
        StoreError::Relation(RelationError::KindMismatch { .. })
    ));
}

#[test]
fn list_backed_collections_share_the_semantics() {
    let mut store = ObjectStore::new();
    store.attach::<Team>("team").unwrap();
    store.attach::<Player>("player").unwrap();

    let team = store.insert(Team::named("reds")).unwrap();
    let a = store.insert(Player::named("ada")).unwrap();
    let b = store.insert(Player::named("ben")).unwrap();

    store.push_many(&team, "players", &a).unwrap();
    store.push_many(&team, "players", &b).unwrap();
    assert_eq!(store.reference_count(&team).unwrap(), 2);

    store.remove_many(&team, "players", &a).unwrap();
    let value = store.value(&team).unwrap();
    assert_eq!(value.players.len(), 1);
    assert_eq!(value.players.get(0), Some(&b));
    assert!(store.value(&a).unwrap().team.is_empty());
    assert_eq!(store.reference_count(&team).unwrap(), 1);
}

#[test]
fn remove_unlinked_member_is_reported() {
    let mut store = company_store();
    let d = store.insert(Department::named("research")).unwrap();
    let e = store.insert(Employee::named("george")).unwrap();

    let err = store.remove_many(&d, "employees", &e).unwrap_err();
    assert!(matches!(
        err,
        StoreError::Relation(RelationError::TargetNotLinked { key: Key::Uint(2), .. })
    ));
}
