//! Shared fixtures for the unit and scenario suites: a small company
//! schema, a many-to-many enrollment schema, cascade-owning pairs, and a
//! recording backend double.

use crate::{
    backend::{Backend, RawRow, WriteOp},
    error::BackendError,
    key::Key,
    model::{Cascade, JoinTable},
    relation::{BelongsTo, HasMany, HasManyList, HasOne, ScalarManyList},
    schema::{Entity, SchemaBuilder},
    store::ObjectStore,
};
use std::collections::{HashMap, HashSet};

fn uint_key(id: u64) -> Key {
    Key::Uint(id)
}

fn take_uint(target: &mut u64, key: Key) {
    if let Key::Uint(value) = key {
        *target = value;
    }
}

///
/// Department / Employee: the classic one-to-many pair.
///

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Department {
    pub id: u64,
    pub name: String,
    pub employees: HasMany<Employee>,
}

impl Department {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

impl Entity for Department {
    const NAME: &'static str = "department";

    fn schema(schema: &mut SchemaBuilder<Self>) {
        schema.primary_key("id");
        schema.attribute("name", |d: &Self| d.name.clone(), |d, v| d.name = v);
        schema.has_many(
            "employees",
            Cascade::None,
            |d: &Self| &d.employees,
            |d| &mut d.employees,
        );
    }

    fn key(&self) -> Key {
        uint_key(self.id)
    }

    fn assign_key(&mut self, key: Key) {
        take_uint(&mut self.id, key);
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Employee {
    pub id: u64,
    pub name: String,
    pub department: BelongsTo<Department>,
}

impl Employee {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn in_department(name: &str, department: crate::handle::ObjectPtr<Department>) -> Self {
        Self {
            name: name.to_string(),
            department: BelongsTo::to(department),
            ..Self::default()
        }
    }
}

impl Entity for Employee {
    const NAME: &'static str = "employee";

    fn schema(schema: &mut SchemaBuilder<Self>) {
        schema.primary_key("id");
        schema.attribute("name", |e: &Self| e.name.clone(), |e, v| e.name = v);
        schema.belongs_to(
            "department",
            "department_id",
            Cascade::None,
            |e: &Self| &e.department,
            |e| &mut e.department,
        );
    }

    fn key(&self) -> Key {
        uint_key(self.id)
    }

    fn assign_key(&mut self, key: Key) {
        take_uint(&mut self.id, key);
    }
}

///
/// Team / Player: the same shape with a list-backed collection.
///

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Team {
    pub id: u64,
    pub name: String,
    pub players: HasManyList<Player>,
}

impl Team {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

impl Entity for Team {
    const NAME: &'static str = "team";

    fn schema(schema: &mut SchemaBuilder<Self>) {
        schema.primary_key("id");
        schema.attribute("name", |t: &Self| t.name.clone(), |t, v| t.name = v);
        schema.has_many(
            "players",
            Cascade::None,
            |t: &Self| &t.players,
            |t| &mut t.players,
        );
    }

    fn key(&self) -> Key {
        uint_key(self.id)
    }

    fn assign_key(&mut self, key: Key) {
        take_uint(&mut self.id, key);
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Player {
    pub id: u64,
    pub name: String,
    pub team: BelongsTo<Team>,
}

impl Player {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

impl Entity for Player {
    const NAME: &'static str = "player";

    fn schema(schema: &mut SchemaBuilder<Self>) {
        schema.primary_key("id");
        schema.attribute("name", |p: &Self| p.name.clone(), |p, v| p.name = v);
        schema.belongs_to(
            "team",
            "team_id",
            Cascade::None,
            |p: &Self| &p.team,
            |p| &mut p.team,
        );
    }

    fn key(&self) -> Key {
        uint_key(self.id)
    }

    fn assign_key(&mut self, key: Key) {
        take_uint(&mut self.id, key);
    }
}

///
/// Student / Course: many-to-many over one join relation.
///

pub const ENROLLMENT: JoinTable = JoinTable::new("student_course", "student_id", "course_id");
pub const ENROLLMENT_MIRROR: JoinTable =
    JoinTable::new("student_course", "course_id", "student_id");

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Student {
    pub id: u64,
    pub name: String,
    pub courses: HasMany<Course>,
}

impl Student {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

impl Entity for Student {
    const NAME: &'static str = "student";

    fn schema(schema: &mut SchemaBuilder<Self>) {
        schema.primary_key("id");
        schema.attribute("name", |s: &Self| s.name.clone(), |s, v| s.name = v);
        schema.has_many_join(
            "courses",
            ENROLLMENT,
            Cascade::None,
            |s: &Self| &s.courses,
            |s| &mut s.courses,
        );
    }

    fn key(&self) -> Key {
        uint_key(self.id)
    }

    fn assign_key(&mut self, key: Key) {
        take_uint(&mut self.id, key);
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Course {
    pub id: u64,
    pub title: String,
    pub students: HasMany<Student>,
}

impl Course {
    pub fn titled(title: &str) -> Self {
        Self {
            title: title.to_string(),
            ..Self::default()
        }
    }
}

impl Entity for Course {
    const NAME: &'static str = "course";

    fn schema(schema: &mut SchemaBuilder<Self>) {
        schema.primary_key("id");
        schema.attribute("title", |c: &Self| c.title.clone(), |c, v| c.title = v);
        schema.has_many_join(
            "students",
            ENROLLMENT_MIRROR,
            Cascade::None,
            |c: &Self| &c.students,
            |c| &mut c.students,
        );
    }

    fn key(&self) -> Key {
        uint_key(self.id)
    }

    fn assign_key(&mut self, key: Key) {
        take_uint(&mut self.id, key);
    }
}

///
/// Author / Biography: cascade-owning one-to-one.
///

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Author {
    pub id: u64,
    pub name: String,
    pub bio: HasOne<Biography>,
}

impl Author {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

impl Entity for Author {
    const NAME: &'static str = "author";

    fn schema(schema: &mut SchemaBuilder<Self>) {
        schema.primary_key("id");
        schema.attribute("name", |a: &Self| a.name.clone(), |a, v| a.name = v);
        schema.has_one(
            "bio",
            "bio_id",
            Cascade::All,
            |a: &Self| &a.bio,
            |a| &mut a.bio,
        );
    }

    fn key(&self) -> Key {
        uint_key(self.id)
    }

    fn assign_key(&mut self, key: Key) {
        take_uint(&mut self.id, key);
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Biography {
    pub id: u64,
    pub text: String,
    pub author: BelongsTo<Author>,
}

impl Biography {
    pub fn of(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Self::default()
        }
    }
}

impl Entity for Biography {
    const NAME: &'static str = "biography";

    fn schema(schema: &mut SchemaBuilder<Self>) {
        schema.primary_key("id");
        schema.attribute("text", |b: &Self| b.text.clone(), |b, v| b.text = v);
        schema.belongs_to(
            "author",
            "author_id",
            Cascade::None,
            |b: &Self| &b.author,
            |b| &mut b.author,
        );
    }

    fn key(&self) -> Key {
        uint_key(self.id)
    }

    fn assign_key(&mut self, key: Key) {
        take_uint(&mut self.id, key);
    }
}

///
/// Playlist: scalar elements in a list-backed container.
///

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Playlist {
    pub id: u64,
    pub name: String,
    pub track_ids: ScalarManyList<i64>,
}

impl Playlist {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

impl Entity for Playlist {
    const NAME: &'static str = "playlist";

    fn schema(schema: &mut SchemaBuilder<Self>) {
        schema.primary_key("id");
        schema.attribute("name", |p: &Self| p.name.clone(), |p, v| p.name = v);
        schema.scalar_many(
            "track_ids",
            JoinTable::new("playlist_track", "playlist_id", "track_id"),
            |p: &Self| &p.track_ids,
            |p| &mut p.track_ids,
        );
    }

    fn key(&self) -> Key {
        uint_key(self.id)
    }

    fn assign_key(&mut self, key: Key) {
        take_uint(&mut self.id, key);
    }
}

///
/// Person hierarchy: abstract base with a concrete subtype.
///

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Person {
    pub id: u64,
    pub name: String,
}

impl Entity for Person {
    const NAME: &'static str = "person";

    fn schema(schema: &mut SchemaBuilder<Self>) {
        schema.primary_key("id");
        schema.attribute("name", |p: &Self| p.name.clone(), |p, v| p.name = v);
    }

    fn key(&self) -> Key {
        uint_key(self.id)
    }

    fn assign_key(&mut self, key: Key) {
        take_uint(&mut self.id, key);
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Manager {
    pub id: u64,
    pub name: String,
    pub grade: u32,
}

impl Manager {
    pub fn named(name: &str, grade: u32) -> Self {
        Self {
            name: name.to_string(),
            grade,
            ..Self::default()
        }
    }
}

impl Entity for Manager {
    const NAME: &'static str = "manager";

    fn schema(schema: &mut SchemaBuilder<Self>) {
        schema.primary_key("id");
        schema.attribute("name", |m: &Self| m.name.clone(), |m, v| m.name = v);
        schema.attribute("grade", |m: &Self| m.grade, |m, v| m.grade = v);
    }

    fn key(&self) -> Key {
        uint_key(self.id)
    }

    fn assign_key(&mut self, key: Key) {
        take_uint(&mut self.id, key);
    }
}

///
/// Tag: text-keyed entity.
///

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Tag {
    pub code: String,
    pub label: String,
}

impl Tag {
    pub fn new(code: &str, label: &str) -> Self {
        Self {
            code: code.to_string(),
            label: label.to_string(),
        }
    }
}

impl Entity for Tag {
    const NAME: &'static str = "tag";

    fn schema(schema: &mut SchemaBuilder<Self>) {
        schema.primary_key("code");
        schema.attribute("label", |t: &Self| t.label.clone(), |t, v| t.label = v);
    }

    fn key(&self) -> Key {
        Key::Text(self.code.clone())
    }

    fn assign_key(&mut self, key: Key) {
        if let Key::Text(code) = key {
            self.code = code;
        }
    }
}

///
/// RecordingBackend
///
/// Test double: records applied writes, serves canned rows, and can be
/// told to reject whole tables.
///

#[derive(Default)]
pub struct RecordingBackend {
    pub ops: Vec<WriteOp>,
    pub rows: HashMap<String, Vec<RawRow>>,
    pub fail_tables: HashSet<String>,
}

impl RecordingBackend {
    pub fn with_rows(table: &str, rows: Vec<RawRow>) -> Self {
        let mut backend = Self::default();
        backend.rows.insert(table.to_string(), rows);
        backend
    }

    pub fn add_rows(&mut self, table: &str, rows: Vec<RawRow>) {
        self.rows.entry(table.to_string()).or_default().extend(rows);
    }

    pub fn fail_table(&mut self, table: &str) {
        self.fail_tables.insert(table.to_string());
    }

    pub fn ops_for(&self, table: &str) -> Vec<&WriteOp> {
        self.ops.iter().filter(|op| op.table() == table).collect()
    }
}

impl Backend for RecordingBackend {
    fn apply(&mut self, op: &WriteOp) -> Result<(), BackendError> {
        if self.fail_tables.contains(op.table()) {
            return Err(BackendError::Rejected {
                table: op.table().to_string(),
                reason: "rejected by test configuration".to_string(),
            });
        }
        self.ops.push(op.clone());
        Ok(())
    }

    fn load(&mut self, table: &str) -> Result<Box<dyn Iterator<Item = RawRow>>, BackendError> {
        let rows = self.rows.get(table).cloned().unwrap_or_default();
        Ok(Box::new(rows.into_iter()))
    }
}

/// Store with the company pair attached.
pub fn company_store() -> ObjectStore {
    let mut store = ObjectStore::new();
    store.attach::<Department>("department").unwrap();
    store.attach::<Employee>("employee").unwrap();
    store
}

/// Store with the enrollment pair attached.
pub fn school_store() -> ObjectStore {
    let mut store = ObjectStore::new();
    store.attach::<Student>("student").unwrap();
    store.attach::<Course>("course").unwrap();
    store
}
