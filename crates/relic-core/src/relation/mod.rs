//! Relation field types held inside entity values.
//!
//! `HasOne`, `BelongsTo`, `HasMany` and `ScalarMany` are plain data while a
//! value is being constructed; once the value is attached, every mutation
//! goes through the store so both sides of an endpoint pair stay
//! consistent. The field types expose read access and pre-insert staging
//! only; the store reaches the mutating surface through the crate-private
//! slot traits.

mod container;

pub use container::Container;

use crate::{
    handle::{ObjectPtr, RawPtr},
    schema::{Entity, ErasedEntity},
    value::{FieldValue, Value},
};
use derive_more::Deref;
use std::collections::VecDeque;
use std::fmt;

///
/// RelationSlot
///
/// Type-erased mutating surface of an entity-valued relation field,
/// reached through descriptor capabilities. Single-target endpoints treat
/// `put` as assignment; collection endpoints append.
///

pub(crate) trait RelationSlot {
    /// Currently linked targets, in slot order.
    fn targets(&self) -> Vec<RawPtr>;

    fn contains_target(&self, target: &RawPtr) -> bool;

    /// Staged (not yet inserted) values, readable for validation.
    fn staged_refs(&self) -> Vec<&dyn ErasedEntity>;

    /// Drain staged values for cascade insertion.
    fn take_staged(&mut self) -> Vec<Box<dyn ErasedEntity>>;

    /// Assign (single) or append (collection); returns the entry position.
    fn put(&mut self, target: RawPtr) -> usize;

    /// Re-insert a target at a known position (rollback of an unlink).
    fn put_at(&mut self, target: RawPtr, index: usize);

    /// Remove one occurrence of `target`, returning its position.
    fn take(&mut self, target: &RawPtr) -> Option<usize>;
}

///
/// ScalarSlot
///
/// Type-erased surface of a scalar-element collection.
///

pub(crate) trait ScalarSlot {
    fn values(&self) -> Vec<Value>;

    fn element_count(&self) -> usize;

    /// Append a converted element; `false` when the value does not convert.
    fn push_value(&mut self, value: &Value) -> bool;

    fn insert_value_at(&mut self, value: &Value, index: usize) -> bool;

    /// Remove the first element equal to `value`, returning its position.
    fn remove_value(&mut self, value: &Value) -> Option<usize>;

    /// Remove the element at a known position (rollback of a push).
    fn remove_value_at(&mut self, index: usize) -> bool;
}

///
/// Link
///
/// Shared single-target state: empty, linked to an attached proxy, or
/// holding a staged value awaiting cascade insert.
///

#[derive(Clone, PartialEq)]
pub(crate) enum Link<T> {
    None,
    To(ObjectPtr<T>),
    Staged(Box<T>),
}

impl<T> Default for Link<T> {
    fn default() -> Self {
        Self::None
    }
}

// impl_single_relation
//
// HasOne and BelongsTo share everything but their descriptor kind; the
// kind split lives in the schema builder, not in the field type.
macro_rules! impl_single_relation {
    ( $( #[$doc:meta] )* $name:ident ) => {
        $( #[$doc] )*
        #[derive(Clone, PartialEq)]
        pub struct $name<T> {
            pub(crate) link: Link<T>,
        }

        impl<T> $name<T> {
            /// Empty endpoint.
            #[must_use]
            pub const fn new() -> Self {
                Self { link: Link::None }
            }

            /// Endpoint linked to an already attached object.
            #[must_use]
            pub const fn to(target: ObjectPtr<T>) -> Self {
                Self {
                    link: Link::To(target),
                }
            }

            /// Endpoint holding a value that is not attached yet; inserted
            /// alongside the owner when the cascade permits it.
            #[must_use]
            pub fn staged(value: T) -> Self {
                Self {
                    link: Link::Staged(Box::new(value)),
                }
            }

            /// The linked target, if any.
            #[must_use]
            pub const fn target(&self) -> Option<&ObjectPtr<T>> {
                match &self.link {
                    Link::To(ptr) => Some(ptr),
                    _ => None,
                }
            }

            /// Returns `true` when nothing is linked or staged.
            #[must_use]
            pub const fn is_empty(&self) -> bool {
                matches!(self.link, Link::None)
            }

            /// Key of the linked target (foreign-key column view).
            #[must_use]
            pub const fn target_key(&self) -> Option<&crate::key::Key> {
                match &self.link {
                    Link::To(ptr) => Some(ptr.key()),
                    _ => None,
                }
            }
        }

        impl<T> Default for $name<T> {
            fn default() -> Self {
                Self::new()
            }
        }

        impl<T> fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match &self.link {
                    Link::None => write!(f, "{}(-)", stringify!($name)),
                    Link::To(ptr) => write!(f, "{}({})", stringify!($name), ptr),
                    Link::Staged(_) => write!(f, "{}(staged)", stringify!($name)),
                }
            }
        }

        impl<T: Entity> RelationSlot for $name<T> {
            fn targets(&self) -> Vec<RawPtr> {
                match &self.link {
                    Link::To(ptr) => vec![ptr.raw()],
                    _ => Vec::new(),
                }
            }

            fn contains_target(&self, target: &RawPtr) -> bool {
                matches!(&self.link, Link::To(ptr) if ptr.raw == *target)
            }

            fn staged_refs(&self) -> Vec<&dyn ErasedEntity> {
                match &self.link {
                    Link::Staged(value) => vec![value.as_ref() as &dyn ErasedEntity],
                    _ => Vec::new(),
                }
            }

            fn take_staged(&mut self) -> Vec<Box<dyn ErasedEntity>> {
                match std::mem::take(&mut self.link) {
                    Link::Staged(value) => vec![value as Box<dyn ErasedEntity>],
                    other => {
                        self.link = other;
                        Vec::new()
                    }
                }
            }

            fn put(&mut self, target: RawPtr) -> usize {
                self.link = Link::To(ObjectPtr::from_raw(target));
                0
            }

            fn put_at(&mut self, target: RawPtr, _index: usize) {
                self.link = Link::To(ObjectPtr::from_raw(target));
            }

            fn take(&mut self, target: &RawPtr) -> Option<usize> {
                if self.contains_target(target) {
                    self.link = Link::None;
                    Some(0)
                } else {
                    None
                }
            }
        }
    };
}

impl_single_relation!(
    /// Owner-held single relation; the foreign key lives on the owner row.
    HasOne
);

impl_single_relation!(
    /// Child-held back-pointer; the foreign key lives on this row.
    BelongsTo
);

///
/// HasMany
///
/// Owner-held collection endpoint. Backed either by the paired child
/// `belongs_to` foreign key (mirrored) or by a join table (many-to-many).
/// `C` selects the container shape: `Vec` (vector) or `VecDeque` (list).
///

#[derive(Clone, Deref, PartialEq)]
pub struct HasMany<T, C = Vec<ObjectPtr<T>>>
where
    C: Container<ObjectPtr<T>>,
{
    #[deref]
    pub(crate) items: C,
    pub(crate) staged: Vec<T>,
}

/// List-backed alias matching `has_many<T, std::list>` declarations.
pub type HasManyList<T> = HasMany<T, VecDeque<ObjectPtr<T>>>;

impl<T, C> HasMany<T, C>
where
    C: Container<ObjectPtr<T>>,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: C::default(),
            staged: Vec::new(),
        }
    }

    /// Record an already attached object for wiring at owner insert.
    pub fn include(&mut self, target: ObjectPtr<T>) {
        self.items.push(target);
    }

    /// Stage a value that is not attached yet; inserted alongside the
    /// owner when the cascade permits it.
    pub fn stage(&mut self, value: T) {
        self.staged.push(value);
    }

    pub fn iter(&self) -> C::Iter<'_> {
        self.items.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&ObjectPtr<T>> {
        self.items.get(index)
    }

    #[must_use]
    pub fn contains(&self, target: &ObjectPtr<T>) -> bool {
        self.items.iter().any(|item| item == target)
    }

    #[must_use]
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }
}

impl<T, C> Default for HasMany<T, C>
where
    C: Container<ObjectPtr<T>>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, C> fmt::Debug for HasMany<T, C>
where
    C: Container<ObjectPtr<T>>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HasMany(len {}, staged {})", self.len(), self.staged.len())
    }
}

impl<T, C> RelationSlot for HasMany<T, C>
where
    T: Entity,
    C: Container<ObjectPtr<T>> + 'static,
{
    fn targets(&self) -> Vec<RawPtr> {
        self.items.iter().map(ObjectPtr::raw).collect()
    }

    fn contains_target(&self, target: &RawPtr) -> bool {
        self.items.iter().any(|item| item.raw == *target)
    }

    fn staged_refs(&self) -> Vec<&dyn ErasedEntity> {
        self.staged
            .iter()
            .map(|value| value as &dyn ErasedEntity)
            .collect()
    }

    fn take_staged(&mut self) -> Vec<Box<dyn ErasedEntity>> {
        std::mem::take(&mut self.staged)
            .into_iter()
            .map(|value| Box::new(value) as Box<dyn ErasedEntity>)
            .collect()
    }

    fn put(&mut self, target: RawPtr) -> usize {
        self.items.push(ObjectPtr::from_raw(target));
        self.items.len() - 1
    }

    fn put_at(&mut self, target: RawPtr, index: usize) {
        self.items.insert_at(index, ObjectPtr::from_raw(target));
    }

    fn take(&mut self, target: &RawPtr) -> Option<usize> {
        let index = self
            .items
            .position(&mut |item: &ObjectPtr<T>| item.raw == *target)?;
        self.items.remove_at(index);
        Some(index)
    }
}

///
/// ScalarMany
///
/// Join-row backed collection of scalar elements. Elements are not
/// entities: no identity, no reference counting, only membership that the
/// flush boundary turns into join rows.
///

#[derive(Clone, Deref, PartialEq)]
pub struct ScalarMany<V, C = Vec<V>>
where
    C: Container<V>,
{
    #[deref]
    pub(crate) items: C,
    _marker: std::marker::PhantomData<fn() -> V>,
}

/// List-backed alias matching `has_many<int, std::list>` declarations.
pub type ScalarManyList<V> = ScalarMany<V, VecDeque<V>>;

impl<V, C> ScalarMany<V, C>
where
    C: Container<V>,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: C::default(),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn iter(&self) -> C::Iter<'_> {
        self.items.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&V> {
        self.items.get(index)
    }
}

impl<V, C> ScalarMany<V, C>
where
    V: PartialEq,
    C: Container<V>,
{
    #[must_use]
    pub fn contains(&self, value: &V) -> bool {
        self.items.iter().any(|item| item == value)
    }
}

impl<V, C> Default for ScalarMany<V, C>
where
    C: Container<V>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V, C> fmt::Debug for ScalarMany<V, C>
where
    C: Container<V>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScalarMany(len {})", self.len())
    }
}

impl<V, C> ScalarSlot for ScalarMany<V, C>
where
    V: FieldValue + PartialEq + 'static,
    C: Container<V> + 'static,
{
    fn values(&self) -> Vec<Value> {
        self.items.iter().map(FieldValue::to_value).collect()
    }

    fn element_count(&self) -> usize {
        self.items.len()
    }

    fn push_value(&mut self, value: &Value) -> bool {
        match V::from_value(value) {
            Some(v) => {
                self.items.push(v);
                true
            }
            None => false,
        }
    }

    fn insert_value_at(&mut self, value: &Value, index: usize) -> bool {
        match V::from_value(value) {
            Some(v) => {
                self.items.insert_at(index, v);
                true
            }
            None => false,
        }
    }

    fn remove_value(&mut self, value: &Value) -> Option<usize> {
        let index = self
            .items
            .position(&mut |item: &V| item.to_value() == *value)?;
        self.items.remove_at(index);
        Some(index)
    }

    fn remove_value_at(&mut self, index: usize) -> bool {
        self.items.remove_at(index).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Department, Employee};
    use crate::key::Key;

    fn ptr(slot: usize, key: u64) -> ObjectPtr<Department> {
        ObjectPtr::from_raw(RawPtr::new(slot, Key::Uint(key)))
    }

    #[test]
    fn single_relation_tracks_one_target() {
        let mut field: BelongsTo<Department> = BelongsTo::new();
        assert!(field.is_empty());
        assert!(field.targets().is_empty());

        field.put(RawPtr::new(1, Key::Uint(10)));
        assert_eq!(field.targets(), vec![RawPtr::new(1, Key::Uint(10))]);
        assert_eq!(field.target_key(), Some(&Key::Uint(10)));

        assert_eq!(field.take(&RawPtr::new(1, Key::Uint(10))), Some(0));
        assert!(field.is_empty());
    }

    #[test]
    fn staged_single_value_is_drained_once() {
        let mut field: HasOne<Department> = HasOne::staged(Department::named("art"));
        assert_eq!(field.staged_refs().len(), 1);

        let drained = field.take_staged();
        assert_eq!(drained.len(), 1);
        assert!(field.take_staged().is_empty());
        assert!(field.is_empty());
    }

    #[test]
    fn has_many_takes_the_first_matching_occurrence() {
        let mut field: HasMany<Department> = HasMany::new();
        field.include(ptr(1, 10));
        field.include(ptr(2, 11));
        field.include(ptr(1, 10));

        assert_eq!(field.len(), 3);
        assert_eq!(field.take(&RawPtr::new(1, Key::Uint(10))), Some(0));
        assert_eq!(field.len(), 2);
        assert!(field.contains(&ptr(1, 10)));
    }

    #[test]
    fn has_many_restores_position_on_put_at() {
        let mut field: HasManyList<Department> = HasMany::new();
        field.include(ptr(1, 10));
        field.include(ptr(2, 11));

        let index = field.take(&RawPtr::new(1, Key::Uint(10))).unwrap();
        field.put_at(RawPtr::new(1, Key::Uint(10)), index);
        assert_eq!(field.get(0), Some(&ptr(1, 10)));
    }

    #[test]
    fn staged_has_many_values_drain_in_order() {
        let mut field: HasMany<Employee> = HasMany::new();
        field.stage(Employee::named("a"));
        field.stage(Employee::named("b"));

        let drained = field.take_staged();
        assert_eq!(drained.len(), 2);
        assert_eq!(field.staged_len(), 0);
    }

    #[test]
    fn scalar_many_push_and_remove_by_value() {
        let mut field: ScalarManyList<i64> = ScalarMany::new();
        assert!(field.push_value(&Value::Int(7)));
        assert!(field.push_value(&Value::Int(90)));
        assert!(!field.push_value(&Value::Text("x".into())));

        assert_eq!(field.remove_value(&Value::Int(7)), Some(0));
        assert_eq!(field.len(), 1);
        assert!(field.contains(&90));
        assert_eq!(field.remove_value(&Value::Int(7)), None);
    }
}
