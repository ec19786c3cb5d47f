//! Entity declaration surface.
//!
//! A type becomes storable by implementing [`Entity`] and describing its
//! fields to a [`SchemaBuilder`]. The builder turns typed accessor
//! functions into type-erased descriptor capabilities; those capabilities
//! are the only way the store, the endpoint synchronizer and the flush
//! boundary ever touch a field. There is no serialize-method reflection
//! and no runtime inheritance dispatch.

pub mod registry;

use crate::{
    handle::ObjectPtr,
    key::Key,
    model::{
        AttributeModel, Cascade, ElementModel, JoinTable, PrototypeModel, RelationBacking,
        RelationKind, RelationModel,
    },
    relation::{BelongsTo, Container, HasMany, HasOne, RelationSlot, ScalarMany, ScalarSlot},
    value::{FieldValue, Value},
};
use std::any::{Any, TypeId};

///
/// Entity
///
/// A plain value type whose field declarations double as its persistence
/// schema. `NAME` must be unique across the attached prototype set.
///

pub trait Entity: Clone + Default + PartialEq + Sized + 'static {
    const NAME: &'static str;

    /// Declare primary key, attributes and relation endpoints.
    fn schema(schema: &mut SchemaBuilder<Self>);

    /// Current primary key (the unassigned sentinel before insert).
    fn key(&self) -> Key;

    /// Called once at insert time with the provisional identity.
    fn assign_key(&mut self, key: Key);
}

///
/// ErasedEntity
///
/// Object-safe view of an [`Entity`], used wherever values of multiple
/// types flow through one code path (proxies, pre-images, staged values).
///

pub trait ErasedEntity: Any {
    fn entity_name(&self) -> &'static str;

    fn key(&self) -> Key;

    fn assign_key(&mut self, key: Key);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn clone_box(&self) -> Box<dyn ErasedEntity>;

    fn eq_box(&self, other: &dyn ErasedEntity) -> bool;
}

impl<T: Entity> ErasedEntity for T {
    fn entity_name(&self) -> &'static str {
        T::NAME
    }

    fn key(&self) -> Key {
        Entity::key(self)
    }

    fn assign_key(&mut self, key: Key) {
        Entity::assign_key(self, key);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn clone_box(&self) -> Box<dyn ErasedEntity> {
        Box::new(self.clone())
    }

    fn eq_box(&self, other: &dyn ErasedEntity) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|value| value == self)
    }
}

impl std::fmt::Debug for Box<dyn ErasedEntity> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.entity_name(), ErasedEntity::key(self.as_ref()))
    }
}

// Capability signatures produced by the builder. Lifetimes are higher
// ranked so one boxed closure serves every borrow of the erased value.
pub(crate) type SlotRead =
    Box<dyn for<'a> Fn(&'a dyn Any) -> Option<&'a dyn RelationSlot>>;
pub(crate) type SlotWrite =
    Box<dyn for<'a> Fn(&'a mut dyn Any) -> Option<&'a mut dyn RelationSlot>>;
pub(crate) type ScalarRead =
    Box<dyn for<'a> Fn(&'a dyn Any) -> Option<&'a dyn ScalarSlot>>;
pub(crate) type ScalarWrite =
    Box<dyn for<'a> Fn(&'a mut dyn Any) -> Option<&'a mut dyn ScalarSlot>>;
pub(crate) type AttributeGet = Box<dyn Fn(&dyn Any) -> Option<Value>>;
pub(crate) type AttributeSet = Box<dyn Fn(&mut dyn Any, &Value) -> bool>;

///
/// PairRef
///
/// Link to the cooperating endpoint on the foreign side, resolved by the
/// registry once both prototypes are attached.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct PairRef {
    pub entity: &'static str,
    pub endpoint: usize,
}

///
/// EndpointDescriptor
///

pub(crate) struct EndpointDescriptor {
    pub model: RelationModel,
    pub pair: Option<PairRef>,
    pub(crate) read: SlotRead,
    pub(crate) write: SlotWrite,
}

///
/// ElementDescriptor
///

pub(crate) struct ElementDescriptor {
    pub model: ElementModel,
    pub(crate) read: ScalarRead,
    pub(crate) write: ScalarWrite,
}

///
/// AttributeDescriptor
///

pub(crate) struct AttributeDescriptor {
    pub model: AttributeModel,
    pub(crate) get: AttributeGet,
    pub(crate) set: AttributeSet,
}

///
/// TypeNode
///
/// One prototype: metadata plus the descriptor capabilities for a single
/// concrete (or abstract) entity type.
///

pub(crate) struct TypeNode {
    pub model: PrototypeModel,
    pub type_id: TypeId,
    pub attributes: Vec<AttributeDescriptor>,
    pub endpoints: Vec<EndpointDescriptor>,
    pub elements: Vec<ElementDescriptor>,
    pub children: Vec<&'static str>,
    pub(crate) produce: Box<dyn Fn() -> Box<dyn ErasedEntity>>,
}

impl TypeNode {
    pub fn endpoint(&self, field: &str) -> Option<(usize, &EndpointDescriptor)> {
        self.endpoints
            .iter()
            .enumerate()
            .find(|(_, ep)| ep.model.field == field)
    }

    pub fn element(&self, field: &str) -> Option<(usize, &ElementDescriptor)> {
        self.elements
            .iter()
            .enumerate()
            .find(|(_, el)| el.model.field == field)
    }
}

///
/// SchemaBuilder
///
/// Collects the declared field list of one entity type and erases the
/// typed accessors into descriptor capabilities.
///

pub struct SchemaBuilder<T: Entity> {
    key_column: Option<&'static str>,
    attributes: Vec<AttributeDescriptor>,
    endpoints: Vec<EndpointDescriptor>,
    elements: Vec<ElementDescriptor>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Entity> SchemaBuilder<T> {
    pub(crate) fn new() -> Self {
        Self {
            key_column: None,
            attributes: Vec::new(),
            endpoints: Vec::new(),
            elements: Vec::new(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Declare the primary-key column.
    pub fn primary_key(&mut self, column: &'static str) {
        self.key_column = Some(column);
    }

    /// Declare a scalar attribute with its read/write accessors.
    pub fn attribute<V>(
        &mut self,
        name: &'static str,
        get: fn(&T) -> V,
        set: fn(&mut T, V),
    ) where
        V: FieldValue + 'static,
    {
        self.attributes.push(AttributeDescriptor {
            model: AttributeModel { name },
            get: Box::new(move |any| {
                any.downcast_ref::<T>().map(|value| get(value).to_value())
            }),
            set: Box::new(move |any, raw| {
                let Some(value) = any.downcast_mut::<T>() else {
                    return false;
                };
                match V::from_value(raw) {
                    Some(v) => {
                        set(value, v);
                        true
                    }
                    None => false,
                }
            }),
        });
    }

    /// Declare an owner-held single relation; the foreign key column lives
    /// on this entity's row.
    pub fn has_one<U: Entity>(
        &mut self,
        field: &'static str,
        column: &'static str,
        cascade: Cascade,
        get: fn(&T) -> &HasOne<U>,
        get_mut: fn(&mut T) -> &mut HasOne<U>,
    ) {
        self.push_endpoint::<U>(
            field,
            RelationKind::HasOne,
            cascade,
            RelationBacking::ForeignKey { column },
            Box::new(move |any| {
                any.downcast_ref::<T>()
                    .map(|value| get(value) as &dyn RelationSlot)
            }),
            Box::new(move |any| {
                any.downcast_mut::<T>()
                    .map(|value| get_mut(value) as &mut dyn RelationSlot)
            }),
        );
    }

    /// Declare a child-held back-pointer; the foreign key column lives on
    /// this entity's row.
    pub fn belongs_to<U: Entity>(
        &mut self,
        field: &'static str,
        column: &'static str,
        cascade: Cascade,
        get: fn(&T) -> &BelongsTo<U>,
        get_mut: fn(&mut T) -> &mut BelongsTo<U>,
    ) {
        self.push_endpoint::<U>(
            field,
            RelationKind::BelongsTo,
            cascade,
            RelationBacking::ForeignKey { column },
            Box::new(move |any| {
                any.downcast_ref::<T>()
                    .map(|value| get(value) as &dyn RelationSlot)
            }),
            Box::new(move |any| {
                any.downcast_mut::<T>()
                    .map(|value| get_mut(value) as &mut dyn RelationSlot)
            }),
        );
    }

    /// Declare a collection endpoint mirrored from the target's
    /// `belongs_to` foreign key.
    pub fn has_many<U, C>(
        &mut self,
        field: &'static str,
        cascade: Cascade,
        get: fn(&T) -> &HasMany<U, C>,
        get_mut: fn(&mut T) -> &mut HasMany<U, C>,
    ) where
        U: Entity,
        C: Container<ObjectPtr<U>> + 'static,
    {
        self.push_endpoint::<U>(
            field,
            RelationKind::HasMany,
            cascade,
            RelationBacking::Mirrored,
            Box::new(move |any| {
                any.downcast_ref::<T>()
                    .map(|value| get(value) as &dyn RelationSlot)
            }),
            Box::new(move |any| {
                any.downcast_mut::<T>()
                    .map(|value| get_mut(value) as &mut dyn RelationSlot)
            }),
        );
    }

    /// Declare a collection endpoint backed by an intermediate join
    /// relation (many-to-many). Both sides of the pair name the same join
    /// table with mirrored column roles.
    pub fn has_many_join<U, C>(
        &mut self,
        field: &'static str,
        join: JoinTable,
        cascade: Cascade,
        get: fn(&T) -> &HasMany<U, C>,
        get_mut: fn(&mut T) -> &mut HasMany<U, C>,
    ) where
        U: Entity,
        C: Container<ObjectPtr<U>> + 'static,
    {
        self.push_endpoint::<U>(
            field,
            RelationKind::HasMany,
            cascade,
            RelationBacking::JoinTable(join),
            Box::new(move |any| {
                any.downcast_ref::<T>()
                    .map(|value| get(value) as &dyn RelationSlot)
            }),
            Box::new(move |any| {
                any.downcast_mut::<T>()
                    .map(|value| get_mut(value) as &mut dyn RelationSlot)
            }),
        );
    }

    /// Declare a join-row backed collection of scalar elements.
    pub fn scalar_many<V, C>(
        &mut self,
        field: &'static str,
        join: JoinTable,
        get: fn(&T) -> &ScalarMany<V, C>,
        get_mut: fn(&mut T) -> &mut ScalarMany<V, C>,
    ) where
        V: FieldValue + PartialEq + 'static,
        C: Container<V> + 'static,
    {
        self.elements.push(ElementDescriptor {
            model: ElementModel {
                field,
                source: T::NAME,
                join,
            },
            read: Box::new(move |any| {
                any.downcast_ref::<T>()
                    .map(|value| get(value) as &dyn ScalarSlot)
            }),
            write: Box::new(move |any| {
                any.downcast_mut::<T>()
                    .map(|value| get_mut(value) as &mut dyn ScalarSlot)
            }),
        });
    }

    fn push_endpoint<U: Entity>(
        &mut self,
        field: &'static str,
        kind: RelationKind,
        cascade: Cascade,
        backing: RelationBacking,
        read: SlotRead,
        write: SlotWrite,
    ) {
        self.endpoints.push(EndpointDescriptor {
            model: RelationModel {
                field,
                kind,
                cascade,
                source: T::NAME,
                target: U::NAME,
                backing,
            },
            pair: None,
            read,
            write,
        });
    }

    pub(crate) fn into_node(
        self,
        table: &'static str,
        is_abstract: bool,
        parent: Option<&'static str>,
    ) -> Option<TypeNode> {
        let key_column = self.key_column?;

        Some(TypeNode {
            model: PrototypeModel {
                entity: T::NAME,
                table,
                is_abstract,
                parent,
                key_column,
            },
            type_id: TypeId::of::<T>(),
            attributes: self.attributes,
            endpoints: self.endpoints,
            elements: self.elements,
            children: Vec::new(),
            produce: Box::new(|| Box::new(T::default()) as Box<dyn ErasedEntity>),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Department, Employee};

    fn build<T: Entity>() -> SchemaBuilder<T> {
        let mut builder = SchemaBuilder::new();
        T::schema(&mut builder);
        builder
    }

    #[test]
    fn builder_captures_the_declared_field_list() {
        let builder = build::<Employee>();
        let node = builder.into_node("employee", false, None).unwrap();

        assert_eq!(node.model.entity, "employee");
        assert_eq!(node.model.key_column, "id");
        assert!(node.attributes.iter().any(|a| a.model.name == "name"));
        let (_, dep) = node.endpoint("department").unwrap();
        assert_eq!(dep.model.kind, RelationKind::BelongsTo);
        assert_eq!(dep.model.target, "department");
        assert!(dep.pair.is_none());
    }

    #[test]
    fn missing_primary_key_yields_no_node() {
        let builder: SchemaBuilder<Department> = SchemaBuilder::new();
        assert!(builder.into_node("department", false, None).is_none());
    }

    #[test]
    fn descriptor_capabilities_reach_the_typed_fields() {
        let builder = build::<Employee>();
        let node = builder.into_node("employee", false, None).unwrap();

        let mut value = Employee::named("george");
        let any: &mut dyn Any = &mut value;

        let attr = node
            .attributes
            .iter()
            .find(|a| a.model.name == "name")
            .unwrap();
        assert_eq!(
            (attr.get)(any),
            Some(Value::Text("george".to_string()))
        );
        assert!((attr.set)(any, &Value::Text("jane".to_string())));
        assert_eq!(value.name, "jane");

        let any: &dyn Any = &value;
        let (_, ep) = node.endpoint("department").unwrap();
        let slot = (ep.read)(any).unwrap();
        assert!(slot.targets().is_empty());
    }

    #[test]
    fn foreign_type_capabilities_decline_gracefully() {
        let builder = build::<Employee>();
        let node = builder.into_node("employee", false, None).unwrap();

        let wrong = Department::named("art");
        let any: &dyn Any = &wrong;
        let (_, ep) = node.endpoint("department").unwrap();
        assert!((ep.read)(any).is_none());
    }
}
