use crate::{
    error::RegistryError,
    model::{RelationBacking, RelationKind},
    schema::{Entity, PairRef, SchemaBuilder, TypeNode},
};
use std::any::TypeId;
use std::collections::HashMap;

///
/// TypeRegistry
///
/// The prototype registry: one node per attached entity type, carrying the
/// metadata and descriptor capabilities captured at attach time. Nodes form
/// a flat forest; subtype nodes record their parent for hierarchy views.
///

#[derive(Default)]
pub struct TypeRegistry {
    nodes: HashMap<&'static str, TypeNode>,
    by_type: HashMap<TypeId, &'static str>,
    order: Vec<&'static str>,
}

impl TypeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a concrete leaf type.
    pub fn attach<T: Entity>(&mut self, table: &'static str) -> Result<(), RegistryError> {
        self.attach_with::<T>(table, false, None)
    }

    /// Register a type that anchors a hierarchy but holds no instances.
    pub fn attach_abstract<T: Entity>(&mut self, table: &'static str) -> Result<(), RegistryError> {
        self.attach_with::<T>(table, true, None)
    }

    /// Register a concrete subtype below an already attached base.
    pub fn attach_subtype<D: Entity, B: Entity>(
        &mut self,
        table: &'static str,
    ) -> Result<(), RegistryError> {
        self.attach_with::<D>(table, false, Some(B::NAME))
    }

    fn attach_with<T: Entity>(
        &mut self,
        table: &'static str,
        is_abstract: bool,
        parent: Option<&'static str>,
    ) -> Result<(), RegistryError> {
        if self.nodes.contains_key(T::NAME) || self.by_type.contains_key(&TypeId::of::<T>()) {
            return Err(RegistryError::DuplicateType(T::NAME.to_string()));
        }

        if let Some(parent_name) = parent
            && !self.nodes.contains_key(parent_name)
        {
            return Err(RegistryError::UnknownParent(parent_name.to_string()));
        }

        let mut builder = SchemaBuilder::<T>::new();
        T::schema(&mut builder);
        let node = builder
            .into_node(table, is_abstract, parent)
            .ok_or_else(|| RegistryError::MissingPrimaryKey(T::NAME.to_string()))?;

        if let Some(parent_name) = parent {
            self.validate_subtype(&node, parent_name)?;
        }

        if let Some(parent_name) = parent
            && let Some(parent_node) = self.nodes.get_mut(parent_name)
        {
            parent_node.children.push(T::NAME);
        }

        self.by_type.insert(TypeId::of::<T>(), T::NAME);
        self.order.push(T::NAME);
        self.nodes.insert(T::NAME, node);

        self.resolve_pairs()
    }

    /// A subtype must cover every endpoint its base declares: same field,
    /// same kind, same target. The base's capabilities cannot reach the
    /// derived struct, so coverage is re-declared rather than inherited.
    fn validate_subtype(&self, node: &TypeNode, parent: &'static str) -> Result<(), RegistryError> {
        let mut base = Some(parent);
        while let Some(base_name) = base {
            let Some(base_node) = self.nodes.get(base_name) else {
                break;
            };
            for base_ep in &base_node.endpoints {
                let covered = node.endpoints.iter().any(|ep| {
                    ep.model.field == base_ep.model.field
                        && ep.model.kind == base_ep.model.kind
                        && ep.model.target == base_ep.model.target
                });
                if !covered {
                    return Err(RegistryError::SubtypeMissingEndpoint {
                        derived: node.model.entity.to_string(),
                        base: base_name.to_string(),
                        field: base_ep.model.field.to_string(),
                    });
                }
            }
            base = base_node.model.parent;
        }

        Ok(())
    }

    /// Remove a prototype. The store layer is responsible for checking
    /// live proxies first; the registry checks schema-level usage.
    pub fn detach(&mut self, name: &str) -> Result<(), RegistryError> {
        let node = self
            .nodes
            .get(name)
            .ok_or_else(|| RegistryError::UnknownType(name.to_string()))?;

        if !node.children.is_empty() {
            return Err(RegistryError::TypeInUse(
                name.to_string(),
                format!("{} attached subtype(s)", node.children.len()),
            ));
        }

        for other in self.nodes.values() {
            if other.model.entity == name {
                continue;
            }
            if let Some(ep) = other
                .endpoints
                .iter()
                .find(|ep| ep.model.target == name)
            {
                return Err(RegistryError::TypeInUse(
                    name.to_string(),
                    format!("endpoint '{}.{}' targets it", other.model.entity, ep.model.field),
                ));
            }
        }

        let Some(node) = self.nodes.remove(name) else {
            return Err(RegistryError::UnknownType(name.to_string()));
        };
        self.by_type.remove(&node.type_id);
        self.order.retain(|n| *n != name);
        if let Some(parent) = node.model.parent
            && let Some(parent_node) = self.nodes.get_mut(parent)
        {
            parent_node.children.retain(|child| *child != name);
        }

        Ok(())
    }

    /// Resolve endpoint pairs for every still-unpaired endpoint. Pairing
    /// is by (target type, kind compatibility); two candidates on the
    /// foreign side make the schema ambiguous.
    fn resolve_pairs(&mut self) -> Result<(), RegistryError> {
        let mut resolved: Vec<(PairRef, PairRef)> = Vec::new();

        for node in self.nodes.values() {
            let source_name = node.model.entity;
            for (index, ep) in node.endpoints.iter().enumerate() {
                if ep.pair.is_some() {
                    continue;
                }
                let Some(target_node) = self.nodes.get(ep.model.target) else {
                    continue;
                };

                let mut candidates = target_node.endpoints.iter().enumerate().filter(
                    |(foreign_index, foreign)| {
                        if foreign.model.target != source_name {
                            return false;
                        }
                        // a self-referential endpoint never pairs with itself
                        if source_name == ep.model.target && *foreign_index == index {
                            return false;
                        }
                        pair_compatible(
                            ep.model.kind,
                            &ep.model.backing,
                            foreign.model.kind,
                            &foreign.model.backing,
                        )
                    },
                );

                let first = candidates.next();
                if candidates.next().is_some() {
                    return Err(RegistryError::AmbiguousPair {
                        source: source_name.to_string(),
                        field: ep.model.field.to_string(),
                        target: ep.model.target.to_string(),
                    });
                }

                if let Some((foreign_index, _)) = first {
                    resolved.push((
                        PairRef {
                            entity: source_name,
                            endpoint: index,
                        },
                        PairRef {
                            entity: ep.model.target,
                            endpoint: foreign_index,
                        },
                    ));
                }
            }
        }

        for (a, b) in resolved {
            if let Some(node) = self.nodes.get_mut(a.entity) {
                node.endpoints[a.endpoint].pair = Some(b);
            }
            if let Some(node) = self.nodes.get_mut(b.entity) {
                node.endpoints[b.endpoint].pair = Some(a);
            }
        }

        Ok(())
    }

    pub(crate) fn node(&self, name: &str) -> Result<&TypeNode, RegistryError> {
        self.nodes
            .get(name)
            .ok_or_else(|| RegistryError::UnknownType(name.to_string()))
    }

    pub(crate) fn get(&self, name: &str) -> Option<&TypeNode> {
        self.nodes.get(name)
    }

    pub(crate) fn node_of<T: Entity>(&self) -> Result<&TypeNode, RegistryError> {
        self.node(T::NAME)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Attached entity names, in attach order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.order.iter().copied()
    }

    pub(crate) fn nodes(&self) -> impl Iterator<Item = &TypeNode> + '_ {
        self.order.iter().filter_map(|name| self.nodes.get(name))
    }

    /// An entity name plus every (transitive) subtype, parents first.
    pub(crate) fn subtree(&self, name: &'static str) -> Vec<&'static str> {
        let mut out = vec![name];
        let mut cursor = 0;
        while cursor < out.len() {
            if let Some(node) = self.nodes.get(out[cursor]) {
                out.extend(node.children.iter().copied());
            }
            cursor += 1;
        }
        out
    }
}

fn pair_compatible(
    kind: RelationKind,
    backing: &RelationBacking,
    foreign_kind: RelationKind,
    foreign_backing: &RelationBacking,
) -> bool {
    match (kind, foreign_kind) {
        // child foreign key mirrored by the owner's collection or matched
        // by an owning has_one (one-to-one)
        (RelationKind::BelongsTo, RelationKind::HasMany) => {
            matches!(foreign_backing, RelationBacking::Mirrored)
        }
        (RelationKind::HasMany, RelationKind::BelongsTo) => {
            matches!(backing, RelationBacking::Mirrored)
        }
        (RelationKind::BelongsTo, RelationKind::HasOne)
        | (RelationKind::HasOne, RelationKind::BelongsTo) => true,
        // many-to-many over one shared join relation with mirrored columns
        (RelationKind::HasMany, RelationKind::HasMany) => match (backing, foreign_backing) {
            (RelationBacking::JoinTable(a), RelationBacking::JoinTable(b)) => {
                a.table == b.table
                    && a.source_column == b.target_column
                    && a.target_column == b.source_column
            }
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Course, Department, Employee, Manager, Person, Student};

    fn registry_with_department_schema() -> TypeRegistry {
        let mut registry = TypeRegistry::new();
        registry.attach::<Department>("department").unwrap();
        registry.attach::<Employee>("employee").unwrap();
        registry
    }

    #[test]
    fn duplicate_attach_is_rejected() {
        let mut registry = registry_with_department_schema();
        let err = registry.attach::<Department>("department2").unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateType(name) if name == "department"));
    }

    #[test]
    fn belongs_to_pairs_with_the_mirrored_has_many() {
        let registry = registry_with_department_schema();

        let employee = registry.node("employee").unwrap();
        let (_, dep) = employee.endpoint("department").unwrap();
        assert_eq!(
            dep.pair,
            Some(PairRef {
                entity: "department",
                endpoint: 0
            })
        );

        let department = registry.node("department").unwrap();
        let (_, employees) = department.endpoint("employees").unwrap();
        assert_eq!(employees.pair.map(|p| p.entity), Some("employee"));
    }

    #[test]
    fn join_backed_endpoints_pair_across_the_shared_table() {
        let mut registry = TypeRegistry::new();
        registry.attach::<Student>("student").unwrap();
        registry.attach::<Course>("course").unwrap();

        let course = registry.node("course").unwrap();
        let (_, students) = course.endpoint("students").unwrap();
        assert_eq!(students.pair.map(|p| p.entity), Some("student"));

        let student = registry.node("student").unwrap();
        let (_, courses) = student.endpoint("courses").unwrap();
        assert_eq!(courses.pair.map(|p| p.entity), Some("course"));
    }

    #[test]
    fn detach_refuses_targeted_types() {
        let mut registry = registry_with_department_schema();

        let err = registry.detach("department").unwrap_err();
        assert!(matches!(err, RegistryError::TypeInUse(name, _) if name == "department"));

        registry.detach("employee").unwrap();
        registry.detach("department").unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn subtype_registration_builds_the_hierarchy() {
        let mut registry = TypeRegistry::new();
        registry.attach_abstract::<Person>("person").unwrap();
        registry.attach_subtype::<Manager, Person>("manager").unwrap();

        assert_eq!(registry.subtree("person"), vec!["person", "manager"]);
        let manager = registry.node("manager").unwrap();
        assert_eq!(manager.model.parent, Some("person"));

        let err = registry.detach("person").unwrap_err();
        assert!(matches!(err, RegistryError::TypeInUse(..)));
    }

    #[test]
    fn unknown_parent_is_rejected() {
        let mut registry = TypeRegistry::new();
        let err = registry
            .attach_subtype::<Manager, Person>("manager")
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownParent(_)));
    }
}
