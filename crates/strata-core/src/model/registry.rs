use crate::model::{
    EntityId, EntityModel, FieldDef, FieldId, FieldKind, FieldModel, TriggerTree,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::atomic::{AtomicU64, Ordering},
};
use thiserror::Error as ThisError;

// Monotonic schema identity; two registries never share a version, which is
// what lets optimized domains short-circuit on re-optimization.
static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

///
/// SchemaError
///

#[derive(Debug, ThisError)]
pub enum SchemaError {
    #[error("duplicate entity '{name}'")]
    DuplicateEntity { name: String },

    #[error("duplicate field '{entity}.{name}'")]
    DuplicateField { entity: String, name: String },

    #[error("unknown entity '{name}'")]
    UnknownEntity { name: String },

    #[error("unknown field '{entity}.{name}'")]
    UnknownField { entity: String, name: String },

    #[error("invalid dependency '{path}' of field '{field}': {reason}")]
    BadDependency {
        field: String,
        path: String,
        reason: String,
    },

    #[error("one2many field '{field}' has no many2one inverse '{inverse}' on '{comodel}'")]
    BadInverse {
        field: String,
        inverse: String,
        comodel: String,
    },

    #[error("inherited field '{field}' does not delegate to a valid parent")]
    BadInherited { field: String },
}

///
/// SchemaBuilder
///
/// Explicit registration surface for a schema. All entities and fields are
/// declared up front; `build` resolves relations and dependencies into a
/// read-only `SchemaRegistry`.
///

#[derive(Default)]
pub struct SchemaBuilder {
    entities: Vec<EntityDecl>,
}

struct EntityDecl {
    name: String,
    parent_field: String,
    fields: Vec<FieldDef>,
}

impl SchemaBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a new entity and return its builder.
    pub fn entity(&mut self, name: impl Into<String>) -> EntityBuilder<'_> {
        self.entities.push(EntityDecl {
            name: name.into(),
            parent_field: "parent_id".to_string(),
            fields: Vec::new(),
        });
        EntityBuilder {
            decl: self.entities.last_mut().expect("just pushed"),
        }
    }

    pub fn build(self) -> Result<SchemaRegistry, SchemaError> {
        let mut registry = SchemaRegistry {
            version: NEXT_VERSION.fetch_add(1, Ordering::Relaxed),
            entities: Vec::new(),
            entity_ids: BTreeMap::new(),
            fields: Vec::new(),
            trigger_trees: BTreeMap::new(),
        };

        // first pass: assign entity and field ids
        for decl in &self.entities {
            let entity_id = EntityId(u32::try_from(registry.entities.len()).expect("entity count"));
            if registry
                .entity_ids
                .insert(decl.name.clone(), entity_id)
                .is_some()
            {
                return Err(SchemaError::DuplicateEntity {
                    name: decl.name.clone(),
                });
            }
            let mut fields = BTreeMap::new();
            for def in &decl.fields {
                let field_id = FieldId(u32::try_from(registry.fields.len()).expect("field count"));
                if fields.insert(def.name.clone(), field_id).is_some() {
                    return Err(SchemaError::DuplicateField {
                        entity: decl.name.clone(),
                        name: def.name.clone(),
                    });
                }
                registry.fields.push(FieldModel {
                    entity: entity_id,
                    name: def.name.clone(),
                    kind: def.kind.clone(),
                    stored: def.stored,
                    compute: def.compute.clone(),
                    search: def.search.clone(),
                    depends: def.depends.clone(),
                    depends_context: def.depends_context.clone(),
                    recursive: def.recursive,
                    inherited: def.inherited.clone(),
                });
            }
            let parent_path_field = fields.get("parent_path").copied().filter(|id| {
                let field = &registry.fields[id.index()];
                field.stored && field.kind == FieldKind::Text
            });
            registry.entities.push(EntityModel {
                name: decl.name.clone(),
                parent_field: decl.parent_field.clone(),
                parent_path_field,
                fields,
            });
        }

        registry.validate_relations()?;
        let triggers = registry.resolve_dependencies()?;
        registry.build_trigger_trees(&triggers);

        Ok(registry)
    }
}

///
/// EntityBuilder
///

pub struct EntityBuilder<'a> {
    decl: &'a mut EntityDecl,
}

impl EntityBuilder<'_> {
    /// Override the hierarchy relation (defaults to `parent_id`).
    #[must_use]
    pub fn parent_field(self, name: impl Into<String>) -> Self {
        self.decl.parent_field = name.into();
        self
    }

    #[must_use]
    pub fn field(self, def: FieldDef) -> Self {
        self.decl.fields.push(def);
        self
    }
}

///
/// SchemaRegistry
///
/// Read-only schema handle: entity/field resolution, dependency triggers and
/// the schema version used to short-circuit re-optimization. Built once,
/// never mutated.
///

pub struct SchemaRegistry {
    version: u64,
    entities: Vec<EntityModel>,
    entity_ids: BTreeMap<String, EntityId>,
    fields: Vec<FieldModel>,
    trigger_trees: BTreeMap<FieldId, TriggerTree>,
}

impl SchemaRegistry {
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    pub fn entity_id(&self, name: &str) -> Result<EntityId, SchemaError> {
        self.entity_ids
            .get(name)
            .copied()
            .ok_or_else(|| SchemaError::UnknownEntity {
                name: name.to_string(),
            })
    }

    #[must_use]
    pub fn entity(&self, id: EntityId) -> &EntityModel {
        &self.entities[id.index()]
    }

    pub fn field_id(&self, entity: EntityId, name: &str) -> Result<FieldId, SchemaError> {
        self.entity(entity)
            .field_id(name)
            .ok_or_else(|| SchemaError::UnknownField {
                entity: self.entity(entity).name.clone(),
                name: name.to_string(),
            })
    }

    #[must_use]
    pub fn field(&self, id: FieldId) -> &FieldModel {
        &self.fields[id.index()]
    }

    /// Entity the comodel of a relational field resolves to.
    pub fn comodel_id(&self, field: FieldId) -> Result<EntityId, SchemaError> {
        let model = self.field(field);
        let comodel = model
            .kind
            .comodel()
            .ok_or_else(|| SchemaError::UnknownEntity {
                name: format!("<comodel of {}>", model.name),
            })?;
        self.entity_id(comodel)
    }

    /// Human-readable `entity.field` label for diagnostics.
    #[must_use]
    pub fn qualified_name(&self, field: FieldId) -> String {
        let model = self.field(field);
        format!("{}.{}", self.entity(model.entity).name, model.name)
    }

    /// Trigger tree to traverse when `field` changes, if anything depends
    /// on it.
    #[must_use]
    pub fn trigger_tree(&self, field: FieldId) -> Option<&TriggerTree> {
        self.trigger_trees.get(&field)
    }

    /// All fields that transitively depend on `field`.
    pub fn dependent_fields(&self, field: FieldId) -> impl Iterator<Item = FieldId> + '_ {
        self.trigger_tree(field)
            .into_iter()
            .flat_map(|tree| tree.depth_first())
            .flat_map(|node| node.root.iter().copied())
    }

    fn validate_relations(&self) -> Result<(), SchemaError> {
        for field in &self.fields {
            match &field.kind {
                FieldKind::ManyToOne { comodel } | FieldKind::ManyToMany { comodel } => {
                    self.entity_id(comodel)?;
                }
                FieldKind::OneToMany { comodel, inverse } => {
                    let comodel_id = self.entity_id(comodel)?;
                    let inverse_id = self.field_id(comodel_id, inverse).map_err(|_| {
                        SchemaError::BadInverse {
                            field: field.name.clone(),
                            inverse: inverse.clone(),
                            comodel: comodel.clone(),
                        }
                    })?;
                    if !matches!(self.field(inverse_id).kind, FieldKind::ManyToOne { .. }) {
                        return Err(SchemaError::BadInverse {
                            field: field.name.clone(),
                            inverse: inverse.clone(),
                            comodel: comodel.clone(),
                        });
                    }
                }
                _ => {}
            }
            if let Some((parent_field, parent_entity)) = &field.inherited {
                let ok = self.entity_id(parent_entity).is_ok_and(|parent_id| {
                    self.field_id(parent_id, &field.name).is_ok()
                }) && self.field_id(field.entity, parent_field).is_ok();
                if !ok {
                    return Err(SchemaError::BadInherited {
                        field: field.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Resolve every field's dependency paths into the trigger map:
    /// dependency field -> reversed relation path -> dependent fields.
    ///
    /// Every path prefix is itself a dependency: `a.b.c` triggers on `a`,
    /// `a.b` and `a.b.c`. A one2many segment also yields its many2one
    /// inverse, so writes on the comodel side propagate.
    fn resolve_dependencies(
        &mut self,
    ) -> Result<TriggerMap, SchemaError> {
        let mut triggers: TriggerMap = BTreeMap::new();

        for field_index in 0..self.fields.len() {
            let field_id = FieldId(u32::try_from(field_index).expect("field count"));
            let (field_name, entity, depends) = {
                let field = &self.fields[field_index];
                (field.name.clone(), field.entity, field.depends.clone())
            };

            for path in &depends {
                let mut seq: Vec<FieldId> = Vec::new();
                let mut model = entity;
                for (index, segment) in path.split('.').enumerate() {
                    let seg_id = self.field_id(model, segment).map_err(|_| {
                        SchemaError::BadDependency {
                            field: field_name.clone(),
                            path: path.clone(),
                            reason: format!(
                                "field '{segment}' not found on '{}'",
                                self.entity(model).name
                            ),
                        }
                    })?;

                    if seg_id == field_id && index > 0 && !self.fields[field_index].recursive {
                        log::warn!(
                            "field '{}' depends on itself through '{path}'; \
                             treating it as recursive",
                            self.qualified_name(field_id),
                        );
                        self.fields[field_index].recursive = true;
                    }

                    seq.push(seg_id);

                    // a field does not trigger itself on its own records
                    if !(seg_id == field_id && index == 0) {
                        Self::record_trigger(&mut triggers, &seq, field_id);
                    }

                    let seg = self.field(seg_id).kind.clone();
                    match seg {
                        FieldKind::OneToMany { comodel, inverse } => {
                            let comodel_id = self.entity_id(&comodel)?;
                            let inverse_id = self.field_id(comodel_id, &inverse)?;
                            let mut with_inverse = seq.clone();
                            with_inverse.push(inverse_id);
                            Self::record_trigger(&mut triggers, &with_inverse, field_id);
                            model = comodel_id;
                        }
                        FieldKind::ManyToOne { comodel }
                        | FieldKind::ManyToMany { comodel } => {
                            model = self.entity_id(&comodel)?;
                        }
                        _ if path.split('.').count() > index + 1 => {
                            return Err(SchemaError::BadDependency {
                                field: field_name.clone(),
                                path: path.clone(),
                                reason: format!("'{segment}' is not relational"),
                            });
                        }
                        _ => {}
                    }
                }
            }
        }

        Ok(triggers)
    }

    fn record_trigger(triggers: &mut TriggerMap, seq: &[FieldId], dependent: FieldId) {
        let (dep, path) = seq.split_last().expect("non-empty dependency");
        let mut reversed: Vec<FieldId> = path.to_vec();
        reversed.reverse();
        triggers
            .entry(*dep)
            .or_default()
            .entry(reversed)
            .or_default()
            .insert(dependent);
    }

    /// Expand the direct trigger map into one transitive tree per trigger
    /// key. The seen-guard stops the closure on recursive fields.
    fn build_trigger_trees(&mut self, triggers: &TriggerMap) {
        for field in triggers.keys() {
            let mut closure = Vec::new();
            self.transitive_triggers(triggers, *field, &[], &mut vec![], &mut closure);

            let mut tree = TriggerTree::default();
            for (path, targets) in closure {
                let mut node = &mut tree;
                for label in path {
                    node = node.increase(label);
                }
                node.root.extend(targets);
            }
            self.trigger_trees.insert(*field, tree);
        }
    }

    fn transitive_triggers(
        &self,
        triggers: &TriggerMap,
        field: FieldId,
        prefix: &[FieldId],
        seen: &mut Vec<FieldId>,
        out: &mut Vec<(Vec<FieldId>, BTreeSet<FieldId>)>,
    ) {
        if seen.contains(&field) {
            return;
        }
        let Some(paths) = triggers.get(&field) else {
            return;
        };
        seen.push(field);
        for (path, targets) in paths {
            let full_path = self.concat_paths(prefix, path);
            out.push((full_path.clone(), targets.clone()));
            for target in targets {
                self.transitive_triggers(triggers, *target, &full_path, seen, out);
            }
        }
        seen.pop();
    }

    /// Concatenate two relation paths, collapsing an adjacent many2one /
    /// one2many inverse pair: traversing a relation backward and immediately
    /// forward again lands on the same records.
    fn concat_paths(&self, seq1: &[FieldId], seq2: &[FieldId]) -> Vec<FieldId> {
        if let (Some(f1), Some(f2)) = (seq1.last(), seq2.first()) {
            let m1 = self.field(*f1);
            let m2 = self.field(*f2);
            if let (
                FieldKind::ManyToOne { comodel },
                FieldKind::OneToMany { comodel: co2, inverse },
            ) = (&m1.kind, &m2.kind)
                && *inverse == m1.name
                && self.entity(m1.entity).name == *co2
                && self.entity(m2.entity).name == *comodel
            {
                return self.concat_paths(&seq1[..seq1.len() - 1], &seq2[1..]);
            }
        }
        let mut out = seq1.to_vec();
        out.extend_from_slice(seq2);
        out
    }
}

type TriggerMap = BTreeMap<FieldId, BTreeMap<Vec<FieldId>, BTreeSet<FieldId>>>;

///
/// TESTS
///

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_schema;

    #[test]
    fn versions_are_unique_per_build() {
        let a = sample_schema();
        let b = sample_schema();
        assert_ne!(a.version(), b.version());
    }

    #[test]
    fn resolves_entities_and_fields() {
        let schema = sample_schema();
        let partner = schema.entity_id("partner").unwrap();
        let name = schema.field_id(partner, "name").unwrap();
        assert_eq!(schema.field(name).name, "name");
        assert!(schema.field_id(partner, "nope").is_err());
        assert!(schema.entity_id("nope").is_err());
    }

    #[test]
    fn direct_dependency_triggers_dependent() {
        let schema = sample_schema();
        let order = schema.entity_id("order").unwrap();
        let amount = schema.field_id(order, "amount").unwrap();
        let total = schema.field_id(order, "total").unwrap();

        let dependents: Vec<_> = schema.dependent_fields(amount).collect();
        assert!(dependents.contains(&total), "total depends on amount");
    }

    #[test]
    fn relational_dependency_creates_edge() {
        let schema = sample_schema();
        let order = schema.entity_id("order").unwrap();
        let partner = schema.entity_id("partner").unwrap();
        let partner_name = schema.field_id(partner, "name").unwrap();
        let label = schema.field_id(order, "partner_id").unwrap();
        let display = schema.field_id(order, "display_label").unwrap();

        // changing partner.name must reach order.display_label through the
        // partner_id edge
        let tree = schema.trigger_tree(partner_name).expect("tree");
        let edge: Vec<_> = tree.edges().collect();
        assert_eq!(edge.len(), 1);
        assert_eq!(edge[0].0, label);
        assert!(edge[0].1.root.contains(&display));
    }

    #[test]
    fn recursive_dependency_is_flagged_and_terminates() {
        let schema = sample_schema();
        let category = schema.entity_id("category").unwrap();
        let full_name = schema.field_id(category, "full_name").unwrap();

        assert!(schema.field(full_name).recursive);
        // the closure over the self-referential dependency must terminate
        let name = schema.field_id(category, "name").unwrap();
        let dependents: Vec<_> = schema.dependent_fields(name).collect();
        assert!(dependents.contains(&full_name));
    }

    #[test]
    fn unknown_dependency_segment_fails_build() {
        let mut builder = SchemaBuilder::new();
        builder.entity("thing").field(
            crate::model::FieldDef::new("bad", FieldKind::Int).computed(
                &["missing.path"],
                std::sync::Arc::new(|_, _| Ok(())),
            ),
        );
        assert!(matches!(
            builder.build(),
            Err(SchemaError::BadDependency { .. })
        ));
    }
}
