//! In-memory fixtures shared by the unit tests: a `RecordStore` over
//! `RefCell` tables and a small sample schema exercising every field shape.

use crate::{
    domain::{Condition, ConditionValue, Domain, Operator},
    model::{
        ComputeHandler, EntityId, FieldDef, FieldId, FieldKind, SchemaBuilder, SchemaRegistry,
        SearchHandler,
    },
    recompute::RecomputeError,
    store::{RecordStore, StoreError},
    value::{RecordId, Value, ValueList},
};
use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

///
/// MemoryStore
///

#[derive(Debug, Default)]
pub(crate) struct MemoryStore {
    // entity -> record -> field name -> value
    rows: RefCell<BTreeMap<String, BTreeMap<RecordId, BTreeMap<String, Value>>>>,
    // journal of persisted writes: (qualified field, record, value)
    persisted: RefCell<Vec<(String, RecordId, Value)>>,
}

impl MemoryStore {
    pub(crate) fn seed(&self, entity: &str, id: u64, values: &[(&str, Value)]) {
        let mut rows = self.rows.borrow_mut();
        let record = rows
            .entry(entity.to_string())
            .or_default()
            .entry(RecordId(id))
            .or_default();
        for (name, value) in values {
            record.insert((*name).to_string(), value.clone());
        }
    }

    pub(crate) fn remove(&self, entity: &str, id: u64) {
        if let Some(records) = self.rows.borrow_mut().get_mut(entity) {
            records.remove(&RecordId(id));
        }
    }

    pub(crate) fn stored_value(&self, entity: &str, field: &str, id: u64) -> Option<Value> {
        self.rows
            .borrow()
            .get(entity)
            .and_then(|records| records.get(&RecordId(id)))
            .and_then(|record| record.get(field))
            .cloned()
    }

    pub(crate) fn persisted_log(&self) -> Vec<(String, RecordId, Value)> {
        self.persisted.borrow().clone()
    }

    fn entity_name(registry: &SchemaRegistry, field: FieldId) -> (String, String) {
        let model = registry.field(field);
        (
            registry.entity(model.entity).name.clone(),
            model.name.clone(),
        )
    }

    fn matches(record: &BTreeMap<String, Value>, id: RecordId, domain: &Domain) -> bool {
        match domain {
            Domain::True => true,
            Domain::False => false,
            Domain::Not(child) => !Self::matches(record, id, child),
            Domain::And(nary) => nary
                .children
                .iter()
                .all(|child| Self::matches(record, id, child)),
            Domain::Or(nary) => nary
                .children
                .iter()
                .any(|child| Self::matches(record, id, child)),
            Domain::Condition(cond) => Self::matches_condition(record, id, cond),
        }
    }

    fn matches_condition(
        record: &BTreeMap<String, Value>,
        id: RecordId,
        cond: &Condition,
    ) -> bool {
        let current = if cond.path == "id" {
            Value::Id(id)
        } else {
            record.get(&cond.path).cloned().unwrap_or(Value::Null)
        };
        let ConditionValue::Value(expected) = &cond.value else {
            return false;
        };
        match cond.operator {
            Operator::Eq => current == *expected,
            Operator::Ne => current != *expected,
            Operator::In => matches!(expected, Value::List(list) if list.contains(&current)),
            Operator::NotIn => matches!(expected, Value::List(list) if !list.contains(&current)),
            Operator::Like | Operator::Ilike => {
                let (Value::Text(haystack), Value::Text(pattern)) = (&current, expected) else {
                    return false;
                };
                let (haystack, pattern) = if cond.operator == Operator::Ilike {
                    (haystack.to_lowercase(), pattern.to_lowercase())
                } else {
                    (haystack.clone(), pattern.clone())
                };
                haystack.contains(pattern.trim_matches('%'))
            }
            _ => false,
        }
    }
}

impl RecordStore for MemoryStore {
    fn fetch(
        &self,
        registry: &SchemaRegistry,
        field: FieldId,
        ids: &[RecordId],
    ) -> Result<Vec<(RecordId, Value)>, StoreError> {
        let (entity, name) = Self::entity_name(registry, field);
        let model = registry.field(field);
        let rows = self.rows.borrow();

        // one2many values are derived from the comodel's inverse column
        if let FieldKind::OneToMany { comodel, inverse } = &model.kind {
            let comodel_rows = rows.get(comodel.as_str());
            let records = rows.get(&entity);
            return Ok(ids
                .iter()
                .filter(|id| records.is_some_and(|r| r.contains_key(id)))
                .map(|id| {
                    let related: ValueList = comodel_rows
                        .map(|records| {
                            records
                                .iter()
                                .filter(|(_, record)| {
                                    record.get(inverse.as_str()) == Some(&Value::Id(*id))
                                })
                                .map(|(rid, _)| Value::Id(*rid))
                                .collect()
                        })
                        .unwrap_or_default();
                    (*id, Value::List(related))
                })
                .collect());
        }

        let Some(records) = rows.get(&entity) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| {
                records.get(id).map(|record| {
                    (*id, record.get(&name).cloned().unwrap_or(Value::Null))
                })
            })
            .collect())
    }

    fn exists(
        &self,
        registry: &SchemaRegistry,
        entity: EntityId,
        ids: &[RecordId],
    ) -> Result<BTreeSet<RecordId>, StoreError> {
        let name = &registry.entity(entity).name;
        let rows = self.rows.borrow();
        let records = rows.get(name.as_str());
        Ok(ids
            .iter()
            .copied()
            .filter(|id| records.is_some_and(|r| r.contains_key(id)))
            .collect())
    }

    fn records_referencing(
        &self,
        registry: &SchemaRegistry,
        relation: FieldId,
        targets: &BTreeSet<RecordId>,
    ) -> Result<BTreeSet<RecordId>, StoreError> {
        let (entity, name) = Self::entity_name(registry, relation);
        let rows = self.rows.borrow();
        let Some(records) = rows.get(&entity) else {
            return Ok(BTreeSet::new());
        };
        Ok(records
            .iter()
            .filter(|(_, record)| match record.get(&name) {
                Some(Value::Id(target)) => targets.contains(target),
                Some(Value::List(list)) => list
                    .iter()
                    .any(|value| matches!(value, Value::Id(target) if targets.contains(target))),
                _ => false,
            })
            .map(|(id, _)| *id)
            .collect())
    }

    fn search_ids(
        &self,
        registry: &SchemaRegistry,
        entity: EntityId,
        domain: &Domain,
    ) -> Result<Vec<RecordId>, StoreError> {
        let name = &registry.entity(entity).name;
        let rows = self.rows.borrow();
        let Some(records) = rows.get(name.as_str()) else {
            return Ok(Vec::new());
        };
        Ok(records
            .iter()
            .filter(|(id, record)| Self::matches(record, **id, domain))
            .map(|(id, _)| *id)
            .collect())
    }

    fn persist(
        &self,
        registry: &SchemaRegistry,
        field: FieldId,
        values: &[(RecordId, Value)],
    ) -> Result<(), StoreError> {
        let (entity, name) = Self::entity_name(registry, field);
        let qualified = registry.qualified_name(field);
        let mut rows = self.rows.borrow_mut();
        let records = rows.entry(entity).or_default();
        let mut journal = self.persisted.borrow_mut();
        for (id, value) in values {
            records
                .entry(*id)
                .or_default()
                .insert(name.clone(), value.clone());
            journal.push((qualified.clone(), *id, value.clone()));
        }
        Ok(())
    }
}

///
/// Sample schema
///
/// partner:  name, age, active, display_name, category_id,
///           greeting (computed, non-stored, lang-dependent),
///           adult (non-stored, searchable)
/// order:    partner_id, amount, confirmed_at, line_ids,
///           total (computed from amount),
///           display_label (computed through partner_id.name),
///           qty_total (computed from line_ids.qty)
/// line:     order_id, qty
/// category: name, parent_id, full_name (recursive)
/// employee: partner_id, name (inherited from partner)
/// folder:   name, parent_id, parent_path (materialized hierarchy)
///

pub(crate) fn sample_schema() -> SchemaRegistry {
    let mut builder = SchemaBuilder::new();

    builder
        .entity("partner")
        .field(FieldDef::new("name", FieldKind::Text))
        .field(FieldDef::new("age", FieldKind::Int))
        .field(FieldDef::new("active", FieldKind::Bool))
        .field(FieldDef::new("display_name", FieldKind::Text))
        .field(FieldDef::new(
            "category_id",
            FieldKind::ManyToOne {
                comodel: "category".to_string(),
            },
        ))
        .field(
            FieldDef::new("greeting", FieldKind::Text)
                .non_stored()
                .computed(&["name"], compute_greeting())
                .context_dependent(&["lang"]),
        )
        .field(
            FieldDef::new("adult", FieldKind::Bool)
                .non_stored()
                .searchable(search_adult()),
        );

    builder
        .entity("order")
        .field(FieldDef::new(
            "partner_id",
            FieldKind::ManyToOne {
                comodel: "partner".to_string(),
            },
        ))
        .field(FieldDef::new("amount", FieldKind::Int))
        .field(FieldDef::new("confirmed_at", FieldKind::DateTime))
        .field(FieldDef::new(
            "line_ids",
            FieldKind::OneToMany {
                comodel: "line".to_string(),
                inverse: "order_id".to_string(),
            },
        ))
        .field(FieldDef::new("total", FieldKind::Int).computed(&["amount"], compute_total()))
        .field(
            FieldDef::new("display_label", FieldKind::Text)
                .computed(&["partner_id.name"], compute_display_label()),
        )
        .field(
            FieldDef::new("qty_total", FieldKind::Int)
                .computed(&["line_ids.qty"], compute_qty_total()),
        );

    builder
        .entity("line")
        .field(FieldDef::new(
            "order_id",
            FieldKind::ManyToOne {
                comodel: "order".to_string(),
            },
        ))
        .field(FieldDef::new("qty", FieldKind::Int));

    builder
        .entity("category")
        .field(FieldDef::new("name", FieldKind::Text))
        .field(FieldDef::new(
            "parent_id",
            FieldKind::ManyToOne {
                comodel: "category".to_string(),
            },
        ))
        .field(
            FieldDef::new("full_name", FieldKind::Text)
                .computed(&["name", "parent_id.full_name"], compute_full_name())
                .recursive(),
        );

    builder
        .entity("employee")
        .field(FieldDef::new(
            "partner_id",
            FieldKind::ManyToOne {
                comodel: "partner".to_string(),
            },
        ))
        .field(FieldDef::new("name", FieldKind::Text).inherited_from("partner_id", "partner"));

    builder
        .entity("folder")
        .field(FieldDef::new("name", FieldKind::Text))
        .field(FieldDef::new(
            "parent_id",
            FieldKind::ManyToOne {
                comodel: "folder".to_string(),
            },
        ))
        .field(FieldDef::new("parent_path", FieldKind::Text));

    builder.build().expect("sample schema is valid")
}

fn text_of(value: &Value) -> String {
    match value {
        Value::Text(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn compute_total() -> ComputeHandler {
    Arc::new(|scope, ids| {
        let registry = scope.registry();
        let order = registry
            .entity_id("order")
            .map_err(|err| RecomputeError::handler(err.to_string()))?;
        let amount = registry
            .field_id(order, "amount")
            .map_err(|err| RecomputeError::handler(err.to_string()))?;
        for id in ids {
            let value = match scope.get(amount, *id)? {
                Value::Int(n) => n * 2,
                _ => 0,
            };
            scope.set(*id, Value::Int(value))?;
        }
        Ok(())
    })
}

fn compute_display_label() -> ComputeHandler {
    Arc::new(|scope, ids| {
        let registry = scope.registry();
        let order = registry
            .entity_id("order")
            .map_err(|err| RecomputeError::handler(err.to_string()))?;
        let partner = registry
            .entity_id("partner")
            .map_err(|err| RecomputeError::handler(err.to_string()))?;
        let partner_id = registry
            .field_id(order, "partner_id")
            .map_err(|err| RecomputeError::handler(err.to_string()))?;
        let partner_name = registry
            .field_id(partner, "name")
            .map_err(|err| RecomputeError::handler(err.to_string()))?;
        for id in ids {
            let label = match scope.get(partner_id, *id)? {
                Value::Id(pid) => format!("order for {}", text_of(&scope.get(partner_name, pid)?)),
                _ => "order".to_string(),
            };
            scope.set(*id, Value::Text(label))?;
        }
        Ok(())
    })
}

fn compute_qty_total() -> ComputeHandler {
    Arc::new(|scope, ids| {
        let registry = scope.registry();
        let order = registry
            .entity_id("order")
            .map_err(|err| RecomputeError::handler(err.to_string()))?;
        let line = registry
            .entity_id("line")
            .map_err(|err| RecomputeError::handler(err.to_string()))?;
        let line_ids = registry
            .field_id(order, "line_ids")
            .map_err(|err| RecomputeError::handler(err.to_string()))?;
        let qty = registry
            .field_id(line, "qty")
            .map_err(|err| RecomputeError::handler(err.to_string()))?;
        for id in ids {
            let mut sum = 0i64;
            if let Value::List(lines) = scope.get(line_ids, *id)? {
                for value in lines {
                    if let Value::Id(line_id) = value
                        && let Value::Int(n) = scope.get(qty, line_id)?
                    {
                        sum += n;
                    }
                }
            }
            scope.set(*id, Value::Int(sum))?;
        }
        Ok(())
    })
}

fn compute_full_name() -> ComputeHandler {
    Arc::new(|scope, ids| {
        let registry = scope.registry();
        let category = registry
            .entity_id("category")
            .map_err(|err| RecomputeError::handler(err.to_string()))?;
        let name = registry
            .field_id(category, "name")
            .map_err(|err| RecomputeError::handler(err.to_string()))?;
        let parent_id = registry
            .field_id(category, "parent_id")
            .map_err(|err| RecomputeError::handler(err.to_string()))?;
        let full_name = registry
            .field_id(category, "full_name")
            .map_err(|err| RecomputeError::handler(err.to_string()))?;
        for id in ids {
            let own = text_of(&scope.get(name, *id)?);
            let full = match scope.get(parent_id, *id)? {
                Value::Id(parent) => {
                    format!("{} / {own}", text_of(&scope.get(full_name, parent)?))
                }
                _ => own,
            };
            scope.set(*id, Value::Text(full))?;
        }
        Ok(())
    })
}

fn compute_greeting() -> ComputeHandler {
    Arc::new(|scope, ids| {
        let registry = scope.registry();
        let partner = registry
            .entity_id("partner")
            .map_err(|err| RecomputeError::handler(err.to_string()))?;
        let name = registry
            .field_id(partner, "name")
            .map_err(|err| RecomputeError::handler(err.to_string()))?;
        for id in ids {
            let greeting = format!("Hello {}", text_of(&scope.get(name, *id)?));
            scope.set(*id, Value::Text(greeting))?;
        }
        Ok(())
    })
}

fn search_adult() -> SearchHandler {
    Arc::new(|operator, value| {
        let truthy = value.truthy();
        let domain = match operator {
            Operator::Eq => Some(adult_domain(truthy)),
            Operator::Ne => Some(adult_domain(!truthy)),
            _ => None,
        };
        Ok(domain)
    })
}

fn adult_domain(adult: bool) -> Domain {
    let operator = if adult { Operator::Ge } else { Operator::Lt };
    Domain::Condition(Condition::new("age", operator, Value::Int(18)))
}
