use crate::{
    domain::{Condition, Domain, DomainResult, Operator, condition::ConditionValue, optimize::ModelEnv},
    model::{EntityId, FieldId, FieldKind},
    value::{RecordId, Value, ValueList},
};
use std::collections::BTreeSet;

///
/// Hierarchical operators
///
/// `child_of` / `parent_of` resolve into plain conditions by walking the
/// entity's parent relation. Entities that maintain a materialized
/// `parent_path` column resolve `child_of` with prefix matches; everything
/// else falls back to an iterative closure. The closure keeps a visited set,
/// so cyclic parent data (a data integrity bug) terminates instead of
/// looping.
///

pub(crate) fn resolve(cond: &Condition, model: &ModelEnv<'_>) -> DomainResult<Domain> {
    let ConditionValue::Value(value) = &cond.value else {
        return Err(cond.invalid("hierarchy operators expect id or name values"));
    };
    if !value.truthy() {
        return Ok(Domain::False);
    }

    // comodel holding the hierarchy, and the field of the final condition
    let (comodel, result_field): (EntityId, Option<String>) = if cond.path == "id" {
        (model.entity, None)
    } else {
        let (field_id, field) = model.field(cond, &cond.path)?;
        if !field.kind.relational() {
            return Err(cond.invalid("hierarchy operators work only for relational fields"));
        }
        let comodel = model.comodel(cond, field_id)?.entity;
        if comodel == model.entity && matches!(field.kind, FieldKind::ManyToOne { .. }) {
            (comodel, None)
        } else {
            (comodel, Some(cond.path.clone()))
        }
    };

    let comodel_entity = model.registry.entity(comodel);
    let mut parent_name = comodel_entity.parent_field.clone();
    if comodel == model.entity && cond.path != "id" {
        parent_name = cond.path.clone();
    }
    let parent_field = model
        .registry
        .field_id(comodel, &parent_name)
        .map_err(|_| cond.invalid(format!("no parent relation '{parent_name}'")))?;
    if !matches!(
        model.registry.field(parent_field).kind,
        FieldKind::ManyToOne { .. }
    ) {
        return Err(cond.invalid(format!("'{parent_name}' is not a many2one relation")));
    }

    let ids = initial_ids(cond, value, comodel, model)?;
    if ids.is_empty() {
        return Ok(Domain::False);
    }

    // materialized-path fast path for child_of on the default parent relation
    let use_parent_path = comodel_entity.parent_path_field.is_some()
        && parent_name == comodel_entity.parent_field;

    let domain = match cond.operator {
        Operator::ChildOf if use_parent_path => {
            let path_field = comodel_entity.parent_path_field.expect("checked above");
            let id_list: Vec<RecordId> = ids.iter().copied().collect();
            let rows = model.store.fetch(model.registry, path_field, &id_list)?;
            let conditions = rows.into_iter().filter_map(|(_, value)| match value {
                Value::Text(path) => Some(Domain::Condition(Condition::new(
                    "parent_path",
                    Operator::EqLike,
                    Value::Text(format!("{path}%")),
                ))),
                _ => None,
            });
            let matches = Domain::or_all(conditions);
            match result_field {
                None => matches,
                Some(field) => Domain::Condition(Condition::new(field, Operator::Any, matches)),
            }
        }
        Operator::ChildOf => {
            let closure = descendant_ids(parent_field, &ids, model)?;
            in_ids_domain(result_field, &closure)
        }
        Operator::ParentOf if use_parent_path => {
            let path_field = comodel_entity.parent_path_field.expect("checked above");
            let id_list: Vec<RecordId> = ids.iter().copied().collect();
            let rows = model.store.fetch(model.registry, path_field, &id_list)?;
            let mut parents = BTreeSet::new();
            for (_, value) in rows {
                if let Value::Text(path) = value {
                    for label in path.split('/').filter(|label| !label.is_empty()) {
                        if let Ok(id) = label.parse::<u64>() {
                            parents.insert(RecordId(id));
                        }
                    }
                }
            }
            in_ids_domain(result_field, &parents)
        }
        Operator::ParentOf => {
            let closure = ancestor_ids(parent_field, &ids, model)?;
            in_ids_domain(result_field, &closure)
        }
        _ => unreachable!("resolve is only called for hierarchy operators"),
    };
    Ok(domain)
}

/// Seed ids from the condition value; names search the comodel by display
/// name.
fn initial_ids(
    cond: &Condition,
    value: &Value,
    comodel: EntityId,
    model: &ModelEnv<'_>,
) -> DomainResult<BTreeSet<RecordId>> {
    let mut out = BTreeSet::new();
    let items: Vec<&Value> = match value {
        Value::List(list) => list.iter().collect(),
        single => vec![single],
    };
    let mut names = ValueList::new();
    for item in items {
        match item {
            Value::Id(id) => {
                out.insert(*id);
            }
            Value::Int(n) if *n >= 0 => {
                out.insert(RecordId(u64::try_from(*n).expect("non-negative")));
            }
            Value::Text(_) => names.insert(item.clone()),
            other => return Err(cond.invalid(format!("unsupported hierarchy value {other}"))),
        }
    }
    if !names.is_empty() {
        let conditions = names.iter().map(|name| {
            Domain::Condition(Condition::new(
                "display_name",
                Operator::Ilike,
                name.clone(),
            ))
        });
        let search = Domain::or_all(conditions);
        out.extend(model.store.search_ids(model.registry, comodel, &search)?);
    }
    Ok(out)
}

/// All records reachable downward from `ids` through the parent relation.
fn descendant_ids(
    parent_field: FieldId,
    ids: &BTreeSet<RecordId>,
    model: &ModelEnv<'_>,
) -> DomainResult<BTreeSet<RecordId>> {
    let mut seen: BTreeSet<RecordId> = BTreeSet::new();
    let mut frontier: BTreeSet<RecordId> = ids.clone();
    while !frontier.is_empty() {
        seen.extend(frontier.iter().copied());
        let next = model
            .store
            .records_referencing(model.registry, parent_field, &frontier)?;
        frontier = next.difference(&seen).copied().collect();
    }
    Ok(seen)
}

/// All records reachable upward from `ids` through the parent relation.
fn ancestor_ids(
    parent_field: FieldId,
    ids: &BTreeSet<RecordId>,
    model: &ModelEnv<'_>,
) -> DomainResult<BTreeSet<RecordId>> {
    let mut seen: BTreeSet<RecordId> = BTreeSet::new();
    let mut frontier: Vec<RecordId> = ids.iter().copied().collect();
    while !frontier.is_empty() {
        seen.extend(frontier.iter().copied());
        let rows = model.store.fetch(model.registry, parent_field, &frontier)?;
        frontier = rows
            .into_iter()
            .filter_map(|(_, value)| match value {
                Value::Id(parent) if !seen.contains(&parent) => Some(parent),
                _ => None,
            })
            .collect();
    }
    Ok(seen)
}

fn in_ids_domain(result_field: Option<String>, ids: &BTreeSet<RecordId>) -> Domain {
    let list: ValueList = ids.iter().map(|id| Value::Id(*id)).collect();
    let field = result_field.unwrap_or_else(|| "id".to_string());
    Domain::Condition(Condition::new(field, Operator::In, Value::List(list)))
}

///
/// TESTS
///
