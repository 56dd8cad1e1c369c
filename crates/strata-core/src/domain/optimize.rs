use crate::{
    MAX_OPTIMIZE_ITERATIONS,
    domain::{
        Condition, Domain, DomainError, DomainResult, Operator,
        ast::{Connective, Nary, OptimizeTag},
        condition::ConditionValue,
        hierarchy,
    },
    model::{EntityId, FieldId, FieldKind, FieldModel, SchemaRegistry},
    store::RecordStore,
    value::{RecordId, Value, ValueList},
};
use chrono::{Days, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

///
/// ModelEnv
///
/// The "model" a domain is optimized against: the schema registry, the root
/// entity whose fields the paths resolve on, and the store collaborator
/// consulted by hierarchy resolution and sub-query lowering.
///

#[derive(Clone, Copy)]
pub struct ModelEnv<'a> {
    pub registry: &'a SchemaRegistry,
    pub store: &'a dyn RecordStore,
    pub entity: EntityId,
}

impl<'a> ModelEnv<'a> {
    pub fn new(
        registry: &'a SchemaRegistry,
        store: &'a dyn RecordStore,
        entity: &str,
    ) -> DomainResult<Self> {
        Ok(Self {
            registry,
            store,
            entity: registry.entity_id(entity)?,
        })
    }

    pub(crate) const fn tag(&self) -> OptimizeTag {
        OptimizeTag {
            version: self.registry.version(),
            entity: self.entity,
        }
    }

    /// Resolve a simple field name on the root entity.
    pub(crate) fn field(
        &self,
        cond: &Condition,
        name: &str,
    ) -> DomainResult<(FieldId, &'a FieldModel)> {
        let id = self
            .registry
            .field_id(self.entity, name)
            .map_err(|_| cond.invalid("unknown field"))?;
        Ok((id, self.registry.field(id)))
    }

    /// Environment rooted at the comodel of a relational field.
    pub(crate) fn comodel(&self, cond: &Condition, field: FieldId) -> DomainResult<Self> {
        let entity = self
            .registry
            .comodel_id(field)
            .map_err(|_| cond.invalid("cannot determine the comodel relation"))?;
        Ok(Self {
            registry: self.registry,
            store: self.store,
            entity,
        })
    }
}

impl Domain {
    /// Rewrite into the canonical form for the given model: a fixpoint of
    /// flattening, canonical child ordering, condition rewrites and merge
    /// rules. Idempotent; a domain optimized against the same schema version
    /// is returned unchanged.
    pub fn optimize(&self, model: &ModelEnv<'_>) -> DomainResult<Self> {
        match self {
            Self::True | Self::False => Ok(self.clone()),
            Self::Not(child) => {
                let inner = child.optimize(model)?;
                negate(inner, model)?.optimize(model)
            }
            Self::And(nary) => optimize_nary(Connective::And, nary, model),
            Self::Or(nary) => optimize_nary(Connective::Or, nary, model),
            Self::Condition(cond) => optimize_condition(cond, model),
        }
    }
}

///
/// Negation push-down
///

/// Propagate a negation through an already-optimized domain (De Morgan,
/// operator inverses). Inequalities need the field type: when the column has
/// no falsy value, `not (a < v)` must also match records where `a` is not
/// set.
fn negate(domain: Domain, model: &ModelEnv<'_>) -> DomainResult<Domain> {
    match domain {
        Domain::True => Ok(Domain::False),
        Domain::False => Ok(Domain::True),
        Domain::Not(child) => Ok(*child),
        Domain::And(nary) => {
            let children = nary
                .children
                .into_iter()
                .map(|child| negate(child, model))
                .collect::<DomainResult<Vec<_>>>()?;
            Ok(Connective::Or.apply(children))
        }
        Domain::Or(nary) => {
            let children = nary
                .children
                .into_iter()
                .map(|child| negate(child, model))
                .collect::<DomainResult<Vec<_>>>()?;
            Ok(Connective::And.apply(children))
        }
        Domain::Condition(cond) => negate_condition(cond, model),
    }
}

fn negate_condition(cond: Condition, model: &ModelEnv<'_>) -> DomainResult<Domain> {
    if let Some(inverse) = cond.operator.inequality_inverse() {
        let inverted = Domain::Condition(cond.rewrite(
            cond.path.clone(),
            inverse,
            cond.value.clone(),
        ));
        let falsy = if cond.path == "id" {
            Some(Value::Id(RecordId(0)))
        } else {
            let (_, field) = model.field(&cond, &cond.path)?;
            field.kind.falsy_value()
        };
        if falsy.is_none() {
            // the inverted comparison does not match unset records
            let is_not_set = Domain::Condition(Condition::new(
                cond.path,
                Operator::In,
                Value::List(ValueList::from_values([Value::Bool(false)])),
            ));
            return Ok(is_not_set | inverted);
        }
        return Ok(inverted);
    }
    if !cond.path.contains('.')
        && let Some(negated) = cond.operator.negated()
    {
        return Ok(Domain::Condition(cond.rewrite(
            cond.path.clone(),
            negated,
            cond.value.clone(),
        )));
    }
    Ok(Domain::Not(Box::new(Domain::Condition(cond))))
}

///
/// N-ary optimization
///

fn optimize_nary(conn: Connective, nary: &Nary, model: &ModelEnv<'_>) -> DomainResult<Domain> {
    if nary.optimized == Some(model.tag()) {
        let node = Nary {
            children: nary.children.clone(),
            optimized: nary.optimized,
        };
        return Ok(match conn {
            Connective::And => Domain::And(node),
            Connective::Or => Domain::Or(node),
        });
    }

    let mut children = nary.children.clone();
    let mut iterations = 0usize;
    loop {
        iterations += 1;
        if iterations > MAX_OPTIMIZE_ITERATIONS {
            return Err(DomainError::Internal {
                reason: "domain optimization did not converge".to_string(),
            });
        }

        let optimized = children
            .into_iter()
            .map(|child| child.optimize(model))
            .collect::<DomainResult<Vec<_>>>()?;
        let mut flat = conn.flatten(optimized);
        if flat.len() == 1 {
            // collapsed to the absorbing element, the identity, or a single
            // remaining child
            return Ok(flat.pop().expect("non-empty"));
        }

        // group same-field conditions so the merge rules stay local
        flat.sort_by_cached_key(nary_sort_key);

        let size = flat.len();
        for merge in MERGE_RULES {
            flat = merge(conn, flat, model)?;
            if flat.len() < size {
                break;
            }
        }

        if flat.len() == size {
            let out = Nary {
                children: flat,
                optimized: Some(model.tag()),
            };
            return Ok(match conn {
                Connective::And => Domain::And(out),
                Connective::Or => Domain::Or(out),
            });
        }
        children = flat;
    }
}

/// Canonical child ordering: field path, then an operator bucket grouping
/// mergeable families, then the operator itself. Non-condition children sort
/// last.
fn nary_sort_key(domain: &Domain) -> (String, String, String) {
    match domain {
        Domain::Condition(cond) => (
            cond.path.clone(),
            cond.operator.sort_class().to_string(),
            cond.operator.as_str().to_string(),
        ),
        Domain::Not(_) => ("~".to_string(), String::new(), "!".to_string()),
        Domain::And(_) => ("~".to_string(), String::new(), "&".to_string()),
        Domain::Or(_) => ("~".to_string(), String::new(), "|".to_string()),
        Domain::True | Domain::False => ("~".to_string(), "~".to_string(), String::new()),
    }
}

///
/// Merge rules
///
/// Each rule consumes the sorted child list and emits a list that is never
/// longer; this monotonicity is what bounds the fixpoint loop. Adding a rule
/// that can grow the list would break termination.
///

type MergeRule = fn(Connective, Vec<Domain>, &ModelEnv<'_>) -> DomainResult<Vec<Domain>>;

const MERGE_RULES: &[MergeRule] = &[
    merge_set_conditions,
    merge_any_conditions,
    merge_adjacent_duplicates,
];

/// Kind of the (simple) field a condition refers to; `None` for the `id`
/// pseudo-field.
fn condition_kind<'a>(
    cond: &Condition,
    model: &ModelEnv<'a>,
) -> DomainResult<Option<&'a FieldKind>> {
    if cond.path == "id" {
        return Ok(None);
    }
    let (_, field) = model.field(cond, &cond.path)?;
    Ok(Some(&field.kind))
}

fn in_run_member(domain: &Domain, path: &str) -> bool {
    matches!(
        domain,
        Domain::Condition(cond)
            if cond.path == path
                && matches!(cond.operator, Operator::In | Operator::NotIn)
                && matches!(cond.value, ConditionValue::Value(Value::List(_)))
    )
}

/// Combine same-field `in`/`not in` conditions into one set each:
///
///     a in {1} or a in {2}        <=>  a in {1, 2}
///     a in {1, 2} and a not in {2, 5}  =>  a in {1}
///
/// x2many fields have membership semantics, so only the direction that
/// matches the `any` equivalence is merged for them.
fn merge_set_conditions(
    conn: Connective,
    children: Vec<Domain>,
    model: &ModelEnv<'_>,
) -> DomainResult<Vec<Domain>> {
    let mut out: Vec<Domain> = Vec::with_capacity(children.len());
    let mut index = 0;
    while index < children.len() {
        let Domain::Condition(head) = &children[index] else {
            out.push(children[index].clone());
            index += 1;
            continue;
        };
        if !in_run_member(&children[index], &head.path) {
            out.push(children[index].clone());
            index += 1;
            continue;
        }
        let mut end = index + 1;
        while end < children.len() && in_run_member(&children[end], &head.path) {
            end += 1;
        }
        if end - index < 2 {
            out.push(children[index].clone());
            index += 1;
            continue;
        }

        let run: Vec<&Condition> = children[index..end]
            .iter()
            .map(|child| match child {
                Domain::Condition(cond) => cond,
                _ => unreachable!("run members are conditions"),
            })
            .collect();
        let x2many = condition_kind(head, model)?.is_some_and(FieldKind::is_x2many);
        let (mergeable, kept): (Vec<&Condition>, Vec<&Condition>) =
            run.iter().copied().partition(|cond| {
                if !x2many {
                    return true;
                }
                // for x2many, merging matches the 'any' equivalence only in
                // one direction per operator
                match cond.operator {
                    Operator::In => conn == Connective::Or,
                    _ => conn == Connective::And,
                }
            });
        if mergeable.len() < 2 {
            out.extend(children[index..end].iter().cloned());
            index = end;
            continue;
        }

        out.extend(kept.iter().map(|cond| Domain::Condition((*cond).clone())));
        out.push(merge_sets(conn, &head.path, &mergeable));
        index = end;
    }
    Ok(out)
}

fn merge_sets(conn: Connective, path: &str, conditions: &[&Condition]) -> Domain {
    fn list_of(cond: &Condition) -> &ValueList {
        match &cond.value {
            ConditionValue::Value(Value::List(list)) => list,
            _ => unreachable!("set conditions hold list values"),
        }
    }

    let ins: Vec<&ValueList> = conditions
        .iter()
        .filter(|c| c.operator == Operator::In)
        .map(|c| list_of(c))
        .collect();
    let not_ins: Vec<&ValueList> = conditions
        .iter()
        .filter(|c| c.operator == Operator::NotIn)
        .map(|c| list_of(c))
        .collect();

    let intersect = |sets: &[&ValueList]| -> ValueList {
        let mut iter = sets.iter().copied();
        let first = iter.next().expect("non-empty").clone();
        iter.fold(first, |acc, set| acc.intersection(set))
    };
    let union = |sets: &[&ValueList]| -> ValueList {
        sets.iter()
            .copied()
            .fold(ValueList::new(), |acc, set| acc.union(set))
    };

    let (operator, value) = match conn {
        Connective::And => {
            if ins.is_empty() {
                (Operator::NotIn, union(&not_ins))
            } else {
                (Operator::In, intersect(&ins).difference(&union(&not_ins)))
            }
        }
        Connective::Or => {
            if not_ins.is_empty() {
                (Operator::In, union(&ins))
            } else {
                (Operator::NotIn, intersect(&not_ins).difference(&union(&ins)))
            }
        }
    };
    Domain::Condition(Condition::new(path, operator, Value::List(value)))
}

/// Merge same-field `any`/`not any` sub-domains into a single sub-search:
///
///     a any (f = 8) or a any (g = 5)   <=>  a any (f = 8 or g = 5)
///     a any (f = 8) and a any (g = 5)  <=>  a any (f = 8 and g = 5)  (many2one only)
///
fn merge_any_conditions(
    conn: Connective,
    children: Vec<Domain>,
    model: &ModelEnv<'_>,
) -> DomainResult<Vec<Domain>> {
    fn any_member(domain: &Domain, path: &str, operator: Operator) -> bool {
        matches!(
            domain,
            Domain::Condition(cond)
                if cond.path == path
                    && cond.operator == operator
                    && matches!(cond.value, ConditionValue::Domain(_))
        )
    }

    let mut out: Vec<Domain> = Vec::with_capacity(children.len());
    let mut index = 0;
    while index < children.len() {
        let Domain::Condition(head) = &children[index] else {
            out.push(children[index].clone());
            index += 1;
            continue;
        };
        if !matches!(head.operator, Operator::Any | Operator::NotAny)
            || !any_member(&children[index], &head.path, head.operator)
        {
            out.push(children[index].clone());
            index += 1;
            continue;
        }
        let mut end = index + 1;
        while end < children.len() && any_member(&children[end], &head.path, head.operator) {
            end += 1;
        }
        if end - index < 2 {
            out.push(children[index].clone());
            index += 1;
            continue;
        }

        // merging an AND of 'any' (or an OR of 'not any') is only valid when
        // at most one related record exists, i.e. many2one
        let many2one = matches!(
            condition_kind(head, model)?,
            Some(FieldKind::ManyToOne { .. })
        );
        let collapses = match (head.operator, conn) {
            (Operator::Any, Connective::Or) | (Operator::NotAny, Connective::And) => true,
            _ => many2one,
        };
        if !collapses {
            out.extend(children[index..end].iter().cloned());
            index = end;
            continue;
        }

        let sub_conn = if head.operator == Operator::Any {
            conn
        } else {
            conn.dual()
        };
        let subs = children[index..end].iter().map(|child| match child {
            Domain::Condition(Condition {
                value: ConditionValue::Domain(sub),
                ..
            }) => (**sub).clone(),
            _ => unreachable!("run members hold sub-domains"),
        });
        out.push(Domain::Condition(Condition::new(
            head.path.clone(),
            head.operator,
            sub_conn.apply(subs),
        )));
        index = end;
    }
    Ok(out)
}

/// Drop adjacent identical children; the canonical sort puts duplicates next
/// to each other.
fn merge_adjacent_duplicates(
    _conn: Connective,
    children: Vec<Domain>,
    _model: &ModelEnv<'_>,
) -> DomainResult<Vec<Domain>> {
    let mut out: Vec<Domain> = Vec::with_capacity(children.len());
    for child in children {
        if out.last() != Some(&child) {
            out.push(child);
        }
    }
    Ok(out)
}

///
/// Condition optimization
///

fn optimize_condition(cond: &Condition, model: &ModelEnv<'_>) -> DomainResult<Domain> {
    if cond.optimized == Some(model.tag()) {
        return Ok(Domain::Condition(cond.clone()));
    }

    // re-apply the always-on normalizations; conditions can reach the
    // optimizer without going through checked()
    match cond.clone().checked()? {
        Domain::Condition(checked) if checked == *cond => {}
        other => return other.optimize(model),
    }

    // dotted paths decompose into nested 'any' conditions
    if let Some((head, rest)) = cond.path.split_once('.') {
        let head_cond = Condition::new(head, cond.operator, cond.value.clone());
        let (_, field) = model.field(&head_cond, head)?;
        if !field.kind.relational() {
            return Err(head_cond.invalid("path traversal on a non-relational field"));
        }
        let sub = Condition::new(rest, cond.operator, cond.value.clone());
        return Domain::Condition(Condition::new(
            head,
            Operator::Any,
            Domain::Condition(sub),
        ))
        .optimize(model);
    }

    if cond.path == "id" {
        return optimize_id_condition(cond, model);
    }

    let (field_id, field) = model.field(cond, &cond.path)?;

    // inherited fields delegate to the parent entity
    if let Some((parent_field, _)) = &field.inherited
        && parent_field != &cond.path
    {
        let sub = Condition::new(cond.path.clone(), cond.operator, cond.value.clone());
        return Domain::Condition(Condition::new(
            parent_field.clone(),
            Operator::Any,
            Domain::Condition(sub),
        ))
        .optimize(model);
    }

    // non-stored fields are resolved through their search function
    if !field.stored {
        let rewritten = expand_search(cond, field, model)?;
        if rewritten != Domain::Condition(cond.clone()) {
            return rewritten.optimize(model);
        }
    }

    // hierarchical operators
    if matches!(cond.operator, Operator::ParentOf | Operator::ChildOf) {
        return hierarchy::resolve(cond, model)?.optimize(model);
    }

    // single-value equality is a one-element set membership
    if matches!(cond.operator, Operator::Eq | Operator::Ne)
        && let ConditionValue::Value(value) = &cond.value
    {
        let operator = if cond.operator == Operator::Eq {
            Operator::In
        } else {
            Operator::NotIn
        };
        let value = Value::List(ValueList::from_values([value.clone()]));
        return Domain::Condition(cond.rewrite(cond.path.clone(), operator, value))
            .optimize(model);
    }

    // operator- and type-specific rewrites; first applicable one wins and
    // the result is re-optimized
    let rewrites: &[fn(&Condition, FieldId, &FieldModel, &ModelEnv<'_>) -> DomainResult<Option<Domain>>] = &[
        rewrite_in_collection,
        rewrite_any_value,
        rewrite_like_pattern,
        rewrite_relational_names,
        rewrite_bool_values,
        rewrite_date_values,
        rewrite_datetime_values,
    ];
    for rewrite in rewrites {
        if let Some(domain) = rewrite(cond, field_id, field, model)? {
            return domain.optimize(model);
        }
    }

    // anything non-standard left here is an optimizer bug
    if !cond.operator.standard() {
        return Err(DomainError::Internal {
            reason: format!("non-standard operator left in optimized condition {cond}"),
        });
    }

    let mut out = cond.clone();
    out.optimized = Some(model.tag());
    Ok(Domain::Condition(out))
}

/// Conditions on the identifier pseudo-field: normalize values to record
/// ids; hierarchy traversal uses the entity's own parent relation.
fn optimize_id_condition(cond: &Condition, model: &ModelEnv<'_>) -> DomainResult<Domain> {
    if matches!(cond.operator, Operator::ParentOf | Operator::ChildOf) {
        return hierarchy::resolve(cond, model)?.optimize(model);
    }
    if matches!(cond.operator, Operator::Any | Operator::NotAny)
        && let ConditionValue::Query(query) = &cond.value
    {
        let ids: ValueList = query.ids.iter().map(|id| Value::Id(*id)).collect();
        let operator = if cond.operator == Operator::Any {
            Operator::In
        } else {
            Operator::NotIn
        };
        return Domain::Condition(cond.rewrite(cond.path.clone(), operator, Value::List(ids)))
            .optimize(model);
    }
    if matches!(cond.operator, Operator::Eq | Operator::Ne) {
        return Domain::Condition(cond.clone()).optimize_eq_as_in(model);
    }
    if matches!(cond.operator, Operator::In | Operator::NotIn)
        && let ConditionValue::Value(value) = &cond.value
    {
        let list = match value {
            Value::List(list) => list.clone(),
            scalar => ValueList::from_values([scalar.clone()]),
        };
        let normalized: ValueList = list.iter().map(normalize_id_value).collect();
        if Value::List(normalized.clone()) != *value {
            return Domain::Condition(cond.rewrite(
                cond.path.clone(),
                cond.operator,
                Value::List(normalized),
            ))
            .optimize(model);
        }
    }
    if !cond.operator.standard() {
        return Err(cond.invalid("operator not supported on 'id'"));
    }
    let mut out = cond.clone();
    out.optimized = Some(model.tag());
    Ok(Domain::Condition(out))
}

impl Domain {
    // small helper so the id path can reuse the '=' -> 'in' rewrite
    fn optimize_eq_as_in(self, model: &ModelEnv<'_>) -> DomainResult<Self> {
        let Self::Condition(cond) = &self else {
            return self.optimize(model);
        };
        let ConditionValue::Value(value) = &cond.value else {
            return Err(cond.invalid("expected a value for equality"));
        };
        let operator = if cond.operator == Operator::Eq {
            Operator::In
        } else {
            Operator::NotIn
        };
        let value = Value::List(ValueList::from_values([value.clone()]));
        Self::Condition(cond.rewrite(cond.path.clone(), operator, value)).optimize(model)
    }
}

fn normalize_id_value(value: &Value) -> Value {
    match value {
        Value::Int(n) if *n >= 0 => Value::Id(RecordId(u64::try_from(*n).expect("non-negative"))),
        other => other.clone(),
    }
}

/// Expand a condition on a non-stored field through its search function,
/// falling back to the inverse operator and to per-value equality.
fn expand_search(
    cond: &Condition,
    field: &FieldModel,
    _model: &ModelEnv<'_>,
) -> DomainResult<Domain> {
    let Some(search) = &field.search else {
        return Err(cond.invalid("non-stored field is not searchable"));
    };
    let ConditionValue::Value(value) = &cond.value else {
        return Err(cond.invalid("non-stored fields only support plain values"));
    };

    if let Some(domain) = search(cond.operator, value)? {
        return Ok(domain);
    }
    // try the positive/negated counterpart and invert the result
    if let Some(inverse) = cond.operator.negated()
        && let Some(domain) = search(inverse, value)?
    {
        return Ok(!domain);
    }
    // compatibility for search functions implementing only '='/'!='
    if let Value::List(list) = value {
        if cond.operator == Operator::In {
            let mut parts = Vec::new();
            for item in list {
                let part = search(Operator::Eq, item)?
                    .ok_or_else(|| cond.invalid("unsupported operator for searchable field"))?;
                parts.push(part);
            }
            return Ok(Domain::or_all(parts));
        }
        if cond.operator == Operator::NotIn {
            let mut parts = Vec::new();
            for item in list {
                let part = search(Operator::Ne, item)?
                    .ok_or_else(|| cond.invalid("unsupported operator for searchable field"))?;
                parts.push(part);
            }
            return Ok(Domain::and_all(parts));
        }
    }
    Err(cond.invalid("unsupported operator for searchable field"))
}

///
/// Operator/type rewrites
///
/// Each returns `Ok(None)` when the condition is already in shape; any
/// change triggers a re-optimization of the result.
///

/// Make sure 'in'/'not in' carry a collection value.
fn rewrite_in_collection(
    cond: &Condition,
    _field_id: FieldId,
    _field: &FieldModel,
    _model: &ModelEnv<'_>,
) -> DomainResult<Option<Domain>> {
    if !matches!(cond.operator, Operator::In | Operator::NotIn) {
        return Ok(None);
    }
    match &cond.value {
        ConditionValue::Value(Value::List(_)) | ConditionValue::Domain(_) => Ok(None),
        ConditionValue::Query(query) => {
            // a resolved sub-query compares as a plain id set
            let ids: ValueList = query.ids.iter().map(|id| Value::Id(*id)).collect();
            Ok(Some(Domain::Condition(cond.rewrite(
                cond.path.clone(),
                cond.operator,
                Value::List(ids),
            ))))
        }
        ConditionValue::Value(scalar) => {
            log::debug!("condition {cond} should have a list value");
            Ok(Some(Domain::Condition(cond.rewrite(
                cond.path.clone(),
                cond.operator,
                Value::List(ValueList::from_values([scalar.clone()])),
            ))))
        }
    }
}

/// Validate 'any'/'not any' and optimize the nested domain against the
/// comodel. A constant-false sub-domain collapses the whole condition.
fn rewrite_any_value(
    cond: &Condition,
    field_id: FieldId,
    field: &FieldModel,
    model: &ModelEnv<'_>,
) -> DomainResult<Option<Domain>> {
    if !matches!(cond.operator, Operator::Any | Operator::NotAny) {
        return Ok(None);
    }
    if !field.kind.relational() {
        return Err(cond.invalid("cannot use 'any' with non-relational fields"));
    }
    match &cond.value {
        ConditionValue::Query(query) => {
            let ids: ValueList = query.ids.iter().map(|id| Value::Id(*id)).collect();
            let operator = if cond.operator == Operator::Any {
                Operator::In
            } else {
                Operator::NotIn
            };
            Ok(Some(Domain::Condition(cond.rewrite(
                cond.path.clone(),
                operator,
                Value::List(ids),
            ))))
        }
        ConditionValue::Domain(sub) => {
            let comodel = model.comodel(cond, field_id)?;
            let optimized = sub.optimize(&comodel)?;
            if optimized.is_false() {
                return Ok(Some(if cond.operator == Operator::Any {
                    Domain::False
                } else {
                    Domain::True
                }));
            }
            if optimized == **sub {
                return Ok(None);
            }
            Ok(Some(Domain::Condition(cond.rewrite(
                cond.path.clone(),
                cond.operator,
                optimized,
            ))))
        }
        ConditionValue::Value(value) => {
            // a plain id collection on 'any' means set membership
            let operator = if cond.operator == Operator::Any {
                Operator::In
            } else {
                Operator::NotIn
            };
            Ok(Some(Domain::Condition(cond.rewrite(
                cond.path.clone(),
                operator,
                value.clone(),
            ))))
        }
    }
}

/// Pattern operators need a string pattern; an empty pattern degenerates to
/// an emptiness check.
fn rewrite_like_pattern(
    cond: &Condition,
    _field_id: FieldId,
    field: &FieldModel,
    _model: &ModelEnv<'_>,
) -> DomainResult<Option<Domain>> {
    if !cond.operator.like_family() {
        return Ok(None);
    }
    let ConditionValue::Value(value) = &cond.value else {
        return Err(cond.invalid("pattern must be a string"));
    };
    if !value.truthy() {
        // '=like' matches only the empty string; 'like' matches everything
        let result = cond.operator.negative() == cond.operator.exact_like();
        if field.kind.relational() || cond.operator.exact_like() {
            let operator = if result { Operator::Ne } else { Operator::Eq };
            return Ok(Some(Domain::Condition(cond.rewrite(
                cond.path.clone(),
                operator,
                Value::Bool(false),
            ))));
        }
        return Ok(Some(if result { Domain::True } else { Domain::False }));
    }
    match value {
        Value::Text(_) => Ok(None),
        other => {
            if cond.operator.exact_like() {
                return Err(cond.invalid("the pattern to match must be a string"));
            }
            let pattern = match other {
                Value::Int(n) => n.to_string(),
                Value::Float(n) => n.to_string(),
                Value::Date(d) => d.to_string(),
                Value::DateTime(d) => d.to_string(),
                _ => return Err(cond.invalid("the pattern to match must be a string")),
            };
            Ok(Some(Domain::Condition(cond.rewrite(
                cond.path.clone(),
                cond.operator,
                Value::Text(pattern),
            ))))
        }
    }
}

/// Comparing a relational field against strings searches the comodel by
/// display name.
fn rewrite_relational_names(
    cond: &Condition,
    _field_id: FieldId,
    field: &FieldModel,
    _model: &ModelEnv<'_>,
) -> DomainResult<Option<Domain>> {
    if !field.kind.relational() {
        return Ok(None);
    }
    let positive = cond.operator.positive();
    let any_operator = if positive == cond.operator {
        Operator::Any
    } else {
        Operator::NotAny
    };

    if cond.operator.like_family()
        && let ConditionValue::Value(value) = &cond.value
    {
        let sub = Condition::new("display_name", positive, value.clone());
        return Ok(Some(Domain::Condition(Condition::new(
            cond.path.clone(),
            any_operator,
            Domain::Condition(sub),
        ))));
    }
    if cond.operator.is_inequality()
        && matches!(cond.value, ConditionValue::Value(Value::Text(_)))
    {
        return Err(cond.invalid("inequality not supported for relational field using a string"));
    }
    if positive != Operator::In {
        return Ok(None);
    }
    let ConditionValue::Value(Value::List(list)) = &cond.value else {
        return Ok(None);
    };

    let (strings, others): (Vec<&Value>, Vec<&Value>) = list
        .iter()
        .partition(|value| matches!(value, Value::Text(_)));
    if strings.is_empty() {
        // normalize plain integers into record ids
        let normalized: ValueList = list.iter().map(normalize_id_value).collect();
        if Value::List(normalized.clone()) == Value::List(list.clone()) {
            return Ok(None);
        }
        return Ok(Some(Domain::Condition(cond.rewrite(
            cond.path.clone(),
            cond.operator,
            Value::List(normalized),
        ))));
    }

    let sub = Condition::new(
        "display_name",
        positive,
        Value::List(strings.into_iter().cloned().collect::<ValueList>()),
    );
    let mut domain = Domain::Condition(Condition::new(
        cond.path.clone(),
        any_operator,
        Domain::Condition(sub),
    ));
    if !others.is_empty() {
        let rest = Domain::Condition(cond.rewrite(
            cond.path.clone(),
            cond.operator,
            Value::List(others.into_iter().cloned().collect::<ValueList>()),
        ));
        domain = if positive == cond.operator {
            domain | rest
        } else {
            domain & rest
        };
    }
    Ok(Some(domain))
}

/// Parse boolean sets and collapse tautologies: `b in {true, false}` is
/// always true.
fn rewrite_bool_values(
    cond: &Condition,
    _field_id: FieldId,
    field: &FieldModel,
    _model: &ModelEnv<'_>,
) -> DomainResult<Option<Domain>> {
    if field.kind != FieldKind::Bool || !matches!(cond.operator, Operator::In | Operator::NotIn) {
        return Ok(None);
    }
    let ConditionValue::Value(Value::List(list)) = &cond.value else {
        return Ok(None);
    };

    let parsed: ValueList = list
        .iter()
        .map(|value| match value {
            Value::Bool(_) => value.clone(),
            Value::Text(text) => {
                log::debug!("comparing boolean with a string in {cond}");
                Value::Bool(parse_bool_text(text))
            }
            other => Value::Bool(other.truthy()),
        })
        .collect();

    if parsed.contains(&Value::Bool(true)) && parsed.contains(&Value::Bool(false)) {
        // tautology
        return Ok(Some(if cond.operator == Operator::In {
            Domain::True
        } else {
            Domain::False
        }));
    }
    // compare against [true] whenever possible; search methods only have to
    // deal with one shape
    if parsed.len() == 1 && parsed.contains(&Value::Bool(false)) {
        let operator = cond.operator.negated().expect("in/not in negate");
        return Ok(Some(Domain::Condition(cond.rewrite(
            cond.path.clone(),
            operator,
            Value::List(ValueList::from_values([Value::Bool(true)])),
        ))));
    }
    if parsed == *list {
        return Ok(None);
    }
    Ok(Some(Domain::Condition(cond.rewrite(
        cond.path.clone(),
        cond.operator,
        Value::List(parsed),
    ))))
}

fn parse_bool_text(text: &str) -> bool {
    matches!(
        text.to_ascii_lowercase().as_str(),
        "true" | "t" | "yes" | "y" | "on" | "1"
    )
}

/// Coerce values compared against a date column into dates.
fn rewrite_date_values(
    cond: &Condition,
    _field_id: FieldId,
    field: &FieldModel,
    _model: &ModelEnv<'_>,
) -> DomainResult<Option<Domain>> {
    if field.kind != FieldKind::Date
        || !(matches!(cond.operator, Operator::In | Operator::NotIn)
            || cond.operator.is_inequality())
    {
        return Ok(None);
    }
    let ConditionValue::Value(value) = &cond.value else {
        return Ok(None);
    };
    let coerced = coerce_date(value).map_err(|reason| cond.invalid(reason))?;
    if cond.operator.is_inequality() && !coerced.truthy() {
        // comparing against "not set" matches nothing
        return Ok(Some(Domain::False));
    }
    if coerced == *value {
        return Ok(None);
    }
    Ok(Some(Domain::Condition(cond.rewrite(
        cond.path.clone(),
        cond.operator,
        coerced,
    ))))
}

fn coerce_date(value: &Value) -> Result<Value, String> {
    match value {
        Value::DateTime(dt) => Ok(Value::Date(dt.date())),
        Value::Date(_) | Value::Bool(false) => Ok(value.clone()),
        Value::Text(text) => text
            .parse::<NaiveDate>()
            .map(Value::Date)
            .or_else(|_| text.parse::<NaiveDateTime>().map(|dt| Value::Date(dt.date())))
            .map_err(|_| format!("failed to cast '{text}' into a date")),
        Value::List(list) => {
            let mut out = ValueList::new();
            for item in list {
                out.insert(coerce_date(item)?);
            }
            Ok(Value::List(out))
        }
        other => Err(format!("failed to cast {other} into a date")),
    }
}

/// Coerce values compared against a datetime column and rewrite the
/// comparison to whole-second (or whole-day) granularity.
fn rewrite_datetime_values(
    cond: &Condition,
    _field_id: FieldId,
    field: &FieldModel,
    _model: &ModelEnv<'_>,
) -> DomainResult<Option<Domain>> {
    if field.kind != FieldKind::DateTime
        || !(matches!(cond.operator, Operator::In | Operator::NotIn)
            || cond.operator.is_inequality())
    {
        return Ok(None);
    }
    let ConditionValue::Value(value) = &cond.value else {
        return Ok(None);
    };
    let (coerced, is_date) = coerce_datetime(value).map_err(|reason| cond.invalid(reason))?;

    if cond.operator.is_inequality() {
        if !coerced.truthy() {
            return Ok(Some(Domain::False));
        }
        let Value::DateTime(dt) = coerced else {
            if coerced == *value {
                return Ok(None);
            }
            return Ok(Some(Domain::Condition(cond.rewrite(
                cond.path.clone(),
                cond.operator,
                coerced,
            ))));
        };
        let dt = dt.with_nanosecond(0).expect("zero nanoseconds is valid");
        let bump = |dt: NaiveDateTime| -> Option<NaiveDateTime> {
            if is_date {
                dt.checked_add_days(Days::new(1))
            } else {
                dt.checked_add_signed(chrono::Duration::seconds(1))
            }
        };
        let (operator, bumped) = match cond.operator {
            // strictly-after the granule means at-or-after the next one
            Operator::Gt => match bump(dt) {
                Some(next) => (Operator::Ge, next),
                // above the maximum representable instant, nothing matches
                None => return Ok(Some(Domain::False)),
            },
            Operator::Le => match bump(dt) {
                Some(next) => (Operator::Lt, next),
                // everything that is set matches
                None => {
                    return Ok(Some(Domain::Condition(cond.rewrite(
                        cond.path.clone(),
                        Operator::Ne,
                        Value::Bool(false),
                    ))));
                }
            },
            other => (other, dt),
        };
        let rewritten = Value::DateTime(bumped);
        if operator == cond.operator && rewritten == *value {
            return Ok(None);
        }
        return Ok(Some(Domain::Condition(cond.rewrite(
            cond.path.clone(),
            operator,
            rewritten,
        ))));
    }

    // equality: compare to the whole second
    let Value::List(list) = &coerced else {
        if coerced == *value {
            return Ok(None);
        }
        return Ok(Some(Domain::Condition(cond.rewrite(
            cond.path.clone(),
            cond.operator,
            coerced,
        ))));
    };
    if !list.iter().any(|v| matches!(v, Value::DateTime(_))) {
        if coerced == *value {
            return Ok(None);
        }
        return Ok(Some(Domain::Condition(cond.rewrite(
            cond.path.clone(),
            cond.operator,
            coerced.clone(),
        ))));
    }
    let mut parts = Vec::new();
    for item in list {
        match item {
            Value::DateTime(dt) => {
                let start = dt.with_nanosecond(0).expect("zero nanoseconds is valid");
                let lower = Domain::Condition(Condition::new(
                    cond.path.clone(),
                    Operator::Ge,
                    Value::DateTime(start),
                ));
                let upper = start
                    .checked_add_signed(chrono::Duration::seconds(1))
                    .map(|end| {
                        Domain::Condition(Condition::new(
                            cond.path.clone(),
                            Operator::Lt,
                            Value::DateTime(end),
                        ))
                    })
                    .unwrap_or(Domain::True);
                parts.push(lower & upper);
            }
            other => parts.push(Domain::Condition(Condition::new(
                cond.path.clone(),
                Operator::Eq,
                other.clone(),
            ))),
        }
    }
    let domain = Domain::or_all(parts);
    Ok(Some(if cond.operator == Operator::NotIn {
        !domain
    } else {
        domain
    }))
}

fn coerce_datetime(value: &Value) -> Result<(Value, bool), String> {
    match value {
        Value::DateTime(_) => Ok((value.clone(), false)),
        Value::Bool(false) => Ok((value.clone(), true)),
        Value::Date(date) => Ok((
            Value::DateTime(date.and_time(NaiveTime::MIN)),
            true,
        )),
        Value::Text(text) => text
            .parse::<NaiveDateTime>()
            .map(|dt| (Value::DateTime(dt), false))
            .or_else(|_| {
                text.parse::<NaiveDate>()
                    .map(|d| (Value::DateTime(d.and_time(NaiveTime::MIN)), true))
            })
            .map_err(|_| format!("failed to cast '{text}' into a datetime")),
        Value::List(list) => {
            let mut out = ValueList::new();
            let mut all_dates = true;
            for item in list {
                let (coerced, is_date) = coerce_datetime(item)?;
                all_dates &= is_date;
                out.insert(coerced);
            }
            Ok((Value::List(out), all_dates))
        }
        other => Err(format!("failed to cast {other} into a datetime")),
    }
}

///
/// TESTS
///

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MemoryStore, sample_schema};

    fn setup() -> (SchemaRegistry, MemoryStore) {
        (sample_schema(), MemoryStore::default())
    }

    fn cond(path: &str, op: Operator, value: impl Into<ConditionValue>) -> Domain {
        Domain::Condition(Condition::new(path, op, value))
    }

    #[test]
    fn equality_becomes_single_element_in() {
        let (schema, store) = setup();
        let model = ModelEnv::new(&schema, &store, "partner").unwrap();

        let optimized = cond("name", Operator::Eq, Value::from("bob"))
            .optimize(&model)
            .unwrap();
        let Domain::Condition(cond) = &optimized else {
            panic!("expected condition")
        };
        assert_eq!(cond.operator, Operator::In);
        assert_eq!(
            cond.value,
            ConditionValue::Value(Value::from(vec![Value::from("bob")]))
        );
    }

    #[test]
    fn inequality_stays_canonical() {
        let (schema, store) = setup();
        let model = ModelEnv::new(&schema, &store, "partner").unwrap();

        let optimized = cond("age", Operator::Gt, Value::Int(18))
            .optimize(&model)
            .unwrap();
        let Domain::Condition(cond) = &optimized else {
            panic!("expected condition")
        };
        assert_eq!(cond.operator, Operator::Gt);
    }

    #[test]
    fn and_children_sort_by_field_name() {
        let (schema, store) = setup();
        let model = ModelEnv::new(&schema, &store, "partner").unwrap();

        let domain = cond("name", Operator::Eq, Value::from("bob"))
            & cond("age", Operator::Gt, Value::Int(18));
        let optimized = domain.optimize(&model).unwrap();
        let Domain::And(nary) = &optimized else {
            panic!("expected And, got {optimized}")
        };
        let Domain::Condition(first) = &nary.children[0] else {
            panic!("expected condition")
        };
        assert_eq!(first.path, "age");
    }

    #[test]
    fn optimization_is_idempotent() {
        let (schema, store) = setup();
        let model = ModelEnv::new(&schema, &store, "partner").unwrap();

        let domain = (cond("name", Operator::Eq, Value::from("bob"))
            | cond("name", Operator::Eq, Value::from("alice")))
            & cond("age", Operator::Gt, Value::Int(18));
        let once = domain.optimize(&model).unwrap();
        let twice = once.optimize(&model).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn or_of_equalities_merges_into_one_in() {
        let (schema, store) = setup();
        let model = ModelEnv::new(&schema, &store, "partner").unwrap();

        let domain = cond("name", Operator::Eq, Value::from("bob"))
            | cond("name", Operator::Eq, Value::from("alice"));
        let optimized = domain.optimize(&model).unwrap();
        let Domain::Condition(merged) = &optimized else {
            panic!("expected a single merged condition, got {optimized}")
        };
        assert_eq!(merged.operator, Operator::In);
        assert_eq!(
            merged.value,
            ConditionValue::Value(Value::from(vec![
                Value::from("bob"),
                Value::from("alice"),
            ]))
        );
    }

    #[test]
    fn and_of_in_and_not_in_subtracts() {
        let (schema, store) = setup();
        let model = ModelEnv::new(&schema, &store, "partner").unwrap();

        let domain = cond(
            "age",
            Operator::In,
            Value::from(vec![Value::Int(1), Value::Int(2)]),
        ) & cond(
            "age",
            Operator::NotIn,
            Value::from(vec![Value::Int(2), Value::Int(5)]),
        );
        let optimized = domain.optimize(&model).unwrap();
        let Domain::Condition(merged) = &optimized else {
            panic!("expected a single merged condition, got {optimized}")
        };
        assert_eq!(merged.operator, Operator::In);
        assert_eq!(
            merged.value,
            ConditionValue::Value(Value::from(vec![Value::Int(1)]))
        );
    }

    #[test]
    fn double_negation_optimizes_away() {
        let (schema, store) = setup();
        let model = ModelEnv::new(&schema, &store, "partner").unwrap();

        let base = cond("name", Operator::Eq, Value::from("bob"));
        let optimized = (!!base.clone()).optimize(&model).unwrap();
        assert_eq!(optimized, base.optimize(&model).unwrap());
    }

    #[test]
    fn de_morgan_round_trip() {
        let (schema, store) = setup();
        let model = ModelEnv::new(&schema, &store, "partner").unwrap();

        let a = cond("name", Operator::Eq, Value::from("bob"));
        let b = cond("age", Operator::Gt, Value::Int(18));

        let left = Domain::Not(Box::new(a.clone() & b.clone()))
            .optimize(&model)
            .unwrap();
        let right = ((!a) | (!b)).optimize(&model).unwrap();
        assert_eq!(left, right);
    }

    #[test]
    fn negated_inequality_adds_not_set_check() {
        let (schema, store) = setup();
        let model = ModelEnv::new(&schema, &store, "partner").unwrap();

        let optimized = (!cond("age", Operator::Lt, Value::Int(10)))
            .optimize(&model)
            .unwrap();
        // int has no falsy value: 'not (age < 10)' must keep unset records
        let Domain::Or(nary) = &optimized else {
            panic!("expected Or, got {optimized}")
        };
        assert!(nary.children.iter().any(|child| matches!(
            child,
            Domain::Condition(c) if c.operator == Operator::Ge
        )));
        assert!(nary.children.iter().any(|child| matches!(
            child,
            Domain::Condition(c) if c.operator == Operator::In
        )));
    }

    #[test]
    fn dotted_path_decomposes_into_any() {
        let (schema, store) = setup();
        let model = ModelEnv::new(&schema, &store, "order").unwrap();

        let optimized = cond("partner_id.name", Operator::Eq, Value::from("bob"))
            .optimize(&model)
            .unwrap();
        let Domain::Condition(outer) = &optimized else {
            panic!("expected condition, got {optimized}")
        };
        assert_eq!(outer.path, "partner_id");
        assert_eq!(outer.operator, Operator::Any);
        let sub = outer.value.as_domain().expect("sub-domain");
        let Domain::Condition(inner) = sub else {
            panic!("expected inner condition")
        };
        assert_eq!(inner.path, "name");
        assert_eq!(inner.operator, Operator::In);
    }

    #[test]
    fn any_conditions_on_many2one_merge_under_and() {
        let (schema, store) = setup();
        let model = ModelEnv::new(&schema, &store, "order").unwrap();

        let domain = cond("partner_id.name", Operator::Eq, Value::from("bob"))
            & cond("partner_id.age", Operator::Gt, Value::Int(18));
        let optimized = domain.optimize(&model).unwrap();
        let Domain::Condition(merged) = &optimized else {
            panic!("expected one merged any condition, got {optimized}")
        };
        assert_eq!(merged.operator, Operator::Any);
        let sub = merged.value.as_domain().expect("sub-domain");
        assert!(matches!(sub, Domain::And(_)));
    }

    #[test]
    fn any_with_false_subdomain_collapses() {
        let (schema, store) = setup();
        let model = ModelEnv::new(&schema, &store, "order").unwrap();

        let sub = cond("name", Operator::In, Value::List(ValueList::new()));
        let optimized = cond("partner_id", Operator::Any, sub.clone())
            .optimize(&model)
            .unwrap();
        assert_eq!(optimized, Domain::False);

        let optimized = cond("partner_id", Operator::NotAny, sub)
            .optimize(&model)
            .unwrap();
        assert_eq!(optimized, Domain::True);
    }

    #[test]
    fn bool_tautology_collapses_to_true() {
        let (schema, store) = setup();
        let model = ModelEnv::new(&schema, &store, "partner").unwrap();

        let optimized = cond(
            "active",
            Operator::In,
            Value::from(vec![Value::Bool(true), Value::Bool(false)]),
        )
        .optimize(&model)
        .unwrap();
        assert_eq!(optimized, Domain::True);
    }

    #[test]
    fn bool_false_set_compares_against_true() {
        let (schema, store) = setup();
        let model = ModelEnv::new(&schema, &store, "partner").unwrap();

        let optimized = cond(
            "active",
            Operator::In,
            Value::from(vec![Value::Bool(false)]),
        )
        .optimize(&model)
        .unwrap();
        let Domain::Condition(cond) = &optimized else {
            panic!("expected condition")
        };
        assert_eq!(cond.operator, Operator::NotIn);
        assert_eq!(
            cond.value,
            ConditionValue::Value(Value::from(vec![Value::Bool(true)]))
        );
    }

    #[test]
    fn relational_string_comparison_searches_display_name() {
        let (schema, store) = setup();
        let model = ModelEnv::new(&schema, &store, "order").unwrap();

        let optimized = cond("partner_id", Operator::Eq, Value::from("bob"))
            .optimize(&model)
            .unwrap();
        let Domain::Condition(outer) = &optimized else {
            panic!("expected condition, got {optimized}")
        };
        assert_eq!(outer.operator, Operator::Any);
        let sub = outer.value.as_domain().expect("sub-domain");
        let Domain::Condition(inner) = sub else {
            panic!("expected inner condition")
        };
        assert_eq!(inner.path, "display_name");
    }

    #[test]
    fn non_stored_field_expands_through_search() {
        let (schema, store) = setup();
        let model = ModelEnv::new(&schema, &store, "partner").unwrap();

        // 'adult' is non-stored; its search handler rewrites to an age check
        let optimized = cond("adult", Operator::Eq, Value::Bool(true))
            .optimize(&model)
            .unwrap();
        let Domain::Condition(cond) = &optimized else {
            panic!("expected condition, got {optimized}")
        };
        assert_eq!(cond.path, "age");
        assert_eq!(cond.operator, Operator::Ge);
    }

    #[test]
    fn datetime_gt_bumps_to_next_second() {
        let (schema, store) = setup();
        let model = ModelEnv::new(&schema, &store, "order").unwrap();

        let instant = "2024-03-01T10:20:30".parse::<NaiveDateTime>().unwrap();
        let optimized = cond("confirmed_at", Operator::Gt, Value::DateTime(instant))
            .optimize(&model)
            .unwrap();
        let Domain::Condition(cond) = &optimized else {
            panic!("expected condition")
        };
        assert_eq!(cond.operator, Operator::Ge);
        let expected = "2024-03-01T10:20:31".parse::<NaiveDateTime>().unwrap();
        assert_eq!(cond.value, ConditionValue::Value(Value::DateTime(expected)));
    }

    #[test]
    fn datetime_equality_against_date_expands_to_day_range() {
        let (schema, store) = setup();
        let model = ModelEnv::new(&schema, &store, "order").unwrap();

        let day = "2024-03-01".parse::<NaiveDate>().unwrap();
        let optimized = cond("confirmed_at", Operator::Eq, Value::Date(day))
            .optimize(&model)
            .unwrap();
        let Domain::And(nary) = &optimized else {
            panic!("expected day range, got {optimized}")
        };
        assert_eq!(nary.children.len(), 2);
    }

    #[test]
    fn inherited_field_delegates_to_parent() {
        let (schema, store) = setup();
        let model = ModelEnv::new(&schema, &store, "employee").unwrap();

        let optimized = cond("name", Operator::Eq, Value::from("bob"))
            .optimize(&model)
            .unwrap();
        let Domain::Condition(outer) = &optimized else {
            panic!("expected condition, got {optimized}")
        };
        assert_eq!(outer.path, "partner_id");
        assert_eq!(outer.operator, Operator::Any);
    }

    #[test]
    fn unknown_field_is_invalid() {
        let (schema, store) = setup();
        let model = ModelEnv::new(&schema, &store, "partner").unwrap();

        let result = cond("nope", Operator::Eq, Value::Int(1)).optimize(&model);
        assert!(matches!(result, Err(DomainError::Invalid { .. })));
    }

    #[test]
    fn any_on_non_relational_field_is_invalid() {
        let (schema, store) = setup();
        let model = ModelEnv::new(&schema, &store, "partner").unwrap();

        let sub = cond("x", Operator::Eq, Value::Int(1));
        let result = cond("age", Operator::Any, sub).optimize(&model);
        assert!(matches!(result, Err(DomainError::Invalid { .. })));
    }
}
