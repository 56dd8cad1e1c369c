use crate::{
    domain::{Domain, DomainError, DomainResult, Operator, ast::OptimizeTag},
    value::{RecordId, Value, ValueList},
};
use std::fmt;

///
/// SubQuery
///
/// Opaque pre-resolved sub-query handle: the id set produced by a search
/// that already ran. The optimizer lowers it into a plain `in` condition.
///

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SubQuery {
    pub ids: Vec<RecordId>,
}

impl SubQuery {
    #[must_use]
    pub fn new(ids: impl IntoIterator<Item = RecordId>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }
}

///
/// ConditionValue
///
/// Right-hand side of a condition: a scalar or collection value, a nested
/// domain (for `any`-family operators), or a sub-query handle.
///

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum ConditionValue {
    Value(Value),
    Domain(Box<Domain>),
    Query(SubQuery),
}

impl ConditionValue {
    #[must_use]
    pub const fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_domain(&self) -> Option<&Domain> {
        match self {
            Self::Domain(domain) => Some(domain),
            _ => None,
        }
    }
}

impl fmt::Display for ConditionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => write!(f, "{value}"),
            Self::Domain(domain) => write!(f, "{domain:?}"),
            Self::Query(query) => write!(f, "<query:{} ids>", query.ids.len()),
        }
    }
}

impl From<Value> for ConditionValue {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Domain> for ConditionValue {
    fn from(domain: Domain) -> Self {
        Self::Domain(Box::new(domain))
    }
}

impl From<SubQuery> for ConditionValue {
    fn from(query: SubQuery) -> Self {
        Self::Query(query)
    }
}

///
/// Condition
///
/// A single `(path, operator, value)` comparison. Immutable: every rewrite
/// builds a new condition. The optimizer stamp is carried outside of the
/// structural identity.
///

#[derive(Clone, Debug)]
pub struct Condition {
    pub path: String,
    pub operator: Operator,
    pub value: ConditionValue,
    pub(crate) optimized: Option<OptimizeTag>,
}

impl PartialEq for Condition {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.operator == other.operator && self.value == other.value
    }
}

impl Eq for Condition {}

impl std::hash::Hash for Condition {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.path.hash(state);
        self.operator.hash(state);
        self.value.hash(state);
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "('{}', '{}', {})", self.path, self.operator, self.value)
    }
}

impl Condition {
    #[must_use]
    pub fn new(
        path: impl Into<String>,
        operator: Operator,
        value: impl Into<ConditionValue>,
    ) -> Self {
        Self {
            path: path.into(),
            operator,
            value: value.into(),
            optimized: None,
        }
    }

    /// Rebuild with new parts, dropping the optimizer stamp.
    #[must_use]
    pub(crate) fn rewrite(
        &self,
        path: impl Into<String>,
        operator: Operator,
        value: impl Into<ConditionValue>,
    ) -> Self {
        Self::new(path, operator, value)
    }

    pub(crate) fn invalid(&self, reason: impl Into<String>) -> DomainError {
        DomainError::Invalid {
            condition: self.to_string(),
            reason: reason.into(),
        }
    }

    /// Validate the condition and normalize the common sugar, returning the
    /// resulting (possibly constant) domain.
    ///
    /// These rewrites are cheap and always-on; the schema-aware ones live in
    /// the optimizer.
    pub fn checked(mut self) -> DomainResult<Domain> {
        if self.path.is_empty() {
            return Err(DomainError::Invalid {
                condition: self.to_string(),
                reason: "empty field name".to_string(),
            });
        }

        // a not-set marker compares like false
        if matches!(self.value, ConditionValue::Value(Value::Null)) {
            self.value = ConditionValue::Value(Value::Bool(false));
        }

        // domain/query values only make sense with 'any'-family or 'in'
        // operators; legacy callers are warned, not rejected
        if matches!(
            self.value,
            ConditionValue::Domain(_) | ConditionValue::Query(_)
        ) && !matches!(
            self.operator,
            Operator::Any | Operator::NotAny | Operator::In | Operator::NotIn
        ) {
            log::warn!(
                "condition {self} should use the 'any' or 'not any' operator"
            );
        }

        // a =? b  <=>  not b or a = b
        if self.operator == Operator::EqIfSet {
            if let ConditionValue::Value(value) = &self.value
                && !value.truthy()
            {
                return Ok(Domain::True);
            }
            self.operator = Operator::Eq;
        }

        // equality against a collection is a set membership check
        if matches!(self.operator, Operator::Eq | Operator::Ne)
            && let ConditionValue::Value(Value::List(list)) = &self.value
        {
            let operator = if self.operator == Operator::Eq {
                Operator::In
            } else {
                Operator::NotIn
            };
            let value = if list.is_empty() {
                // an empty collection here means "not set"
                ValueList::from_values([Value::Bool(false)])
            } else {
                list.clone()
            };
            self = self.rewrite(self.path.clone(), operator, Value::List(value));
        }

        // 'in' over a sub-domain or sub-query is an 'any' condition
        if matches!(self.operator, Operator::In | Operator::NotIn)
            && matches!(
                self.value,
                ConditionValue::Domain(_) | ConditionValue::Query(_)
            )
        {
            self.operator = if self.operator == Operator::In {
                Operator::Any
            } else {
                Operator::NotAny
            };
        }

        // empty collection short-circuits
        if matches!(self.operator, Operator::In | Operator::NotIn)
            && let ConditionValue::Value(Value::List(list)) = &self.value
            && list.is_empty()
        {
            return Ok(if self.operator == Operator::In {
                Domain::False
            } else {
                Domain::True
            });
        }

        // 'any' on the identifier pseudo-field is the nested domain itself
        if matches!(self.operator, Operator::Any | Operator::NotAny)
            && self.path == "id"
            && matches!(self.value, ConditionValue::Domain(_))
        {
            let ConditionValue::Domain(domain) = self.value else {
                unreachable!("checked above");
            };
            return Ok(if self.operator == Operator::Any {
                *domain
            } else {
                !*domain
            });
        }

        Ok(Domain::Condition(self))
    }
}

///
/// TESTS
///
