use crate::{
    domain::{
        Condition, Domain, DomainError, DomainResult, Operator,
        condition::{ConditionValue, SubQuery},
    },
    value::{Value, ValueList},
};
use serde::{Deserialize, Serialize};

///
/// LogicToken
///
/// Prefix-notation boolean operators of the flat domain form: `&` and `|`
/// are binary, `!` is unary.
///

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum LogicToken {
    #[serde(rename = "&")]
    And,
    #[serde(rename = "|")]
    Or,
    #[serde(rename = "!")]
    Not,
}

///
/// ItemValue
///
/// Right-hand side of a flat condition. A nested list of items stands for a
/// sub-domain (only meaningful with the `any` family); everything else is a
/// plain value.
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ItemValue {
    Items(Vec<DomainItem>),
    Scalar(Value),
}

///
/// DomainItem
///
/// One element of the flat polish-notation domain list. This is the only
/// wire-compatible representation: RPC callers never see the AST.
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DomainItem {
    Token(LogicToken),
    Triple(String, Operator, ItemValue),
}

impl DomainItem {
    #[must_use]
    pub fn triple(path: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self::Triple(path.into(), operator, ItemValue::Scalar(value.into()))
    }
}

impl Domain {
    /// Build a domain from the flat prefix-notation list.
    ///
    /// Operands are pushed while traversing the list in reverse; logic
    /// tokens pop their arity off the stack. Leftover operands are
    /// implicitly AND-ed in their original order.
    pub fn from_items(items: &[DomainItem]) -> DomainResult<Self> {
        fn pop(stack: &mut Vec<Domain>, token: LogicToken) -> DomainResult<Domain> {
            stack.pop().ok_or_else(|| DomainError::Malformed {
                reason: format!("missing operand for '{token:?}'"),
            })
        }

        let mut stack: Vec<Self> = Vec::new();
        for item in items.iter().rev() {
            match item {
                DomainItem::Token(token @ LogicToken::And) => {
                    let left = pop(&mut stack, *token)?;
                    let right = pop(&mut stack, *token)?;
                    stack.push(left & right);
                }
                DomainItem::Token(token @ LogicToken::Or) => {
                    let left = pop(&mut stack, *token)?;
                    let right = pop(&mut stack, *token)?;
                    stack.push(left | right);
                }
                DomainItem::Token(token @ LogicToken::Not) => {
                    let child = pop(&mut stack, *token)?;
                    stack.push(!child);
                }
                DomainItem::Triple(path, operator, value) => {
                    let value = item_value_to_condition(value)?;
                    stack.push(Condition::new(path.clone(), *operator, value).checked()?);
                }
            }
        }

        stack.reverse();
        Ok(Self::and_all(stack))
    }

    /// Flatten back to the legacy prefix-notation list.
    #[must_use]
    pub fn to_items(&self) -> Vec<DomainItem> {
        let mut out = Vec::new();
        push_items(self, &mut out);
        out
    }
}

fn item_value_to_condition(value: &ItemValue) -> DomainResult<ConditionValue> {
    match value {
        ItemValue::Scalar(value) => Ok(ConditionValue::Value(value.clone())),
        // an empty nested list is an empty value collection, not a domain
        ItemValue::Items(items) if items.is_empty() => {
            Ok(ConditionValue::Value(Value::List(ValueList::new())))
        }
        ItemValue::Items(items) => {
            Ok(ConditionValue::Domain(Box::new(Domain::from_items(items)?)))
        }
    }
}

fn push_items(domain: &Domain, out: &mut Vec<DomainItem>) {
    match domain {
        // the empty domain is TRUE in the legacy form
        Domain::True => {}
        // FALSE has no constant leaf; "id in ()" is its canonical spelling
        Domain::False => out.push(DomainItem::Triple(
            "id".to_string(),
            Operator::In,
            ItemValue::Scalar(Value::List(ValueList::new())),
        )),
        Domain::Not(child) => {
            out.push(DomainItem::Token(LogicToken::Not));
            push_items(child, out);
        }
        Domain::And(nary) => {
            for _ in 1..nary.children.len() {
                out.push(DomainItem::Token(LogicToken::And));
            }
            for child in &nary.children {
                push_items(child, out);
            }
        }
        Domain::Or(nary) => {
            for _ in 1..nary.children.len() {
                out.push(DomainItem::Token(LogicToken::Or));
            }
            for child in &nary.children {
                push_items(child, out);
            }
        }
        Domain::Condition(cond) => {
            let value = match &cond.value {
                ConditionValue::Value(value) => ItemValue::Scalar(value.clone()),
                ConditionValue::Domain(sub) => ItemValue::Items(sub.to_items()),
                ConditionValue::Query(SubQuery { ids }) => ItemValue::Scalar(Value::List(
                    ids.iter().map(|id| Value::Id(*id)).collect(),
                )),
            };
            out.push(DomainItem::Triple(cond.path.clone(), cond.operator, value));
        }
    }
}

///
/// TESTS
///
