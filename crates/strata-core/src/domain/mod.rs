pub mod ast;
pub mod condition;
pub(crate) mod hierarchy;
pub mod items;
pub mod operator;
pub mod optimize;

#[cfg(test)]
mod tests;

pub use ast::{Domain, Nary};
pub use condition::{Condition, ConditionValue, SubQuery};
pub use items::{DomainItem, ItemValue, LogicToken};
pub use operator::{Operator, OperatorParseError};
pub use optimize::ModelEnv;

use thiserror::Error as ThisError;

///
/// DomainError
///
/// `Malformed` is a structurally broken flat list; `Invalid` is a
/// syntactically fine condition that does not fit the schema. Both are fatal
/// to the current optimize/search call. `Internal` flags optimizer bugs.
///

#[derive(Debug, ThisError)]
pub enum DomainError {
    #[error("malformed domain: {reason}")]
    Malformed { reason: String },

    #[error("invalid condition {condition}: {reason}")]
    Invalid { condition: String, reason: String },

    #[error("domain optimizer invariant violated: {reason}")]
    Internal { reason: String },

    #[error(transparent)]
    Schema(#[from] crate::model::SchemaError),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

pub type DomainResult<T> = Result<T, DomainError>;
