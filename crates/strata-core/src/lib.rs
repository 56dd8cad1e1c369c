//! Core runtime for strata: values, schema models, the domain algebra, the
//! record cache, and the dependency-driven recompute scheduler.
#![warn(unreachable_pub)]

// public exports are one module level down
pub mod cache;
pub mod domain;
pub mod error;
pub mod model;
pub mod recompute;
pub mod store;
pub mod txn;
pub mod value;

// test
#[cfg(test)]
pub(crate) mod test_support;

///
/// CONSTANTS
///

/// Maximum number of fixpoint iterations for the recompute drain and flush
/// loops. Exceeding the cap is logged as a warning (likely dependency cycle)
/// and leaves the remaining work pending for the next flush.
pub const MAX_FIXPOINT_ITERATIONS: usize = 10;

/// Maximum number of rewrite iterations when optimizing a single domain
/// node. This is a circuit breaker for a buggy merge rule; reaching it is an
/// internal error.
pub const MAX_OPTIMIZE_ITERATIONS: usize = 1000;

/// Upper bound on the number of records handed to one compute invocation.
pub const PREFETCH_MAX: usize = 1000;

///
/// Prelude
///
/// Prelude contains only domain vocabulary.
/// No errors, stores, or helpers are re-exported here.
///

pub mod prelude {
    pub use crate::{
        domain::{Condition, Domain, DomainItem, ModelEnv, Operator},
        model::{EntityId, FieldId, SchemaBuilder, SchemaRegistry},
        txn::{Environment, TransactionId, TransactionManager},
        value::{RecordId, Value, ValueList},
    };
}
