//! Facade crate for the strata runtime.
//!
//! ## Crate layout
//! - `core`: domain algebra, schema models, record cache, recompute
//!   scheduler.
//!
//! The `prelude` module mirrors the surface used by application code.

pub use strata_core as core;

pub use strata_core::error::Error;

/// Workspace version re-export for downstream tooling/tests.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

///
/// Prelude
///

pub mod prelude {
    pub use strata_core::{
        MAX_FIXPOINT_ITERATIONS, MAX_OPTIMIZE_ITERATIONS, PREFETCH_MAX,
        cache::{CacheMiss, ContextKey, RecordCache},
        domain::{
            Condition, ConditionValue, Domain, DomainError, DomainItem, ItemValue, LogicToken,
            ModelEnv, Operator, SubQuery,
        },
        model::{
            EntityId, FieldDef, FieldId, FieldKind, SchemaBuilder, SchemaError, SchemaRegistry,
            TriggerTree,
        },
        recompute::{ComputeScope, RecomputeError},
        store::{RecordStore, StoreError},
        txn::{Context, Environment, Transaction, TransactionId, TransactionManager},
        value::{RecordId, Value, ValueList},
    };
}
