use crate::{
    domain::Domain,
    model::{EntityId, FieldId, SchemaRegistry},
    value::{RecordId, Value},
};
use std::collections::BTreeSet;
use thiserror::Error as ThisError;

///
/// StoreError
///

#[derive(Debug, ThisError)]
pub enum StoreError {
    #[error("record {record} of '{entity}' not found")]
    NotFound { entity: String, record: RecordId },

    #[error("store backend error: {message}")]
    Backend { message: String },
}

///
/// RecordStore
///
/// Persistence collaborator consumed by the cache and the scheduler. From
/// this crate's perspective every call is an opaque synchronous operation;
/// transaction isolation is the backend's concern.
///

pub trait RecordStore {
    /// Persisted values of `field` for the given records. Missing records
    /// are skipped, not errors.
    fn fetch(
        &self,
        registry: &SchemaRegistry,
        field: FieldId,
        ids: &[RecordId],
    ) -> Result<Vec<(RecordId, Value)>, StoreError>;

    /// Subset of `ids` that exist for `entity`.
    fn exists(
        &self,
        registry: &SchemaRegistry,
        entity: EntityId,
        ids: &[RecordId],
    ) -> Result<BTreeSet<RecordId>, StoreError>;

    /// Records whose `relation` field references any of `targets` (the
    /// backward traversal of a relation).
    fn records_referencing(
        &self,
        registry: &SchemaRegistry,
        relation: FieldId,
        targets: &BTreeSet<RecordId>,
    ) -> Result<BTreeSet<RecordId>, StoreError>;

    /// Ids of `entity` records matching an (optimized or raw) domain.
    fn search_ids(
        &self,
        registry: &SchemaRegistry,
        entity: EntityId,
        domain: &Domain,
    ) -> Result<Vec<RecordId>, StoreError>;

    /// Write flushed values back to persistent storage.
    fn persist(
        &self,
        registry: &SchemaRegistry,
        field: FieldId,
        values: &[(RecordId, Value)],
    ) -> Result<(), StoreError>;
}
