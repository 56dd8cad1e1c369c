use crate::{
    cache::CacheMiss, domain::DomainError, model::SchemaError, recompute::RecomputeError,
    store::StoreError,
};
use thiserror::Error as ThisError;

///
/// Error
///

#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    CacheMiss(#[from] CacheMiss),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Recompute(#[from] RecomputeError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
