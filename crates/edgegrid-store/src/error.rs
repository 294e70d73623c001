//! Error types for stores and caches.

use edgegrid_kv::KvError;
use edgegrid_model::ModelError;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("marshaling error for {typ}: {msg}")]
    Marshal { typ: &'static str, msg: String },
}
