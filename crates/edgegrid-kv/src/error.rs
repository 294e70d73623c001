//! Error types for the KV store.

use thiserror::Error;

pub type KvResult<T> = Result<T, KvError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("key {0} already exists")]
    KeyExists(String),

    #[error("key {0} not found")]
    KeyNotFound(String),

    #[error("lease {0} not found")]
    LeaseNotFound(i64),

    #[error("transaction conflict persisted after {0} attempts")]
    TxConflict(u32),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialize(String),
}
