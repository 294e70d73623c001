//! Controller API errors.
//!
//! Identity failures (not-found, already-exists, being-deleted) come
//! through the model error; everything else maps onto the categories
//! callers act on: validation, conflict, placement failure, infra
//! failure, internal.

use edgegrid_kv::KvError;
use edgegrid_lifecycle::LifecycleError;
use edgegrid_model::ModelError;
use edgegrid_placement::PlacementError;
use edgegrid_res::ResError;
use edgegrid_store::StoreError;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Another object holds a reference; safe delete was reverted.
    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error(transparent)]
    Res(#[from] ResError),

    /// CRM reported an error or the coordinator gave up waiting.
    #[error(transparent)]
    Infra(#[from] LifecycleError),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Kv(e) => ApiError::Kv(e),
            StoreError::Model(e) => ApiError::Model(e),
            StoreError::Marshal { typ, msg } => {
                ApiError::Internal(format!("marshal {typ}: {msg}"))
            }
        }
    }
}

impl ApiError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ApiError::Model(ModelError::InvalidArg(msg.into()))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Model(ModelError::NotFound { .. }))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ApiError::Model(ModelError::AlreadyExists { .. }))
    }

    pub fn is_being_deleted(&self) -> bool {
        matches!(self, ApiError::Model(ModelError::BeingDeleted { .. }))
    }
}
