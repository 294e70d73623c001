//! Error types for the object model.

use thiserror::Error;

pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised by key/object validation and identity checks.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("{typ} {key} not found")]
    NotFound { typ: &'static str, key: String },

    #[error("{typ} {key} already exists")]
    AlreadyExists { typ: &'static str, key: String },

    #[error("{typ} {key} is being deleted")]
    BeingDeleted { typ: &'static str, key: String },

    #[error("invalid argument: {0}")]
    InvalidArg(String),
}

impl ModelError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ModelError::InvalidArg(msg.into())
    }
}
