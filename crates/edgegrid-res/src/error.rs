//! Error types for resource calculations.

use thiserror::Error;

pub type ResResult<T> = Result<T, ResError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResError {
    #[error("no suitable infra flavor found for requested node resources, {0}")]
    NoFlavorMatch(String),

    #[error("cloudlet {cloudlet} does not support GPU resource {resource:?}")]
    GpuUnsupported { cloudlet: String, resource: String },

    #[error("optional resource requested, cloudlet {0} supports none")]
    NoOptionalResources(String),

    #[error("not enough {resource} available on {cloudlet}: requires {required}, only {available} free")]
    InsufficientResources {
        cloudlet: String,
        resource: String,
        required: u64,
        available: u64,
    },

    #[error("{0} missing runtime info, site may be offline")]
    MissingCloudletInfo(String),

    #[error("{0}")]
    Dependency(String),
}
