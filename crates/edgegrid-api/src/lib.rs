//! edgegrid-api — the regional controller.
//!
//! Composes the stores, caches, resource calculator, placement engine,
//! and lifecycle coordinator into the per-type APIs: App, AppInst,
//! ClusterInst, Cloudlet (+Info), Zone, Flavor, policies, and resource
//! tag tables. The [`Controller`] handle is the whole public surface;
//! the northbound adapter and the notify fan-out sit on top of it.

mod app_api;
mod appinst_api;
mod catalog_api;
mod cloudlet_api;
mod cluster_api;
mod controller;
mod error;
mod notify_glue;
mod policy_api;
mod refs;
mod secret;
mod workers;
mod zone_api;

pub use controller::{Controller, ControllerOpts};
pub use error::{ApiError, ApiResult};
pub use notify_glue::attach_notify;
pub use secret::{InMemorySecretStore, SecretStore};
pub use workers::WorkQueue;
