//! The CRM boundary.
//!
//! The controller never talks to infrastructure itself; it hands the
//! committed intent to the site's resource manager and watches the
//! object's progress channel. Connectors dispatch asynchronously and
//! report through the bus and the notify path, never through a return
//! value.

use edgegrid_model::{App, AppInst, Cloudlet, ClusterInst};

/// The operation being delegated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrmOp {
    Create,
    Update,
    Delete,
}

/// Dispatches committed intent to the site CRM. Implementations must not
/// block: they queue the work and return.
pub trait CrmConnector: Send + Sync + 'static {
    fn apply_cluster_inst(&self, cluster: &ClusterInst, op: CrmOp);
    fn apply_app_inst(&self, inst: &AppInst, app: &App, op: CrmOp);
    fn apply_cloudlet(&self, cloudlet: &Cloudlet, op: CrmOp);
}

/// A connector that drops everything, for wiring tests and the
/// IgnoreCrm override path.
pub struct NoopCrm;

impl CrmConnector for NoopCrm {
    fn apply_cluster_inst(&self, _cluster: &ClusterInst, _op: CrmOp) {}
    fn apply_app_inst(&self, _inst: &AppInst, _app: &App, _op: CrmOp) {}
    fn apply_cloudlet(&self, _cloudlet: &Cloudlet, _op: CrmOp) {}
}
