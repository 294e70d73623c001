//! edgegrid-res — resource accounting for cloudlets and clusters.
//!
//! Answers the questions placement needs: does this cloudlet have room
//! for another cluster or VM app, which infra flavor realizes a resource
//! request, and how loaded is a cluster. All reads go through the
//! [`ResDataSource`] trait so the same code serves STM transactions and
//! cache-only dry runs.

pub mod calc;
pub mod error;
pub mod resval;
pub mod vmspec;

pub use calc::{
    cluster_fits_demand, cluster_resource_usage, CloudletResCalc, ClusterResourceUsage,
    ResCalcDeps, ResDataSource,
};
pub use error::{ResError, ResResult};
pub use resval::{resnames, ResValMap};
pub use vmspec::{get_vm_spec, get_vm_spec_for_flavor, VmSpec};
