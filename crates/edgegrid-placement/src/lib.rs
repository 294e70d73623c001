//! edgegrid-placement — selects where an AppInst runs.
//!
//! Given the candidate cloudlets (resolved from the request's cluster,
//! zone, or the whole region) with their current clusters and usage, the
//! placer filters out incapable sites, decides per cloudlet how the
//! instance gets a cluster (existing, reservable reuse, scale-up, or a
//! new autocluster), scores what remains, and returns the winner or an
//! aggregate of every rejection reason.

pub mod placer;

pub use placer::{
    build_reservable_cluster_name, place, select_cluster_action, verify_target_cluster,
    CloudletCandidate, ClusterAction, ClusterDemand, Placement, PlacementError, PLATFORM_ORG,
};
