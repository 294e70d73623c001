//! The placement decision.
//!
//! Selection order per cloudlet: (a) the cluster the user named,
//! (b) reuse of a reservable cluster, (c) scale-up of a cluster the
//! requester may grow, (d) a new autocluster. Cloudlets that pass get
//! ranked by free-capacity score, ties broken by name so placement is
//! deterministic.

use edgegrid_model::dnslabel::dns_sanitize;
use edgegrid_model::{
    Cloudlet, CloudletKey, ClusterInst, ClusterKey, DeploymentType, NodePool, TrackedState,
};
use edgegrid_res::{cluster_fits_demand, ClusterResourceUsage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Organization that owns platform-created reservable clusters.
pub const PLATFORM_ORG: &str = "edgegrid";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlacementError {
    /// Every candidate was rejected; carries the per-cloudlet reasons.
    #[error("no cloudlet fits the request: {0}")]
    NoFit(String),

    #[error("no candidate cloudlets in the requested zone")]
    NoCandidates,
}

/// What the instance needs from a cluster.
#[derive(Debug, Clone)]
pub struct ClusterDemand {
    /// Requesting developer organization.
    pub org: String,
    pub deployment: DeploymentType,
    /// Total (vcpus, ram_mb, disk_gb) the instance will consume.
    pub demand: (u64, u64, u64),
    /// Pool shape for a newly created autocluster.
    pub new_cluster_pool: NodePool,
    /// Minimum Kubernetes version, empty for any.
    pub min_kubernetes_version: String,
}

/// One cloudlet under consideration, with everything the decision needs.
#[derive(Debug, Clone)]
pub struct CloudletCandidate {
    pub cloudlet: Cloudlet,
    /// Site currently reporting READY.
    pub online: bool,
    /// Free-capacity score from the resource calculator.
    pub score: u64,
    /// Clusters on this cloudlet visible to the requester (reservable or
    /// owned by the requesting org), with current usage.
    pub clusters: Vec<(ClusterInst, ClusterResourceUsage)>,
}

/// How the chosen cloudlet provides a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterAction {
    /// Use a cluster as-is (named target or reservable reuse).
    UseExisting { key: ClusterKey },
    /// Grow the scalable pool of an existing cluster.
    ScaleUp {
        key: ClusterKey,
        pool_name: String,
        add_nodes: u32,
    },
    /// Create a reservable autocluster (id allocated transactionally by
    /// the caller).
    CreateNewAuto,
    /// VM app, no cluster involved.
    VmApp,
}

/// The selected placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub cloudlet_key: CloudletKey,
    pub action: ClusterAction,
    pub score: u64,
}

fn action_rank(action: &ClusterAction) -> u8 {
    match action {
        ClusterAction::UseExisting { .. } => 0,
        ClusterAction::ScaleUp { .. } => 1,
        ClusterAction::CreateNewAuto | ClusterAction::VmApp => 2,
    }
}

/// Deterministic name for a reservable autocluster, so the same id on
/// the same cloudlet always reuses the same name.
pub fn build_reservable_cluster_name(id: u32, cloudlet_key: &CloudletKey) -> String {
    format!("reservable{id}-{}", dns_sanitize(&cloudlet_key.name))
}

/// Platform/state screen applied before any cluster decision.
fn screen_cloudlet(
    candidate: &CloudletCandidate,
    deployment: DeploymentType,
) -> Result<(), String> {
    let cloudlet = &candidate.cloudlet;
    if !candidate.online {
        return Err("site is not ready".to_string());
    }
    if !cloudlet.accepts_new_instances() {
        return Err("site is under maintenance".to_string());
    }
    if cloudlet.state == TrackedState::Updating || cloudlet.state == TrackedState::UpdateRequested
    {
        return Err("site is upgrading".to_string());
    }
    let features = &cloudlet.features;
    match deployment {
        DeploymentType::Vm => {
            if features.is_single_kubernetes_cluster || features.kubernetes_only {
                return Err("platform does not support VM apps".to_string());
            }
            if !features.supports_vm_apps {
                return Err("platform does not support VM apps".to_string());
            }
        }
        DeploymentType::Docker => {
            if features.is_single_kubernetes_cluster || features.kubernetes_only {
                return Err("platform only hosts Kubernetes workloads".to_string());
            }
        }
        DeploymentType::Kubernetes | DeploymentType::Helm => {}
    }
    Ok(())
}

/// Validate a cluster the user explicitly named.
pub fn verify_target_cluster(
    cluster: &ClusterInst,
    usage: &ClusterResourceUsage,
    demand: &ClusterDemand,
) -> Result<(), String> {
    if cluster.delete_prepare {
        return Err(format!("cluster {} is being deleted", cluster.key));
    }
    if !cluster.multi_tenant
        && !cluster.reservable
        && cluster.key.organization != demand.org
    {
        return Err(format!(
            "cluster {} is not accessible to organization {}",
            cluster.key, demand.org
        ));
    }
    if cluster.reservable
        && !cluster.reserved_by.is_empty()
        && cluster.reserved_by != demand.org
    {
        return Err(format!("cluster {} is reserved by another organization", cluster.key));
    }
    if demand.deployment.needs_cluster() && cluster.deployment != cluster_deployment(demand.deployment)
    {
        return Err(format!(
            "cluster {} deployment {} does not match app deployment {}",
            cluster.key, cluster.deployment, demand.deployment
        ));
    }
    if demand.deployment.deploys_to_kubernetes()
        && !cluster.satisfies_kubernetes_version(&demand.min_kubernetes_version)
    {
        return Err(format!(
            "cluster {} kubernetes version {} below required {}",
            cluster.key, cluster.kubernetes_version, demand.min_kubernetes_version
        ));
    }
    if !cluster_fits_demand(usage, demand.demand) && scale_up_nodes(cluster, usage, demand).is_none()
    {
        return Err(format!("cluster {} has insufficient free resources", cluster.key));
    }
    Ok(())
}

/// The cluster deployment kind an app deployment maps onto.
fn cluster_deployment(deployment: DeploymentType) -> DeploymentType {
    match deployment {
        DeploymentType::Helm => DeploymentType::Kubernetes,
        other => other,
    }
}

/// Nodes to add to the cluster's sole scalable pool to absorb the
/// demand, or None if it cannot be grown that way.
fn scale_up_nodes(
    cluster: &ClusterInst,
    usage: &ClusterResourceUsage,
    demand: &ClusterDemand,
) -> Option<u32> {
    let mut scalable = cluster.node_pools.iter().filter(|p| p.scalable);
    let pool = scalable.next()?;
    if scalable.next().is_some() {
        return None;
    }
    let per_node = &pool.node_resources;
    if per_node.vcpus == 0 || per_node.ram_mb == 0 {
        return None;
    }
    let missing = |need: u64, free: u64, per: u64| -> u64 {
        if per == 0 || need <= free {
            0
        } else {
            (need - free).div_ceil(per)
        }
    };
    let (need_v, need_r, need_d) = demand.demand;
    let nodes = missing(need_v, usage.free.get(edgegrid_res::resnames::VCPUS), per_node.vcpus)
        .max(missing(need_r, usage.free.get(edgegrid_res::resnames::RAM_MB), per_node.ram_mb))
        .max(missing(
            need_d,
            usage.free.get(edgegrid_res::resnames::DISK_GB),
            per_node.disk_gb.max(1),
        ));
    if nodes == 0 {
        return None;
    }
    u32::try_from(nodes).ok()
}

/// Decide how one cloudlet would provide a cluster: rules (b) reservable
/// reuse, (c) scale-up, (d) new autocluster, in that order. Rule (a),
/// the user-named cluster, is resolved by the caller before placement.
pub fn select_cluster_action(
    candidate: &CloudletCandidate,
    demand: &ClusterDemand,
) -> Result<ClusterAction, String> {
    if demand.deployment == DeploymentType::Vm {
        return Ok(ClusterAction::VmApp);
    }
    let wanted = cluster_deployment(demand.deployment);

    // (b) Reservable reuse: platform-owned, right deployment, version
    // compatible, free (or already ours), with room as-is.
    for (cluster, usage) in &candidate.clusters {
        if !cluster.reservable || cluster.delete_prepare {
            continue;
        }
        if cluster.deployment != wanted {
            continue;
        }
        if !cluster.reserved_by.is_empty() && cluster.reserved_by != demand.org {
            continue;
        }
        if demand.deployment.deploys_to_kubernetes()
            && !cluster.satisfies_kubernetes_version(&demand.min_kubernetes_version)
        {
            continue;
        }
        if cluster.state != TrackedState::Ready {
            continue;
        }
        if cluster_fits_demand(usage, demand.demand) {
            debug!(cluster = %cluster.key, "reusing reservable cluster");
            return Ok(ClusterAction::UseExisting {
                key: cluster.key.clone(),
            });
        }
        // (c) Scale-up of a cluster we could otherwise use.
        if let Some(add_nodes) = scale_up_nodes(cluster, usage, demand) {
            if let Some(pool) = cluster.node_pools.iter().find(|p| p.scalable) {
                debug!(cluster = %cluster.key, add_nodes, "scaling up reservable cluster");
                return Ok(ClusterAction::ScaleUp {
                    key: cluster.key.clone(),
                    pool_name: pool.name.clone(),
                    add_nodes,
                });
            }
        }
    }

    // (d) New autocluster, if the platform allows creating clusters.
    if candidate.cloudlet.features.is_single_kubernetes_cluster {
        return Err("single-cluster platform has no room in its cluster".to_string());
    }
    Ok(ClusterAction::CreateNewAuto)
}

/// Run the full decision across all candidates and pick the winner:
/// highest score, ties broken by cloudlet name.
pub fn place(
    demand: &ClusterDemand,
    candidates: &[CloudletCandidate],
) -> Result<Placement, PlacementError> {
    if candidates.is_empty() {
        return Err(PlacementError::NoCandidates);
    }
    let mut accepted: Vec<Placement> = Vec::new();
    let mut rejections: Vec<String> = Vec::new();

    for candidate in candidates {
        let name = candidate.cloudlet.key.to_string();
        if let Err(reason) = screen_cloudlet(candidate, demand.deployment) {
            rejections.push(format!("{name}: {reason}"));
            continue;
        }
        match select_cluster_action(candidate, demand) {
            Ok(action) => accepted.push(Placement {
                cloudlet_key: candidate.cloudlet.key.clone(),
                action,
                score: candidate.score,
            }),
            Err(reason) => rejections.push(format!("{name}: {reason}")),
        }
    }

    // Reuse beats growth beats a fresh cluster; within a tier, the
    // freest cloudlet wins and names break ties for determinism.
    accepted.sort_by(|a, b| {
        action_rank(&a.action)
            .cmp(&action_rank(&b.action))
            .then_with(|| b.score.cmp(&a.score))
            .then_with(|| a.cloudlet_key.cmp(&b.cloudlet_key))
    });
    match accepted.into_iter().next() {
        Some(placement) => Ok(placement),
        None => {
            rejections.sort();
            Err(PlacementError::NoFit(rejections.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgegrid_model::{CloudletKey, NodeResources};
    use edgegrid_res::cluster_resource_usage;

    fn pool(vcpus: u64, ram: u64, disk: u64, nodes: u32, scalable: bool) -> NodePool {
        NodePool {
            name: "workers".to_string(),
            num_nodes: nodes,
            node_resources: NodeResources {
                vcpus,
                ram_mb: ram,
                disk_gb: disk,
                ..Default::default()
            },
            scalable,
        }
    }

    fn reservable_cluster(name: &str, cloudlet: &str, reserved_by: &str) -> ClusterInst {
        ClusterInst {
            key: ClusterKey::new(PLATFORM_ORG, name),
            cloudlet_key: CloudletKey::new("op", cloudlet),
            deployment: DeploymentType::Kubernetes,
            node_pools: vec![pool(2, 2048, 10, 2, true)],
            reservable: true,
            auto: true,
            reserved_by: reserved_by.to_string(),
            kubernetes_version: "1.28".to_string(),
            state: TrackedState::Ready,
            ..Default::default()
        }
    }

    fn candidate(name: &str, score: u64, clusters: Vec<ClusterInst>) -> CloudletCandidate {
        CloudletCandidate {
            cloudlet: Cloudlet {
                key: CloudletKey::new("op", name),
                state: TrackedState::Ready,
                ..Default::default()
            },
            online: true,
            score,
            clusters: clusters
                .into_iter()
                .map(|c| {
                    let usage = cluster_resource_usage(&c, &[]);
                    (c, usage)
                })
                .collect(),
        }
    }

    fn demand(org: &str, vcpus: u64, ram: u64, disk: u64) -> ClusterDemand {
        ClusterDemand {
            org: org.to_string(),
            deployment: DeploymentType::Kubernetes,
            demand: (vcpus, ram, disk),
            new_cluster_pool: pool(vcpus, ram, disk, 1, true),
            min_kubernetes_version: String::new(),
        }
    }

    #[test]
    fn reservable_cluster_name_is_deterministic() {
        let key = CloudletKey::new("op", "Site One");
        assert_eq!(
            build_reservable_cluster_name(0, &key),
            build_reservable_cluster_name(0, &key)
        );
        assert_eq!(build_reservable_cluster_name(1, &key), "reservable1-site-one");
    }

    #[test]
    fn highest_score_wins_ties_by_name() {
        let candidates = vec![
            candidate("c3", 20, vec![]),
            candidate("c1", 100, vec![]),
            candidate("c2", 50, vec![]),
        ];
        let placement = place(&demand("acme", 2, 2048, 10), &candidates).unwrap();
        assert_eq!(placement.cloudlet_key.name, "c1");
        assert_eq!(placement.action, ClusterAction::CreateNewAuto);

        let tied = vec![candidate("beta", 50, vec![]), candidate("alpha", 50, vec![])];
        let placement = place(&demand("acme", 2, 2048, 10), &tied).unwrap();
        assert_eq!(placement.cloudlet_key.name, "alpha");
    }

    #[test]
    fn reuses_free_reservable_cluster() {
        let candidates = vec![candidate(
            "c1",
            50,
            vec![reservable_cluster("reservable0-c1", "c1", "")],
        )];
        let placement = place(&demand("acme", 2, 2048, 10), &candidates).unwrap();
        assert_eq!(
            placement.action,
            ClusterAction::UseExisting {
                key: ClusterKey::new(PLATFORM_ORG, "reservable0-c1")
            }
        );
    }

    #[test]
    fn skips_cluster_reserved_by_other_org() {
        let candidates = vec![candidate(
            "c1",
            50,
            vec![reservable_cluster("reservable0-c1", "c1", "rival")],
        )];
        let placement = place(&demand("acme", 2, 2048, 10), &candidates).unwrap();
        // Falls through to a new autocluster.
        assert_eq!(placement.action, ClusterAction::CreateNewAuto);
    }

    #[test]
    fn reuses_cluster_reserved_by_us() {
        let candidates = vec![candidate(
            "c1",
            50,
            vec![reservable_cluster("reservable0-c1", "c1", "acme")],
        )];
        let placement = place(&demand("acme", 2, 2048, 10), &candidates).unwrap();
        assert!(matches!(placement.action, ClusterAction::UseExisting { .. }));
    }

    #[test]
    fn scale_up_when_demand_exceeds_free() {
        // Cluster has 4 vcpus total; demand is 6 → grow the pool.
        let cluster = reservable_cluster("reservable0-c1", "c1", "acme");
        let candidates = vec![candidate("c1", 50, vec![cluster])];
        let placement = place(&demand("acme", 6, 1024, 5), &candidates).unwrap();
        match placement.action {
            ClusterAction::ScaleUp {
                key,
                pool_name,
                add_nodes,
            } => {
                assert_eq!(key.name, "reservable0-c1");
                assert_eq!(pool_name, "workers");
                assert_eq!(add_nodes, 1); // 2 more vcpus at 2/node
            }
            other => panic!("expected scale-up, got {other:?}"),
        }
    }

    #[test]
    fn reuse_preferred_over_fresh_cloudlet_with_higher_score() {
        // c1 holds our reserved cluster but is busier; c2 is empty and
        // scores higher. Reuse still wins.
        let busy = candidate(
            "c1",
            40,
            vec![reservable_cluster("reservable0-c1", "c1", "acme")],
        );
        let empty = candidate("c2", 100, vec![]);
        let placement = place(&demand("acme", 2, 2048, 10), &[busy, empty]).unwrap();
        assert_eq!(placement.cloudlet_key.name, "c1");
        assert!(matches!(placement.action, ClusterAction::UseExisting { .. }));
    }

    #[test]
    fn kubernetes_version_gates_reuse() {
        let mut cluster = reservable_cluster("reservable0-c1", "c1", "");
        cluster.kubernetes_version = "1.25".to_string();
        let candidates = vec![candidate("c1", 50, vec![cluster])];
        let mut d = demand("acme", 2, 2048, 10);
        d.min_kubernetes_version = "1.28".to_string();
        let placement = place(&d, &candidates).unwrap();
        assert_eq!(placement.action, ClusterAction::CreateNewAuto);
    }

    #[test]
    fn vm_app_needs_vm_support() {
        let mut ok = candidate("c1", 50, vec![]);
        ok.cloudlet.features.supports_vm_apps = true;
        let mut no = candidate("c2", 90, vec![]);
        no.cloudlet.features.supports_vm_apps = false;

        let mut d = demand("acme", 2, 2048, 10);
        d.deployment = DeploymentType::Vm;
        let placement = place(&d, &[no.clone(), ok]).unwrap();
        // c2 scores higher but cannot host VMs.
        assert_eq!(placement.cloudlet_key.name, "c1");
        assert_eq!(placement.action, ClusterAction::VmApp);

        let err = place(&d, &[no]).unwrap_err();
        assert!(matches!(err, PlacementError::NoFit(_)));
    }

    #[test]
    fn single_kubernetes_platform_rejects_docker() {
        let mut c = candidate("c1", 50, vec![]);
        c.cloudlet.features.is_single_kubernetes_cluster = true;
        let mut d = demand("acme", 2, 2048, 10);
        d.deployment = DeploymentType::Docker;
        let err = place(&d, &[c]).unwrap_err();
        assert!(err.to_string().contains("only hosts Kubernetes"));
    }

    #[test]
    fn maintenance_and_offline_sites_are_screened() {
        let mut offline = candidate("c1", 90, vec![]);
        offline.online = false;
        let mut maint = candidate("c2", 80, vec![]);
        maint.cloudlet.maintenance_state = edgegrid_model::MaintenanceState::UnderMaintenance;
        let ok = candidate("c3", 10, vec![]);

        let placement = place(&demand("acme", 2, 2048, 10), &[offline, maint, ok]).unwrap();
        assert_eq!(placement.cloudlet_key.name, "c3");
    }

    #[test]
    fn rejection_reasons_are_aggregated() {
        let mut offline = candidate("c1", 90, vec![]);
        offline.online = false;
        let mut maint = candidate("c2", 80, vec![]);
        maint.cloudlet.maintenance_state = edgegrid_model::MaintenanceState::UnderMaintenance;

        let err = place(&demand("acme", 2, 2048, 10), &[offline, maint]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("op/c1: site is not ready"), "{msg}");
        assert!(msg.contains("op/c2: site is under maintenance"), "{msg}");
    }

    #[test]
    fn empty_candidates_is_distinct_error() {
        assert_eq!(
            place(&demand("acme", 2, 2048, 10), &[]).unwrap_err(),
            PlacementError::NoCandidates
        );
    }

    #[test]
    fn named_target_cluster_verification() {
        let cluster = reservable_cluster("reservable0-c1", "c1", "");
        let usage = cluster_resource_usage(&cluster, &[]);
        let d = demand("acme", 2, 2048, 10);
        assert!(verify_target_cluster(&cluster, &usage, &d).is_ok());

        let mut foreign = cluster.clone();
        foreign.reservable = false;
        foreign.key = ClusterKey::new("rival", "private");
        assert!(verify_target_cluster(&foreign, &usage, &d).is_err());

        let mut deleting = cluster.clone();
        deleting.delete_prepare = true;
        assert!(verify_target_cluster(&deleting, &usage, &d).is_err());
    }
}
