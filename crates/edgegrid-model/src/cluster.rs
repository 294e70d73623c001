//! The ClusterInst object — a Kubernetes or Docker cluster on a cloudlet.

use crate::enums::{CrmOverride, DeploymentType, IpAccess, TrackedState};
use crate::error::{ModelError, ModelResult};
use crate::fieldmap::FieldMap;
use crate::keys::{CloudletKey, ClusterKey, ZoneKey};
use crate::resources::NodePool;
use crate::{Obj, ObjKey, Tracked};
use serde::{Deserialize, Serialize};

/// Dotted field names for ClusterInst update field maps.
pub mod cluster_fields {
    pub const NODE_POOLS: &str = "node_pools";
    pub const NODE_POOLS_NUM_NODES: &str = "node_pools.num_nodes";
    pub const CRM_OVERRIDE: &str = "crm_override";
}

/// An instantiated cluster on a cloudlet. Reservable clusters are owned
/// by the platform organization and rented to one developer org at a
/// time; autoclusters are reservable clusters the controller creates on
/// demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterInst {
    pub key: ClusterKey,
    #[serde(default)]
    pub cloudlet_key: CloudletKey,
    #[serde(default)]
    pub zone_key: ZoneKey,
    #[serde(default)]
    pub deployment: DeploymentType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_pools: Vec<NodePool>,
    #[serde(default)]
    pub ip_access: IpAccess,
    /// Platform-owned cluster available for temporary rental.
    #[serde(default)]
    pub reservable: bool,
    /// Developer org currently holding the reservation; empty when free.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reserved_by: String,
    /// When the last reservation ended, for idle cleanup.
    #[serde(default)]
    pub reservation_ended_at: u64,
    /// Created by the controller to host an AppInst.
    #[serde(default)]
    pub auto: bool,
    /// Id allocated from the cloudlet's reservable-autocluster bitmap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_cluster_id: Option<u32>,
    #[serde(default)]
    pub multi_tenant: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kubernetes_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dns_label: String,
    #[serde(default)]
    pub state: TrackedState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default)]
    pub crm_override: CrmOverride,
    #[serde(default)]
    pub delete_prepare: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub obj_id: String,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

impl Obj for ClusterInst {
    type Key = ClusterKey;

    fn key(&self) -> &ClusterKey {
        &self.key
    }

    fn validate(&self) -> ModelResult<()> {
        self.key.validate()?;
        if self.deployment == DeploymentType::Vm || self.deployment == DeploymentType::Helm {
            return Err(ModelError::invalid(format!(
                "invalid cluster deployment type {}",
                self.deployment
            )));
        }
        for pool in &self.node_pools {
            pool.validate()?;
        }
        Ok(())
    }
}

impl crate::DeletePrepare for ClusterInst {
    fn delete_prepare(&self) -> bool {
        self.delete_prepare
    }
    fn set_delete_prepare(&mut self, val: bool) {
        self.delete_prepare = val;
    }
}

impl Tracked for ClusterInst {
    fn state(&self) -> TrackedState {
        self.state
    }
    fn set_state(&mut self, state: TrackedState) {
        self.state = state;
    }
    fn errors(&self) -> &[String] {
        &self.errors
    }
    fn set_errors(&mut self, errors: Vec<String>) {
        self.errors = errors;
    }
}

impl ClusterInst {
    pub const UPDATABLE_FIELDS: &'static [&'static str] = &[
        cluster_fields::NODE_POOLS,
        cluster_fields::CRM_OVERRIDE,
    ];

    /// Total vcpu/ram/disk across all node pools.
    pub fn total_resources(&self) -> (u64, u64, u64) {
        let mut total = (0, 0, 0);
        for pool in &self.node_pools {
            let t = pool.total();
            total.0 += t.0;
            total.1 += t.1;
            total.2 += t.2;
        }
        total
    }

    /// The single scalable pool, if exactly one pool is scalable.
    pub fn scalable_pool_mut(&mut self) -> Option<&mut NodePool> {
        let mut scalable = self.node_pools.iter_mut().filter(|p| p.scalable);
        let pool = scalable.next()?;
        if scalable.next().is_some() {
            return None;
        }
        Some(pool)
    }

    /// True if this cluster's Kubernetes version satisfies the requested
    /// minimum ("1.28" style, compared numerically per component).
    pub fn satisfies_kubernetes_version(&self, min: &str) -> bool {
        if min.is_empty() {
            return true;
        }
        if self.kubernetes_version.is_empty() {
            return false;
        }
        version_at_least(&self.kubernetes_version, min)
    }

    pub fn copy_in_fields(&mut self, other: &ClusterInst, fmap: &FieldMap) {
        if fmap.has_or_has_child(cluster_fields::NODE_POOLS) {
            self.node_pools = other.node_pools.clone();
        }
        if fmap.has(cluster_fields::CRM_OVERRIDE) {
            self.crm_override = other.crm_override;
        }
    }
}

/// Compare dotted numeric versions: `have >= want`.
fn version_at_least(have: &str, want: &str) -> bool {
    let parse = |s: &str| -> Vec<u64> {
        s.trim_start_matches(['v', 'V'])
            .split('.')
            .map(|p| p.parse().unwrap_or(0))
            .collect()
    };
    let have = parse(have);
    let want = parse(want);
    for i in 0..have.len().max(want.len()) {
        let h = have.get(i).copied().unwrap_or(0);
        let w = want.get(i).copied().unwrap_or(0);
        if h != w {
            return h > w;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::NodeResources;

    fn test_cluster() -> ClusterInst {
        ClusterInst {
            key: ClusterKey::new("edgegrid", "reservable0"),
            cloudlet_key: CloudletKey::new("op", "site-1"),
            deployment: DeploymentType::Kubernetes,
            node_pools: vec![NodePool {
                name: "workers".to_string(),
                num_nodes: 2,
                node_resources: NodeResources {
                    vcpus: 2,
                    ram_mb: 2048,
                    disk_gb: 10,
                    ..Default::default()
                },
                scalable: true,
            }],
            reservable: true,
            kubernetes_version: "1.28".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn totals_sum_pools() {
        let cluster = test_cluster();
        assert_eq!(cluster.total_resources(), (4, 4096, 20));
    }

    #[test]
    fn rejects_vm_deployment() {
        let mut cluster = test_cluster();
        cluster.deployment = DeploymentType::Vm;
        assert!(cluster.validate().is_err());
    }

    #[test]
    fn kubernetes_version_compare() {
        let cluster = test_cluster();
        assert!(cluster.satisfies_kubernetes_version(""));
        assert!(cluster.satisfies_kubernetes_version("1.28"));
        assert!(cluster.satisfies_kubernetes_version("1.27"));
        assert!(!cluster.satisfies_kubernetes_version("1.29"));
        assert!(cluster.satisfies_kubernetes_version("v1.9"));
    }

    #[test]
    fn scalable_pool_requires_exactly_one() {
        let mut cluster = test_cluster();
        assert!(cluster.scalable_pool_mut().is_some());
        let pool = cluster.node_pools[0].clone();
        cluster.node_pools.push(pool);
        assert!(cluster.scalable_pool_mut().is_none());
    }
}
