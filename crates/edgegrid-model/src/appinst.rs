//! The AppInst object — a realized instance of an App on a cluster.

use crate::enums::{CrmOverride, Liveness, TrackedState};
use crate::error::ModelResult;
use crate::keys::{AppInstKey, AppKey, CloudletKey, ClusterKey, FlavorKey, ZoneKey};
use crate::ports::AppPort;
use crate::resources::{KubernetesResources, NodeResources};
use crate::{Obj, ObjKey, Tracked};
use serde::{Deserialize, Serialize};

/// A running (or requested) instance of an App on a specific cluster.
/// Carries the full reference chain: App, ClusterInst, Cloudlet, Zone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppInst {
    pub key: AppInstKey,
    pub app_key: AppKey,
    #[serde(default)]
    pub cluster_key: ClusterKey,
    #[serde(default)]
    pub cloudlet_key: CloudletKey,
    #[serde(default)]
    pub zone_key: ZoneKey,
    #[serde(default)]
    pub liveness: Liveness,
    /// Access ports with public mappings filled in at placement.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mapped_ports: Vec<AppPort>,
    /// Reachable endpoint, derived from the cloudlet DNS root and the
    /// instance's DNS label.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri: String,
    /// Unique among all objects on the same cloudlet.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dns_label: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unique_id: String,
    /// Resolved resource request, denormalized from the App at create.
    #[serde(default, skip_serializing_if = "FlavorKey::is_not_set")]
    pub flavor: FlavorKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_resources: Option<KubernetesResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_resources: Option<NodeResources>,
    #[serde(default)]
    pub dedicated_ip: bool,
    #[serde(default)]
    pub state: TrackedState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default)]
    pub crm_override: CrmOverride,
    /// Set when the controller created the target cluster for this
    /// instance (autocluster); such clusters are cleaned up with it.
    #[serde(default)]
    pub auto_cluster: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub obj_id: String,
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

impl Obj for AppInst {
    type Key = AppInstKey;

    fn key(&self) -> &AppInstKey {
        &self.key
    }

    fn validate(&self) -> ModelResult<()> {
        self.key.validate()?;
        self.app_key.validate()
    }
}

impl Tracked for AppInst {
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

impl AppInst {
    /// The resolved vcpu/ram/disk demand of this instance, summed over
    /// its node pool for Kubernetes resources.
    pub fn resource_demand(&self) -> (u64, u64, u64) {
        if let Some(kr) = &self.kubernetes_resources {
            kr.total()
        } else if let Some(nr) = &self.node_resources {
            (nr.vcpus, nr.ram_mb, nr.disk_gb)
        } else {
            (0, 0, 0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_demand_prefers_kubernetes_pool() {
        let inst = AppInst {
            key: AppInstKey::new("acme", "web-prod"),
            app_key: AppKey::new("acme", "web", "1.0"),
            kubernetes_resources: Some(KubernetesResources {
                node_resources: NodeResources {
                    vcpus: 2,
                    ram_mb: 1024,
                    disk_gb: 5,
                    ..Default::default()
                },
                num_nodes: 2,
                min_kubernetes_version: String::new(),
            }),
            ..Default::default()
        };
        assert_eq!(inst.resource_demand(), (4, 2048, 10));
    }

    #[test]
    fn serde_round_trip_with_defaults() {
        let inst = AppInst {
            key: AppInstKey::new("acme", "web-prod"),
            app_key: AppKey::new("acme", "web", "1.0"),
            state: TrackedState::Ready,
            ..Default::default()
        };
        let json = serde_json::to_string(&inst).unwrap();
        let back: AppInst = serde_json::from_str(&json).unwrap();
        assert_eq!(back, inst);
    }
}
