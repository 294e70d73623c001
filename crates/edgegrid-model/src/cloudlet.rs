//! Cloudlet and CloudletInfo — the edge site and its reported state.
//!
//! The Cloudlet is declared intent (operator-owned); CloudletInfo is the
//! site's view of itself, reported by the CRM and stored under a lease so
//! a dead site's record expires on its own.

use crate::enums::{CloudletState, CrmOverride, MaintenanceState, TrackedState};
use crate::error::ModelResult;
use crate::fieldmap::FieldMap;
use crate::keys::{CloudletKey, ResTagTableKey};
use crate::resources::{FlavorInfo, NodePool};
use crate::{Obj, ObjKey, Tracked};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Geographic location of a cloudlet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudletLoc {
    pub latitude: f64,
    pub longitude: f64,
}

/// Capabilities of a cloudlet's platform, set when the cloudlet is
/// created from the platform registry. Placement consults these instead
/// of embedding cloud-specific logic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformFeatures {
    /// Platform hosts exactly one Kubernetes cluster; no clusters can be
    /// created or deleted, and non-Kubernetes deployments are rejected.
    #[serde(default)]
    pub is_single_kubernetes_cluster: bool,
    #[serde(default)]
    pub supports_multi_tenant_cluster: bool,
    #[serde(default)]
    pub supports_vm_apps: bool,
    #[serde(default)]
    pub kubernetes_only: bool,
}

/// A per-resource quota declared by the operator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceQuota {
    /// Resource name ("vcpus", "ram", "disk", "external-ips").
    pub name: String,
    pub value: u64,
    /// Warning threshold percentage; 0 uses the settings default.
    #[serde(default)]
    pub alert_threshold: u32,
}

/// An edge site.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cloudlet {
    pub key: CloudletKey,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub platform_type: String,
    #[serde(default)]
    pub features: PlatformFeatures,
    #[serde(default)]
    pub location: CloudletLoc,
    /// Zone this cloudlet belongs to (zone org == cloudlet org).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zone: String,
    /// Pool size for dynamically allocated external IPs.
    #[serde(default)]
    pub num_dynamic_ips: u32,
    /// Trust policy name; empty for unrestricted cloudlets.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trust_policy: String,
    #[serde(default)]
    pub trust_policy_state: TrackedState,
    #[serde(default)]
    pub maintenance_state: MaintenanceState,
    /// Infra flavors mirrored from CloudletInfo so developers can see
    /// site-specific shapes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub infra_flavors: Vec<FlavorInfo>,
    /// Optional resource category → tag table used to match it.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub res_tag_map: BTreeMap<String, ResTagTableKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_quotas: Vec<ResourceQuota>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_version: String,
    #[serde(default)]
    pub state: TrackedState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default)]
    pub crm_override: CrmOverride,
    /// Owner org of the single Kubernetes cluster, for platforms that
    /// are one cluster in their entirety.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub single_kubernetes_cluster_owner: String,
    #[serde(default)]
    pub delete_prepare: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub obj_id: String,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

impl Obj for Cloudlet {
    type Key = CloudletKey;

    fn key(&self) -> &CloudletKey {
        &self.key
    }

    fn validate(&self) -> ModelResult<()> {
        self.key.validate()
    }
}

impl crate::DeletePrepare for Cloudlet {
    fn delete_prepare(&self) -> bool {
        self.delete_prepare
    }
    fn set_delete_prepare(&mut self, val: bool) {
        self.delete_prepare = val;
    }
}

impl Tracked for Cloudlet {
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

impl Cloudlet {
    /// The zone key this cloudlet belongs to, unset if none.
    pub fn zone_key(&self) -> crate::keys::ZoneKey {
        crate::keys::ZoneKey {
            organization: self.key.organization.clone(),
            name: self.zone.clone(),
        }
    }

    /// Cloudlets under maintenance accept no new placements.
    pub fn accepts_new_instances(&self) -> bool {
        self.maintenance_state == MaintenanceState::NormalOperation
    }
}

/// Dotted field names for CloudletInfo update field maps.
pub mod cloudletinfo_fields {
    pub const STATE: &str = "state";
    pub const FLAVORS: &str = "flavors";
    pub const NODE_POOLS: &str = "node_pools";
    pub const CONTAINER_VERSION: &str = "container_version";
    pub const ERRORS: &str = "errors";
    pub const INFRA_RESOURCES: &str = "infra_resources";
}

/// One infra-level resource with its platform usage and limits, as
/// reported by the site.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfraResource {
    pub name: String,
    /// Amount used by the platform itself, outside controller-managed
    /// clusters and VMs.
    #[serde(default)]
    pub value: u64,
    /// Hard limit reported by the infrastructure.
    #[serde(default)]
    pub infra_max_value: u64,
}

/// Site-reported runtime data. Ephemeral: stored under a lease so a
/// crashed site's record auto-expires.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudletInfo {
    pub key: CloudletKey,
    #[serde(default)]
    pub state: CloudletState,
    /// Identity of the notify connection that reported this info; used
    /// to flush the right records on disconnect.
    #[serde(default)]
    pub notify_id: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flavors: Vec<FlavorInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_pools: Vec<NodePool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub os_images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub availability_zones: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub infra_resources: Vec<InfraResource>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl Obj for CloudletInfo {
    type Key = CloudletKey;
    const TYPE: &'static str = "CloudletInfo";

    fn key(&self) -> &CloudletKey {
        &self.key
    }
}

impl CloudletInfo {
    /// Dotted names of the fields present (non-default) on this object.
    pub fn present_fields(&self) -> FieldMap {
        let mut fmap = FieldMap::default();
        if self.state != CloudletState::Unknown {
            fmap.insert(cloudletinfo_fields::STATE);
        }
        if !self.flavors.is_empty() {
            fmap.insert(cloudletinfo_fields::FLAVORS);
        }
        if !self.node_pools.is_empty() {
            fmap.insert(cloudletinfo_fields::NODE_POOLS);
        }
        if !self.container_version.is_empty() {
            fmap.insert(cloudletinfo_fields::CONTAINER_VERSION);
        }
        if !self.errors.is_empty() {
            fmap.insert(cloudletinfo_fields::ERRORS);
        }
        if !self.infra_resources.is_empty() {
            fmap.insert(cloudletinfo_fields::INFRA_RESOURCES);
        }
        fmap
    }

    /// Copy the fields named by `fmap` from `other` into self.
    pub fn copy_in_fields(&mut self, other: &CloudletInfo, fmap: &FieldMap) {
        if fmap.has(cloudletinfo_fields::STATE) {
            self.state = other.state;
        }
        if fmap.has_or_has_child(cloudletinfo_fields::FLAVORS) {
            self.flavors = other.flavors.clone();
        }
        if fmap.has_or_has_child(cloudletinfo_fields::NODE_POOLS) {
            self.node_pools = other.node_pools.clone();
        }
        if fmap.has(cloudletinfo_fields::CONTAINER_VERSION) {
            self.container_version = other.container_version.clone();
        }
        if fmap.has(cloudletinfo_fields::ERRORS) {
            self.errors = other.errors.clone();
        }
        if fmap.has_or_has_child(cloudletinfo_fields::INFRA_RESOURCES) {
            self.infra_resources = other.infra_resources.clone();
        }
    }

    pub fn infra_max(&self, resource: &str) -> Option<u64> {
        self.infra_resources
            .iter()
            .find(|r| r.name == resource)
            .map(|r| r.infra_max_value)
    }
}
