//! Resource requests, flavors, and node pools.
//!
//! Resources can be declared two ways: by naming a region-wide flavor, or
//! by spelling out node/Kubernetes resources directly. A named flavor
//! always overrides explicit resources; internally the explicit structs
//! are the source of truth.

use crate::error::{ModelError, ModelResult};
use crate::keys::{FlavorKey, ResTagTableKey};
use crate::{Obj, ObjKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Resources for a single VM or node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResources {
    pub vcpus: u64,
    pub ram_mb: u64,
    pub disk_gb: u64,
    /// Optional resources keyed by category ("gpu") with a request spec
    /// of the form `kind:count` or `kind:model:count`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub opt_res_map: BTreeMap<String, String>,
    /// Infra-specific flavor chosen at placement time.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub infra_node_flavor: String,
    /// External volume size when the infra flavor has no attached disk.
    #[serde(default)]
    pub external_volume_gb: u64,
}

impl NodeResources {
    pub fn validate(&self) -> ModelResult<()> {
        if self.vcpus == 0 {
            return Err(ModelError::invalid("node resources require at least 1 vcpu"));
        }
        if self.ram_mb == 0 {
            return Err(ModelError::invalid("node resources require ram"));
        }
        for (res, request) in &self.opt_res_map {
            let parts: Vec<&str> = request.split([':', '=']).collect();
            if parts.len() < 2 || parts.len() > 3 {
                return Err(ModelError::invalid(format!(
                    "invalid optional resource request {request:?} for {res}"
                )));
            }
            let count = parts[parts.len() - 1];
            let parsed: u32 = count.trim_matches(['\'', '"']).parse().map_err(|_| {
                ModelError::invalid(format!(
                    "non-numeric count {count:?} in optional resource request for {res}"
                ))
            })?;
            if parsed == 0 {
                return Err(ModelError::invalid(format!(
                    "zero count in optional resource request for {res}"
                )));
            }
        }
        Ok(())
    }

    pub fn set_from_flavor(&mut self, flavor: &Flavor) {
        self.vcpus = flavor.vcpus;
        self.ram_mb = flavor.ram_mb;
        self.disk_gb = flavor.disk_gb;
        self.opt_res_map = flavor.opt_res_map.clone();
    }
}

/// Resources for a Kubernetes workload, expressed as a node pool shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesResources {
    /// Requested worker pool: per-node resources and node count.
    pub node_resources: NodeResources,
    pub num_nodes: u32,
    /// Minimum cluster Kubernetes version, empty for any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub min_kubernetes_version: String,
}

impl KubernetesResources {
    pub fn validate(&self) -> ModelResult<()> {
        self.node_resources.validate()?;
        if self.num_nodes == 0 {
            return Err(ModelError::invalid(
                "kubernetes resources require at least 1 node",
            ));
        }
        Ok(())
    }

    pub fn set_from_flavor(&mut self, flavor: &Flavor) {
        self.node_resources.set_from_flavor(flavor);
        if self.num_nodes == 0 {
            self.num_nodes = 1;
        }
    }

    /// Total resources across the pool.
    pub fn total(&self) -> (u64, u64, u64) {
        let n = u64::from(self.num_nodes);
        (
            self.node_resources.vcpus * n,
            self.node_resources.ram_mb * n,
            self.node_resources.disk_gb * n,
        )
    }
}

/// A region-wide named flavor, the shorthand for common resource shapes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flavor {
    pub key: FlavorKey,
    pub vcpus: u64,
    pub ram_mb: u64,
    pub disk_gb: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub opt_res_map: BTreeMap<String, String>,
    #[serde(default)]
    pub delete_prepare: bool,
}

impl Obj for Flavor {
    type Key = FlavorKey;

    fn key(&self) -> &FlavorKey {
        &self.key
    }

    fn validate(&self) -> ModelResult<()> {
        self.key.validate()?;
        if self.vcpus == 0 || self.ram_mb == 0 {
            return Err(ModelError::invalid("flavor requires vcpus and ram"));
        }
        Ok(())
    }
}

impl crate::DeletePrepare for Flavor {
    fn delete_prepare(&self) -> bool {
        self.delete_prepare
    }
    fn set_delete_prepare(&mut self, val: bool) {
        self.delete_prepare = val;
    }
}

/// An infrastructure flavor reported by a cloudlet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlavorInfo {
    pub name: String,
    pub vcpus: u64,
    pub ram_mb: u64,
    pub disk_gb: u64,
    /// Vendor properties ("pci_passthrough" → "alias=t4:1") used for
    /// optional-resource matching via resource tag tables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub prop_map: BTreeMap<String, String>,
}

/// Maps requested optional-resource categories to the vendor property
/// substrings that indicate an infra flavor provides them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResTagTable {
    pub key: ResTagTableKey,
    /// tag key ("vgpu") → property substring to match ("nvidia").
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub delete_prepare: bool,
}

impl Obj for ResTagTable {
    type Key = ResTagTableKey;

    fn key(&self) -> &ResTagTableKey {
        &self.key
    }
}

impl crate::DeletePrepare for ResTagTable {
    fn delete_prepare(&self) -> bool {
        self.delete_prepare
    }
    fn set_delete_prepare(&mut self, val: bool) {
        self.delete_prepare = val;
    }
}

/// A pool of identical nodes within a ClusterInst.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePool {
    pub name: String,
    pub num_nodes: u32,
    pub node_resources: NodeResources,
    /// Scalable pools may grow to absorb additional AppInsts.
    #[serde(default)]
    pub scalable: bool,
}

impl NodePool {
    pub fn validate(&self) -> ModelResult<()> {
        crate::valid_name("node pool name", &self.name)?;
        if self.num_nodes == 0 {
            return Err(ModelError::invalid(format!(
                "node pool {} requires at least 1 node",
                self.name
            )));
        }
        self.node_resources.validate()
    }

    /// Total resources across the pool.
    pub fn total(&self) -> (u64, u64, u64) {
        let n = u64::from(self.num_nodes);
        (
            self.node_resources.vcpus * n,
            self.node_resources.ram_mb * n,
            self.node_resources.disk_gb * n,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_flavor() -> Flavor {
        Flavor {
            key: FlavorKey::new("small"),
            vcpus: 2,
            ram_mb: 2048,
            disk_gb: 10,
            ..Default::default()
        }
    }

    #[test]
    fn node_resources_from_flavor() {
        let mut res = NodeResources::default();
        res.set_from_flavor(&small_flavor());
        assert_eq!(res.vcpus, 2);
        assert_eq!(res.ram_mb, 2048);
        assert!(res.validate().is_ok());
    }

    #[test]
    fn node_resources_validation() {
        assert!(NodeResources::default().validate().is_err());
        let mut res = NodeResources {
            vcpus: 1,
            ram_mb: 512,
            ..Default::default()
        };
        assert!(res.validate().is_ok());
        res.opt_res_map
            .insert("gpu".to_string(), "gpu:1".to_string());
        assert!(res.validate().is_ok());
        res.opt_res_map
            .insert("gpu".to_string(), "gpu".to_string());
        assert!(res.validate().is_err());
        res.opt_res_map
            .insert("gpu".to_string(), "gpu:zero".to_string());
        assert!(res.validate().is_err());
    }

    #[test]
    fn kubernetes_resources_totals() {
        let res = KubernetesResources {
            node_resources: NodeResources {
                vcpus: 2,
                ram_mb: 1024,
                disk_gb: 10,
                ..Default::default()
            },
            num_nodes: 3,
            min_kubernetes_version: String::new(),
        };
        assert_eq!(res.total(), (6, 3072, 30));
    }

    #[test]
    fn node_pool_validation() {
        let pool = NodePool {
            name: "workers".to_string(),
            num_nodes: 2,
            node_resources: NodeResources {
                vcpus: 2,
                ram_mb: 1024,
                disk_gb: 10,
                ..Default::default()
            },
            scalable: true,
        };
        assert!(pool.validate().is_ok());
        let empty = NodePool {
            num_nodes: 0,
            ..pool.clone()
        };
        assert!(empty.validate().is_err());
    }
}
