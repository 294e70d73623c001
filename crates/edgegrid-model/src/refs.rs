//! Reference-tracking objects.
//!
//! Derived from the object graph but durably persisted so delete-safety
//! scans and placement never walk the full keyspace. Refs are read and
//! written only inside STM transactions, alongside the objects they
//! track.

use crate::keys::{AppInstKey, AppKey, CloudletKey, ClusterKey};
use crate::Obj;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Per-cloudlet usage: clusters, VM app insts, dynamic IPs, and the
/// reservable autocluster id bitmap.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudletRefs {
    pub key: CloudletKey,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub cluster_insts: BTreeSet<ClusterKey>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub vm_app_insts: BTreeSet<AppInstKey>,
    #[serde(default)]
    pub used_dynamic_ips: u32,
    /// Bit N set ⇔ reservable autocluster id N exists on this cloudlet.
    #[serde(default)]
    pub reserved_auto_cluster_ids: u64,
}

impl Obj for CloudletRefs {
    type Key = CloudletKey;
    const TYPE: &'static str = "CloudletRefs";

    fn key(&self) -> &CloudletKey {
        &self.key
    }
}

/// Maximum number of reservable autoclusters per cloudlet (bitmap width).
pub const MAX_RESERVABLE_AUTO_CLUSTER_IDS: u32 = 64;

impl CloudletRefs {
    pub fn new(key: CloudletKey) -> Self {
        Self {
            key,
            ..Default::default()
        }
    }

    /// Allocate the lowest free reservable autocluster id.
    pub fn alloc_auto_cluster_id(&mut self) -> Option<u32> {
        for id in 0..MAX_RESERVABLE_AUTO_CLUSTER_IDS {
            if self.reserved_auto_cluster_ids & (1 << id) == 0 {
                self.reserved_auto_cluster_ids |= 1 << id;
                return Some(id);
            }
        }
        None
    }

    pub fn free_auto_cluster_id(&mut self, id: u32) {
        if id < MAX_RESERVABLE_AUTO_CLUSTER_IDS {
            self.reserved_auto_cluster_ids &= !(1 << id);
        }
    }

    pub fn auto_cluster_id_used(&self, id: u32) -> bool {
        id < MAX_RESERVABLE_AUTO_CLUSTER_IDS && self.reserved_auto_cluster_ids & (1 << id) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.cluster_insts.is_empty()
            && self.vm_app_insts.is_empty()
            && self.reserved_auto_cluster_ids == 0
    }
}

/// AppInsts occupying a cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterRefs {
    pub key: ClusterKey,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub apps: BTreeSet<AppInstKey>,
}

impl Obj for ClusterRefs {
    type Key = ClusterKey;
    const TYPE: &'static str = "ClusterRefs";

    fn key(&self) -> &ClusterKey {
        &self.key
    }
}

impl ClusterRefs {
    pub fn new(key: ClusterKey) -> Self {
        Self {
            key,
            apps: BTreeSet::new(),
        }
    }
}

/// AppInsts instantiated from an App.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppInstRefs {
    pub key: AppKey,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub insts: BTreeSet<AppInstKey>,
}

impl Obj for AppInstRefs {
    type Key = AppKey;
    const TYPE: &'static str = "AppInstRefs";

    fn key(&self) -> &AppKey {
        &self.key
    }
}

impl AppInstRefs {
    pub fn new(key: AppKey) -> Self {
        Self {
            key,
            insts: BTreeSet::new(),
        }
    }
}
