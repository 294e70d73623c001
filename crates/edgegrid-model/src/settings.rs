//! Region-wide controller settings.
//!
//! A singleton object with defaults; operators update individual fields.
//! Thresholds and timeouts that used to be scattered package globals in
//! older controllers live here.

use crate::{Obj, ObjKey};
use crate::error::ModelResult;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key type for the settings singleton.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SettingsKey;

impl fmt::Display for SettingsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("settings")
    }
}

impl ObjKey for SettingsKey {
    const TYPE: &'static str = "Settings";

    fn validate(&self) -> ModelResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub key: SettingsKey,
    /// Registry host used to derive image paths when the App omits one.
    pub registry_fqdn: String,
    /// DNS root appended to instance labels to form URIs.
    pub app_dns_root: String,
    /// Bound on optimistic STM retries before giving up with a conflict.
    pub max_stm_retries: u32,
    /// Default per-resource warning threshold percentage.
    pub resource_warning_threshold_percent: u32,
    /// How long an unreserved reservable autocluster may sit idle before
    /// the cleanup worker deletes it, in seconds.
    pub cleanup_reservable_auto_cluster_idle_secs: u64,
    /// Deadline for a single CRM-executed lifecycle operation, seconds.
    pub crm_operation_timeout_secs: u64,
    /// Lease TTL for site-reported CloudletInfo records, seconds.
    pub cloudlet_info_lease_secs: u64,
    /// Infra flavor assigned to Kubernetes master nodes.
    pub master_node_flavor: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            key: SettingsKey,
            registry_fqdn: String::new(),
            app_dns_root: "edgegrid.net".to_string(),
            max_stm_retries: 32,
            resource_warning_threshold_percent: 80,
            cleanup_reservable_auto_cluster_idle_secs: 1800,
            crm_operation_timeout_secs: 900,
            cloudlet_info_lease_secs: 30,
            master_node_flavor: String::new(),
        }
    }
}

impl Obj for Settings {
    type Key = SettingsKey;

    fn key(&self) -> &SettingsKey {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.max_stm_retries, 32);
        assert!(settings.resource_warning_threshold_percent <= 100);
        assert!(settings.cloudlet_info_lease_secs > 0);
    }
}
