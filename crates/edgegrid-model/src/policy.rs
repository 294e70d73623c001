//! Policy objects referenced by Apps and Cloudlets.

use crate::keys::{AppKey, PolicyKey, ZoneKey};
use crate::netrules::{validate_security_rules, SecurityRule};
use crate::error::ModelResult;
use crate::{Obj, ObjKey};
use serde::{Deserialize, Serialize};

/// Restricts the outbound connections workloads may open on a cloudlet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustPolicy {
    pub key: PolicyKey,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outbound_security_rules: Vec<SecurityRule>,
    #[serde(default)]
    pub delete_prepare: bool,
}

impl Obj for TrustPolicy {
    type Key = PolicyKey;
    const TYPE: &'static str = "TrustPolicy";

    fn key(&self) -> &PolicyKey {
        &self.key
    }

    fn validate(&self) -> ModelResult<()> {
        self.key.validate()?;
        validate_security_rules(&self.outbound_security_rules)
    }
}

impl crate::DeletePrepare for TrustPolicy {
    fn delete_prepare(&self) -> bool {
        self.delete_prepare
    }
    fn set_delete_prepare(&mut self, val: bool) {
        self.delete_prepare = val;
    }
}

/// Extra outbound rules granted to one App within one zone, unioned with
/// the cloudlet trust policy during the compatibility check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustPolicyException {
    pub key: PolicyKey,
    pub zone_key: ZoneKey,
    pub app_key: AppKey,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outbound_security_rules: Vec<SecurityRule>,
    #[serde(default)]
    pub delete_prepare: bool,
}

impl Obj for TrustPolicyException {
    type Key = PolicyKey;
    const TYPE: &'static str = "TrustPolicyException";

    fn key(&self) -> &PolicyKey {
        &self.key
    }

    fn validate(&self) -> ModelResult<()> {
        self.key.validate()?;
        self.zone_key.validate()?;
        self.app_key.validate()?;
        validate_security_rules(&self.outbound_security_rules)
    }
}

impl crate::DeletePrepare for TrustPolicyException {
    fn delete_prepare(&self) -> bool {
        self.delete_prepare
    }
    fn set_delete_prepare(&mut self, val: bool) {
        self.delete_prepare = val;
    }
}

/// Deploys AppInsts automatically based on demand. Only the fields the
/// controller validates against are modeled; the auto-prov service owns
/// the rest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoProvPolicy {
    pub key: PolicyKey,
    #[serde(default)]
    pub min_active_instances: u32,
    #[serde(default)]
    pub max_instances: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub zones: Vec<ZoneKey>,
    #[serde(default)]
    pub delete_prepare: bool,
}

impl Obj for AutoProvPolicy {
    type Key = PolicyKey;
    const TYPE: &'static str = "AutoProvPolicy";

    fn key(&self) -> &PolicyKey {
        &self.key
    }
}

impl crate::DeletePrepare for AutoProvPolicy {
    fn delete_prepare(&self) -> bool {
        self.delete_prepare
    }
    fn set_delete_prepare(&mut self, val: bool) {
        self.delete_prepare = val;
    }
}

/// Scales a cluster's node count based on load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoScalePolicy {
    pub key: PolicyKey,
    #[serde(default)]
    pub min_nodes: u32,
    #[serde(default)]
    pub max_nodes: u32,
    #[serde(default)]
    pub target_cpu_percent: u32,
    #[serde(default)]
    pub delete_prepare: bool,
}

impl Obj for AutoScalePolicy {
    type Key = PolicyKey;
    const TYPE: &'static str = "AutoScalePolicy";

    fn key(&self) -> &PolicyKey {
        &self.key
    }
}

impl crate::DeletePrepare for AutoScalePolicy {
    fn delete_prepare(&self) -> bool {
        self.delete_prepare
    }
    fn set_delete_prepare(&mut self, val: bool) {
        self.delete_prepare = val;
    }
}

/// Names an alerting rule monitored on an App's instances. Rule
/// formatting belongs to the alert service; the controller only tracks
/// identity and references.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertPolicy {
    pub key: PolicyKey,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub cpu_utilization_percent: u32,
    #[serde(default)]
    pub mem_utilization_percent: u32,
    #[serde(default)]
    pub trigger_time_secs: u64,
    #[serde(default)]
    pub delete_prepare: bool,
}

impl Obj for AlertPolicy {
    type Key = PolicyKey;
    const TYPE: &'static str = "AlertPolicy";

    fn key(&self) -> &PolicyKey {
        &self.key
    }
}

impl crate::DeletePrepare for AlertPolicy {
    fn delete_prepare(&self) -> bool {
        self.delete_prepare
    }
    fn set_delete_prepare(&mut self, val: bool) {
        self.delete_prepare = val;
    }
}
