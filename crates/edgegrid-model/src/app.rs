//! The App object — a developer's deployable application template.

use crate::enums::{DelOpt, DeploymentType};
use crate::error::{ModelError, ModelResult};
use crate::fieldmap::FieldMap;
use crate::keys::{AppKey, FlavorKey};
use crate::netrules::SecurityRule;
use crate::resources::{KubernetesResources, NodeResources};
use crate::{Obj, ObjKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Dotted field names for App update field maps.
pub mod app_fields {
    pub const IMAGE_PATH: &str = "image_path";
    pub const ACCESS_PORTS: &str = "access_ports";
    pub const SKIP_HC_PORTS: &str = "skip_hc_ports";
    pub const DEPLOYMENT: &str = "deployment";
    pub const DEFAULT_FLAVOR: &str = "default_flavor";
    pub const KUBERNETES_RESOURCES: &str = "kubernetes_resources";
    pub const NODE_RESOURCES: &str = "node_resources";
    pub const TRUSTED: &str = "trusted";
    pub const REQUIRED_OUTBOUND_CONNECTIONS: &str = "required_outbound_connections";
    pub const AUTO_PROV_POLICIES: &str = "auto_prov_policies";
    pub const ALERT_POLICIES: &str = "alert_policies";
    pub const SECRET_ENV_VARS: &str = "secret_env_vars";
    pub const REVISION: &str = "revision";
}

/// A developer-owned application definition. Immutable in its deployment
/// shape once instances exist; deleted only when no static AppInst
/// refers to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub key: AppKey,
    pub deployment: DeploymentType,
    /// Container/VM image location. Derived from the registry FQDN when
    /// left empty for docker and helm deployments.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_path: String,
    /// Access-port spec string, e.g. "tcp:443,udp:5000-5002".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_ports: String,
    /// Ports excluded from health checking ("all" or a port spec).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub skip_hc_ports: String,
    /// Default resources by flavor name; overrides explicit resources.
    #[serde(default, skip_serializing_if = "FlavorKey::is_not_set")]
    pub default_flavor: FlavorKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_resources: Option<KubernetesResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_resources: Option<NodeResources>,
    /// Trusted apps may be placed on trust-policy cloudlets, provided
    /// their required outbound connections fit the policy.
    #[serde(default)]
    pub trusted: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_outbound_connections: Vec<SecurityRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auto_prov_policies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alert_policies: Vec<String>,
    /// Secret environment variables. Stored redacted; real values live in
    /// the secret store.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secret_env_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub del_opt: DelOpt,
    #[serde(default)]
    pub delete_prepare: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,
    /// Frozen at create; guards semantic changes across releases.
    #[serde(default)]
    pub compatibility_version: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub obj_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub global_id: String,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

/// Current compatibility version stamped on new Apps.
pub const APP_COMPATIBILITY_VERSION: u32 = 2;

impl Obj for App {
    type Key = AppKey;

    fn key(&self) -> &AppKey {
        &self.key
    }

    fn validate(&self) -> ModelResult<()> {
        self.key.validate()
    }
}

impl crate::DeletePrepare for App {
    fn delete_prepare(&self) -> bool {
        self.delete_prepare
    }
    fn set_delete_prepare(&mut self, val: bool) {
        self.delete_prepare = val;
    }
}

impl App {
    /// Fields that may be set on update requests. Key fields and
    /// controller-generated fields are rejected elsewhere.
    pub const UPDATABLE_FIELDS: &'static [&'static str] = &[
        app_fields::IMAGE_PATH,
        app_fields::ACCESS_PORTS,
        app_fields::SKIP_HC_PORTS,
        app_fields::DEFAULT_FLAVOR,
        app_fields::KUBERNETES_RESOURCES,
        app_fields::NODE_RESOURCES,
        app_fields::TRUSTED,
        app_fields::REQUIRED_OUTBOUND_CONNECTIONS,
        app_fields::AUTO_PROV_POLICIES,
        app_fields::ALERT_POLICIES,
        app_fields::SECRET_ENV_VARS,
        app_fields::REVISION,
    ];

    /// Fields that cannot change while AppInsts exist.
    pub const IN_USE_IMMUTABLE_FIELDS: &'static [&'static str] = &[
        app_fields::ACCESS_PORTS,
        app_fields::SKIP_HC_PORTS,
        app_fields::DEPLOYMENT,
    ];

    /// Dotted names of the fields present (non-default) on this object.
    pub fn present_fields(&self) -> FieldMap {
        let mut fmap = FieldMap::default();
        if !self.image_path.is_empty() {
            fmap.insert(app_fields::IMAGE_PATH);
        }
        if !self.access_ports.is_empty() {
            fmap.insert(app_fields::ACCESS_PORTS);
        }
        if !self.skip_hc_ports.is_empty() {
            fmap.insert(app_fields::SKIP_HC_PORTS);
        }
        if self.default_flavor.is_set() {
            fmap.insert(app_fields::DEFAULT_FLAVOR);
        }
        if self.kubernetes_resources.is_some() {
            fmap.insert(app_fields::KUBERNETES_RESOURCES);
        }
        if self.node_resources.is_some() {
            fmap.insert(app_fields::NODE_RESOURCES);
        }
        if self.trusted {
            fmap.insert(app_fields::TRUSTED);
        }
        if !self.required_outbound_connections.is_empty() {
            fmap.insert(app_fields::REQUIRED_OUTBOUND_CONNECTIONS);
        }
        if !self.auto_prov_policies.is_empty() {
            fmap.insert(app_fields::AUTO_PROV_POLICIES);
        }
        if !self.alert_policies.is_empty() {
            fmap.insert(app_fields::ALERT_POLICIES);
        }
        if !self.secret_env_vars.is_empty() {
            fmap.insert(app_fields::SECRET_ENV_VARS);
        }
        if !self.revision.is_empty() {
            fmap.insert(app_fields::REVISION);
        }
        fmap
    }

    /// Copy the fields named by `fmap` from `other` into self.
    pub fn copy_in_fields(&mut self, other: &App, fmap: &FieldMap) {
        if fmap.has(app_fields::IMAGE_PATH) {
            self.image_path = other.image_path.clone();
        }
        if fmap.has_or_has_child(app_fields::ACCESS_PORTS) {
            self.access_ports = other.access_ports.clone();
        }
        if fmap.has(app_fields::SKIP_HC_PORTS) {
            self.skip_hc_ports = other.skip_hc_ports.clone();
        }
        if fmap.has_or_has_child(app_fields::DEFAULT_FLAVOR) {
            self.default_flavor = other.default_flavor.clone();
        }
        if fmap.has_or_has_child(app_fields::KUBERNETES_RESOURCES) {
            self.kubernetes_resources = other.kubernetes_resources.clone();
        }
        if fmap.has_or_has_child(app_fields::NODE_RESOURCES) {
            self.node_resources = other.node_resources.clone();
        }
        if fmap.has(app_fields::TRUSTED) {
            self.trusted = other.trusted;
        }
        if fmap.has_or_has_child(app_fields::REQUIRED_OUTBOUND_CONNECTIONS) {
            self.required_outbound_connections = other.required_outbound_connections.clone();
        }
        if fmap.has(app_fields::AUTO_PROV_POLICIES) {
            self.auto_prov_policies = other.auto_prov_policies.clone();
        }
        if fmap.has(app_fields::ALERT_POLICIES) {
            self.alert_policies = other.alert_policies.clone();
        }
        if fmap.has_or_has_child(app_fields::SECRET_ENV_VARS) {
            self.secret_env_vars = other.secret_env_vars.clone();
        }
        if fmap.has(app_fields::REVISION) {
            self.revision = other.revision.clone();
        }
    }

    /// Whether the App declares any resource shape at all.
    pub fn has_resources(&self) -> bool {
        self.default_flavor.is_set()
            || self.kubernetes_resources.is_some()
            || self.node_resources.is_some()
    }
}

/// Redact secret values for storage; keys are preserved so updates can
/// be diffed, values never touch the KV store.
pub fn redact_secret_vars(vars: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    vars.keys()
        .map(|k| (k.clone(), "*****".to_string()))
        .collect()
}
