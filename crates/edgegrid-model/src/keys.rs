//! Typed keys for every stored object.
//!
//! A key's canonical form is its JSON serialization; field order is the
//! struct declaration order and must never change without a data-model
//! version bump (see [`crate::verhash`]).

use crate::error::ModelResult;
use crate::{valid_name, ObjKey};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! impl_display_key {
    ($ty:ty, $($field:ident),+) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let parts: Vec<&str> = [$(self.$field.as_str()),+]
                    .into_iter()
                    .filter(|s| !s.is_empty())
                    .collect();
                write!(f, "{}", parts.join("/"))
            }
        }
    };
}

// ── App ────────────────────────────────────────────────────────────

/// Identifies an App definition: (developer org, name, version).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppKey {
    pub organization: String,
    pub name: String,
    pub version: String,
}

impl_display_key!(AppKey, organization, name, version);

impl ObjKey for AppKey {
    const TYPE: &'static str = "App";

    fn validate(&self) -> ModelResult<()> {
        valid_name("app organization", &self.organization)?;
        valid_name("app name", &self.name)?;
        valid_name("app version", &self.version)
    }
}

impl AppKey {
    pub fn new(org: &str, name: &str, version: &str) -> Self {
        Self {
            organization: org.to_string(),
            name: name.to_string(),
            version: version.to_string(),
        }
    }
}

// ── AppInst ────────────────────────────────────────────────────────

/// Identifies a running instance of an App: (developer org, instance name).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppInstKey {
    pub organization: String,
    pub name: String,
}

impl_display_key!(AppInstKey, organization, name);

impl ObjKey for AppInstKey {
    const TYPE: &'static str = "AppInst";

    fn validate(&self) -> ModelResult<()> {
        valid_name("appinst organization", &self.organization)?;
        valid_name("appinst name", &self.name)
    }
}

impl AppInstKey {
    pub fn new(org: &str, name: &str) -> Self {
        Self {
            organization: org.to_string(),
            name: name.to_string(),
        }
    }
}

// ── ClusterInst ────────────────────────────────────────────────────

/// Identifies a cluster on a cloudlet: (owner org, cluster name).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterKey {
    pub organization: String,
    pub name: String,
}

impl_display_key!(ClusterKey, organization, name);

impl ObjKey for ClusterKey {
    const TYPE: &'static str = "ClusterInst";

    fn validate(&self) -> ModelResult<()> {
        valid_name("cluster organization", &self.organization)?;
        valid_name("cluster name", &self.name)
    }
}

impl ClusterKey {
    pub fn new(org: &str, name: &str) -> Self {
        Self {
            organization: org.to_string(),
            name: name.to_string(),
        }
    }
}

// ── Cloudlet ───────────────────────────────────────────────────────

/// Identifies an edge site: (operator org, site name, federated org).
///
/// `federated_organization` is empty for locally operated cloudlets and
/// names the remote federation partner otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CloudletKey {
    pub organization: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub federated_organization: String,
}

impl_display_key!(CloudletKey, organization, name, federated_organization);

impl ObjKey for CloudletKey {
    const TYPE: &'static str = "Cloudlet";

    fn validate(&self) -> ModelResult<()> {
        valid_name("cloudlet organization", &self.organization)?;
        valid_name("cloudlet name", &self.name)
    }
}

impl CloudletKey {
    pub fn new(org: &str, name: &str) -> Self {
        Self {
            organization: org.to_string(),
            name: name.to_string(),
            federated_organization: String::new(),
        }
    }

    pub fn is_federated(&self) -> bool {
        !self.federated_organization.is_empty()
    }
}

// ── Zone ───────────────────────────────────────────────────────────

/// Identifies a zone, an operator-defined group of cloudlets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneKey {
    pub organization: String,
    pub name: String,
}

impl_display_key!(ZoneKey, organization, name);

impl ObjKey for ZoneKey {
    const TYPE: &'static str = "Zone";

    fn validate(&self) -> ModelResult<()> {
        valid_name("zone organization", &self.organization)?;
        valid_name("zone name", &self.name)
    }
}

impl ZoneKey {
    pub fn new(org: &str, name: &str) -> Self {
        Self {
            organization: org.to_string(),
            name: name.to_string(),
        }
    }

    /// True if both fields are populated (optional zone references use the
    /// default key as "unset").
    pub fn is_set(&self) -> bool {
        !self.organization.is_empty() && !self.name.is_empty()
    }
}

// ── Policies and catalog objects ───────────────────────────────────

/// Identifies a policy object (trust, auto-scale, auto-prov, alert).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyKey {
    pub organization: String,
    pub name: String,
}

impl_display_key!(PolicyKey, organization, name);

impl ObjKey for PolicyKey {
    const TYPE: &'static str = "Policy";

    fn validate(&self) -> ModelResult<()> {
        valid_name("policy organization", &self.organization)?;
        valid_name("policy name", &self.name)
    }
}

impl PolicyKey {
    pub fn new(org: &str, name: &str) -> Self {
        Self {
            organization: org.to_string(),
            name: name.to_string(),
        }
    }
}

/// Identifies a region-wide flavor definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlavorKey {
    pub name: String,
}

impl fmt::Display for FlavorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl ObjKey for FlavorKey {
    const TYPE: &'static str = "Flavor";

    fn validate(&self) -> ModelResult<()> {
        valid_name("flavor name", &self.name)
    }
}

impl FlavorKey {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    pub fn is_set(&self) -> bool {
        !self.name.is_empty()
    }

    /// Serde skip helper for optional flavor references.
    pub fn is_not_set(&self) -> bool {
        !self.is_set()
    }
}

/// Identifies a resource tag table used for optional-resource matching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResTagTableKey {
    pub organization: String,
    pub name: String,
}

impl_display_key!(ResTagTableKey, organization, name);

impl ObjKey for ResTagTableKey {
    const TYPE: &'static str = "ResTagTable";

    fn validate(&self) -> ModelResult<()> {
        valid_name("res tag table organization", &self.organization)?;
        valid_name("res tag table name", &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_string_is_stable_json() {
        let key = AppKey::new("acme", "web", "1.0");
        assert_eq!(
            key.key_string(),
            r#"{"organization":"acme","name":"web","version":"1.0"}"#
        );
        assert_eq!(key.store_path(), format!("App/{}", key.key_string()));
    }

    #[test]
    fn key_string_round_trips() {
        let key = CloudletKey {
            organization: "op".to_string(),
            name: "site-1".to_string(),
            federated_organization: "partner".to_string(),
        };
        let parsed: CloudletKey = serde_json::from_str(&key.key_string()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn federated_org_omitted_when_empty() {
        let key = CloudletKey::new("op", "site-1");
        assert!(!key.key_string().contains("federated_organization"));
        let parsed: CloudletKey = serde_json::from_str(&key.key_string()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn validate_rejects_empty_and_bad_chars() {
        assert!(AppKey::new("", "web", "1.0").validate().is_err());
        assert!(AppKey::new("acme", "a/b", "1.0").validate().is_err());
        assert!(AppKey::new("acme", "web", "1.0").validate().is_ok());
    }

    #[test]
    fn display_skips_empty_parts() {
        let key = CloudletKey::new("op", "site-1");
        assert_eq!(key.to_string(), "op/site-1");
    }

    #[test]
    fn errors_carry_type_and_key() {
        let key = AppKey::new("acme", "web", "1.0");
        assert_eq!(
            key.not_found_error().to_string(),
            "App acme/web/1.0 not found"
        );
        assert_eq!(
            key.being_deleted_error().to_string(),
            "App acme/web/1.0 is being deleted"
        );
    }
}
