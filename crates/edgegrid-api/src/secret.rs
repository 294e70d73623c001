//! The secret-store boundary.
//!
//! Real values of secret environment variables never reach the KV
//! store; the controller saves them here under a region-scoped path and
//! persists only redacted copies. Cleanup failures are logged by the
//! callers, never surfaced to the user operation.

use std::collections::{BTreeMap, HashMap};

use edgegrid_model::AppKey;
use parking_lot::Mutex;

pub trait SecretStore: Send + Sync + 'static {
    fn save_app_secret_vars(
        &self,
        region: &str,
        key: &AppKey,
        vars: &BTreeMap<String, String>,
    ) -> Result<(), String>;

    /// Replace the stored vars with the given set.
    fn update_app_secret_vars(
        &self,
        region: &str,
        key: &AppKey,
        vars: &BTreeMap<String, String>,
    ) -> Result<(), String>;

    fn delete_app_secret_vars(&self, region: &str, key: &AppKey) -> Result<(), String>;
}

/// In-memory secret store for tests and single-node deployments.
#[derive(Default)]
pub struct InMemorySecretStore {
    data: Mutex<HashMap<String, BTreeMap<String, String>>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn path(region: &str, key: &AppKey) -> String {
        format!("{region}/apps/{key}/secretvars")
    }

    pub fn get(&self, region: &str, key: &AppKey) -> Option<BTreeMap<String, String>> {
        self.data.lock().get(&Self::path(region, key)).cloned()
    }
}

impl SecretStore for InMemorySecretStore {
    fn save_app_secret_vars(
        &self,
        region: &str,
        key: &AppKey,
        vars: &BTreeMap<String, String>,
    ) -> Result<(), String> {
        self.data
            .lock()
            .insert(Self::path(region, key), vars.clone());
        Ok(())
    }

    fn update_app_secret_vars(
        &self,
        region: &str,
        key: &AppKey,
        vars: &BTreeMap<String, String>,
    ) -> Result<(), String> {
        self.save_app_secret_vars(region, key, vars)
    }

    fn delete_app_secret_vars(&self, region: &str, key: &AppKey) -> Result<(), String> {
        self.data.lock().remove(&Self::path(region, key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_get_delete() {
        let store = InMemorySecretStore::new();
        let key = AppKey::new("acme", "web", "1.0");
        let mut vars = BTreeMap::new();
        vars.insert("API_KEY".to_string(), "hunter2".to_string());

        store.save_app_secret_vars("us-west", &key, &vars).unwrap();
        assert_eq!(store.get("us-west", &key).unwrap(), vars);
        assert!(store.get("eu-east", &key).is_none());

        store.delete_app_secret_vars("us-west", &key).unwrap();
        assert!(store.get("us-west", &key).is_none());
    }
}
