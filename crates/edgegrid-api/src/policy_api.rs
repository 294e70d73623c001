//! Policy APIs: trust policies and exceptions, auto-prov, auto-scale,
//! and alert policies.

use edgegrid_model::{
    AlertPolicy, AutoProvPolicy, AutoScalePolicy, Obj, ObjKey, PolicyKey, TrustPolicy,
    TrustPolicyException,
};
use tracing::info;

use crate::controller::Controller;
use crate::error::{ApiError, ApiResult};
use crate::refs::get_live;

impl Controller {
    // ── Trust policies ─────────────────────────────────────────────

    pub async fn create_trust_policy(&self, policy: TrustPolicy) -> ApiResult<()> {
        policy.validate()?;
        let store = self.c.stores.trust_policy.clone();
        self.stm(|stm| {
            if store.stm_has(stm, &policy.key) {
                return Err(policy.key.exists_error().into());
            }
            store.stm_put(stm, &policy)?;
            Ok(())
        })
        .await?;
        info!(policy = %policy.key, "trust policy created");
        Ok(())
    }

    pub async fn delete_trust_policy(&self, key: &PolicyKey) -> ApiResult<()> {
        let caches = &self.c.caches;
        let name = key.name.clone();
        let org = key.organization.clone();
        let check = move |_stm: &mut edgegrid_kv::Stm<'_>, _cur: &TrustPolicy| {
            let users = caches
                .cloudlet
                .keys_filtered(|c| c.trust_policy == name && c.key.organization == org);
            if let Some(user) = users.first() {
                return Err(ApiError::Conflict(format!(
                    "TrustPolicy in use by Cloudlet {user}"
                )));
            }
            Ok(())
        };
        self.safe_delete_simple::<TrustPolicy, _>(key, check).await
    }

    pub async fn create_trust_policy_exception(
        &self,
        exception: TrustPolicyException,
    ) -> ApiResult<()> {
        exception.validate()?;
        let store = self.c.stores.trust_policy_exception.clone();
        let apps = self.c.stores.app.clone();
        let zones = self.c.stores.zone.clone();
        self.stm(|stm| {
            if store.stm_has(stm, &exception.key) {
                return Err(exception.key.exists_error().into());
            }
            get_live(&apps, stm, &exception.app_key)?;
            get_live(&zones, stm, &exception.zone_key)?;
            store.stm_put(stm, &exception)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn delete_trust_policy_exception(&self, key: &PolicyKey) -> ApiResult<()> {
        self.safe_delete_simple::<TrustPolicyException, _>(key, |_stm, _cur| Ok(()))
            .await
    }

    /// The exception that names this app, if any (blocks un-trusting or
    /// deleting the app).
    pub(crate) fn trust_policy_exception_for_app(
        &self,
        app_key: &edgegrid_model::AppKey,
    ) -> Option<PolicyKey> {
        self.c
            .caches
            .trust_policy_exception
            .keys_filtered(|e| e.app_key == *app_key)
            .into_iter()
            .next()
    }

    // ── Auto-prov / auto-scale policies ────────────────────────────

    pub async fn create_auto_prov_policy(&self, policy: AutoProvPolicy) -> ApiResult<()> {
        policy.key.validate()?;
        let store = self.c.stores.auto_prov_policy.clone();
        self.stm(|stm| {
            if store.stm_has(stm, &policy.key) {
                return Err(policy.key.exists_error().into());
            }
            store.stm_put(stm, &policy)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn delete_auto_prov_policy(&self, key: &PolicyKey) -> ApiResult<()> {
        let caches = &self.c.caches;
        let name = key.name.clone();
        let org = key.organization.clone();
        let check = move |_stm: &mut edgegrid_kv::Stm<'_>, _cur: &AutoProvPolicy| {
            let users = caches.app.keys_filtered(|a| {
                a.key.organization == org && a.auto_prov_policies.iter().any(|p| *p == name)
            });
            if let Some(user) = users.first() {
                return Err(ApiError::Conflict(format!(
                    "AutoProvPolicy in use by App {user}"
                )));
            }
            Ok(())
        };
        self.safe_delete_simple::<AutoProvPolicy, _>(key, check).await
    }

    pub async fn create_auto_scale_policy(&self, policy: AutoScalePolicy) -> ApiResult<()> {
        policy.key.validate()?;
        if policy.max_nodes < policy.min_nodes {
            return Err(ApiError::invalid("max nodes cannot be below min nodes"));
        }
        let store = self.c.stores.auto_scale_policy.clone();
        self.stm(|stm| {
            if store.stm_has(stm, &policy.key) {
                return Err(policy.key.exists_error().into());
            }
            store.stm_put(stm, &policy)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn delete_auto_scale_policy(&self, key: &PolicyKey) -> ApiResult<()> {
        self.safe_delete_simple::<AutoScalePolicy, _>(key, |_stm, _cur| Ok(()))
            .await
    }

    // ── Alert policies ─────────────────────────────────────────────

    pub async fn create_alert_policy(&self, policy: AlertPolicy) -> ApiResult<()> {
        policy.key.validate()?;
        let store = self.c.stores.alert_policy.clone();
        self.stm(|stm| {
            if store.stm_has(stm, &policy.key) {
                return Err(policy.key.exists_error().into());
            }
            store.stm_put(stm, &policy)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn delete_alert_policy(&self, key: &PolicyKey) -> ApiResult<()> {
        let caches = &self.c.caches;
        let name = key.name.clone();
        let org = key.organization.clone();
        let check = move |_stm: &mut edgegrid_kv::Stm<'_>, _cur: &AlertPolicy| {
            let users = caches.app.keys_filtered(|a| {
                a.key.organization == org && a.alert_policies.iter().any(|p| *p == name)
            });
            if let Some(user) = users.first() {
                return Err(ApiError::Conflict(format!(
                    "AlertPolicy in use by App {user}"
                )));
            }
            Ok(())
        };
        self.safe_delete_simple::<AlertPolicy, _>(key, check).await
    }
}
