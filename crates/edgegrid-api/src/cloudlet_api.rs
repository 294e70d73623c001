//! Cloudlet and CloudletInfo APIs.
//!
//! The Cloudlet is operator intent; CloudletInfo is what the site
//! reports back. Info records are stored under a lease so a site that
//! stops reporting disappears on its own, and info ingestion drives the
//! cloudlet's tracked state machine.

use std::time::Duration;

use edgegrid_kv::LeaseId;
use edgegrid_lifecycle::{channel_for, wait_for_state, CrmOp, InfoSnapshot, WaitSpec};
use edgegrid_model::{
    epoch_secs, new_obj_id, Cloudlet, CloudletInfo, CloudletKey, CloudletRefs, CloudletState,
    CrmOverride, FieldMap, MaintenanceState, Obj, ObjKey, PolicyKey, TrackedState, ZoneKey,
};
use edgegrid_res::{CloudletResCalc, ResValMap};
use tracing::{info, warn};

use crate::controller::{Controller, CtrlSource};
use crate::error::{ApiError, ApiResult};
use crate::refs::get_live;

impl Controller {
    pub async fn create_cloudlet(
        &self,
        mut cloudlet: Cloudlet,
        mut on_status: impl FnMut(&str),
    ) -> ApiResult<()> {
        cloudlet.key.validate()?;
        let skip_crm = cloudlet.crm_override.skips_crm();
        cloudlet.state = if skip_crm {
            TrackedState::Ready
        } else {
            TrackedState::CreateRequested
        };

        let stores = &self.c.stores;
        self.stm(|stm| {
            if stores.cloudlet.stm_has(stm, &cloudlet.key) {
                return Err(cloudlet.key.exists_error().into());
            }
            if !cloudlet.trust_policy.is_empty() {
                let policy_key =
                    PolicyKey::new(&cloudlet.key.organization, &cloudlet.trust_policy);
                get_live(&stores.trust_policy, stm, &policy_key)?;
            }
            if !cloudlet.zone.is_empty() {
                let zone_key = cloudlet.zone_key();
                if !stores.zone.stm_has(stm, &zone_key) {
                    return Err(zone_key.not_found_error().into());
                }
            }
            let mut obj = cloudlet.clone();
            obj.obj_id = new_obj_id();
            obj.created_at = epoch_secs();
            if !obj.trust_policy.is_empty() && skip_crm {
                obj.trust_policy_state = TrackedState::Ready;
            }
            stores.cloudlet.stm_put(stm, &obj)?;
            stores
                .cloudlet_refs
                .stm_put(stm, &CloudletRefs::new(obj.key.clone()))?;
            Ok(())
        })
        .await?;

        if skip_crm {
            info!(cloudlet = %cloudlet.key, "cloudlet created (crm skipped)");
            return Ok(());
        }

        let current = stores
            .cloudlet
            .get(&cloudlet.key)?
            .ok_or_else(|| cloudlet.key.not_found_error())?;
        self.c.crm.apply_cloudlet(&current, CrmOp::Create);
        self.wait_cloudlet_state(&cloudlet.key, TrackedState::Ready, &mut on_status)
            .await?;
        info!(cloudlet = %cloudlet.key, "cloudlet created");
        Ok(())
    }

    /// Operator-side update: zone membership, trust policy, quotas,
    /// maintenance. Changes are committed and pushed to the site without
    /// waiting for it to settle.
    pub async fn update_cloudlet(&self, update: Cloudlet, fmap: FieldMap) -> ApiResult<()> {
        let allowed = [
            "zone",
            "trust_policy",
            "maintenance_state",
            "resource_quotas",
            "crm_override",
            "num_dynamic_ips",
        ];
        let bad = fmap.disallowed(&allowed);
        if !bad.is_empty() {
            return Err(ApiError::invalid(format!(
                "fields not updatable: {}",
                bad.join(", ")
            )));
        }
        let stores = &self.c.stores;
        self.stm(|stm| {
            let mut cur = stores
                .cloudlet
                .stm_get(stm, &update.key)?
                .ok_or_else(|| update.key.not_found_error())?;
            if cur.delete_prepare {
                return Err(update.key.being_deleted_error().into());
            }
            if fmap.has("zone") {
                if !update.zone.is_empty() {
                    let zone_key = ZoneKey::new(&cur.key.organization, &update.zone);
                    if !stores.zone.stm_has(stm, &zone_key) {
                        return Err(zone_key.not_found_error().into());
                    }
                }
                cur.zone = update.zone.clone();
            }
            if fmap.has("trust_policy") {
                if !update.trust_policy.is_empty() {
                    let policy_key =
                        PolicyKey::new(&cur.key.organization, &update.trust_policy);
                    get_live(&stores.trust_policy, stm, &policy_key)?;
                    cur.trust_policy_state = TrackedState::UpdateRequested;
                } else {
                    cur.trust_policy_state = TrackedState::NotPresent;
                }
                cur.trust_policy = update.trust_policy.clone();
            }
            if fmap.has("maintenance_state") {
                cur.maintenance_state = update.maintenance_state;
            }
            if fmap.has_or_has_child("resource_quotas") {
                cur.resource_quotas = update.resource_quotas.clone();
            }
            if fmap.has("crm_override") {
                cur.crm_override = update.crm_override;
            }
            if fmap.has("num_dynamic_ips") {
                cur.num_dynamic_ips = update.num_dynamic_ips;
            }
            cur.updated_at = epoch_secs();
            stores.cloudlet.stm_put(stm, &cur)?;
            Ok(())
        })
        .await?;

        if let Some(current) = stores.cloudlet.get(&update.key)? {
            if !current.crm_override.skips_crm() {
                self.c.crm.apply_cloudlet(&current, CrmOp::Update);
            }
        }
        Ok(())
    }

    pub async fn delete_cloudlet(
        &self,
        key: &CloudletKey,
        crm_override: CrmOverride,
        mut on_status: impl FnMut(&str),
    ) -> ApiResult<()> {
        let stores = &self.c.stores;
        let skip_crm = crm_override.skips_crm();

        self.stm(|stm| {
            let mut cur = stores
                .cloudlet
                .stm_get(stm, key)?
                .ok_or_else(|| key.not_found_error())?;
            if cur.delete_prepare {
                return Err(key.being_deleted_error().into());
            }
            if cur.state.is_transient() && !crm_override.ignores_transient_state() {
                return Err(ApiError::Conflict(format!(
                    "action is already in progress for cloudlet {} (state {})",
                    cur.key, cur.state
                )));
            }
            if let Some(refs) = stores.cloudlet_refs.stm_get(stm, key)? {
                if let Some(user) = refs.cluster_insts.iter().next() {
                    return Err(ApiError::Conflict(format!(
                        "Cloudlet in use by ClusterInst {user}"
                    )));
                }
                if let Some(user) = refs.vm_app_insts.iter().next() {
                    return Err(ApiError::Conflict(format!(
                        "Cloudlet in use by AppInst {user}"
                    )));
                }
            }
            cur.delete_prepare = true;
            cur.crm_override = crm_override;
            cur.state = TrackedState::DeleteRequested;
            stores.cloudlet.stm_put(stm, &cur)?;
            Ok(())
        })
        .await?;

        if skip_crm {
            return self.cloudlet_delete_finish(key).await;
        }

        let current = stores
            .cloudlet
            .get(key)?
            .ok_or_else(|| key.not_found_error())?;
        self.c.crm.apply_cloudlet(&current, CrmOp::Delete);
        let result = self
            .wait_cloudlet_state(key, TrackedState::NotPresent, &mut on_status)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                if crm_override.ignores_crm_errors() {
                    return self.cloudlet_delete_finish(key).await;
                }
                self.clear_delete_prepare::<Cloudlet>(key).await;
                Err(err)
            }
        }
    }

    async fn cloudlet_delete_finish(&self, key: &CloudletKey) -> ApiResult<()> {
        let stores = &self.c.stores;
        let label_prefix = format!("CloudletObjDnsLabel/{}/", key.key_string());
        self.stm(|stm| {
            stores.cloudlet.stm_del(stm, key);
            stores.cloudlet_refs.stm_del(stm, key);
            stores.cloudlet_info.stm_del(stm, key);
            for (path, _) in stm.list(&label_prefix) {
                stm.del(&path);
            }
            Ok(())
        })
        .await?;
        self.publish_cloudlet_snapshot(key, TrackedState::NotPresent, &[]);
        info!(cloudlet = %key, "cloudlet removed");
        Ok(())
    }

    async fn wait_cloudlet_state(
        &self,
        key: &CloudletKey,
        target: TrackedState,
        on_status: &mut impl FnMut(&str),
    ) -> ApiResult<()> {
        let spec = WaitSpec {
            channel: channel_for(Cloudlet::TYPE, key),
            object: format!("Cloudlet {key}"),
            target,
            timeout: Duration::from_secs(self.settings().crm_operation_timeout_secs),
        };
        let me = self.clone();
        let key = key.clone();
        wait_for_state(
            self.c.bus.as_ref(),
            move || me.tracked_snapshot::<Cloudlet>(&key),
            &spec,
            on_status,
        )
        .await
        .map_err(ApiError::from)
    }

    fn publish_cloudlet_snapshot(&self, key: &CloudletKey, state: TrackedState, errors: &[String]) {
        self.c.bus.publish(
            &channel_for(Cloudlet::TYPE, key),
            &InfoSnapshot {
                state,
                status_msgs: Vec::new(),
                errors: errors.to_vec(),
            },
        );
    }

    // ── CloudletInfo ingestion ─────────────────────────────────────

    /// Accept a site report. Updates the stored info (under the site's
    /// lease, so a dead site expires), then drives the cloudlet tracked
    /// state and mirrors infra flavors.
    pub async fn handle_cloudlet_info(
        &self,
        report: CloudletInfo,
        lease: Option<LeaseId>,
    ) -> ApiResult<()> {
        let key = report.key.clone();
        let stores = &self.c.stores;

        if report.state == CloudletState::NotPresent {
            // The site confirmed removal; finish the delete if one is in
            // flight, otherwise ignore the stale report.
            let finishing = stores
                .cloudlet
                .get(&key)?
                .map(|c| {
                    matches!(
                        c.state,
                        TrackedState::DeleteRequested | TrackedState::Deleting
                    )
                })
                .unwrap_or(false);
            if finishing {
                return self.cloudlet_delete_finish(&key).await;
            }
            return Ok(());
        }

        let fmap = report.present_fields();
        let mut changed_to_online = false;
        self.stm(|stm| {
            changed_to_online = false;
            let mut cur = stores
                .cloudlet_info
                .stm_get(stm, &key)?
                .unwrap_or_else(|| CloudletInfo {
                    key: key.clone(),
                    ..Default::default()
                });
            let old_state = cur.state;
            let mut incoming = report.clone();
            if key.is_federated() && !cur.flavors.is_empty() {
                // Federated flavors are injected at registration; the
                // reporting site must not overwrite them.
                incoming.flavors = cur.flavors.clone();
            }
            cur.copy_in_fields(&incoming, &fmap);
            cur.notify_id = report.notify_id;
            if cur.state == CloudletState::Ready && old_state != CloudletState::Ready {
                changed_to_online = true;
            }
            match lease {
                Some(lease) => stores.cloudlet_info.stm_put_with_lease(stm, &cur, lease)?,
                None => stores.cloudlet_info.stm_put(stm, &cur)?,
            }
            Ok(())
        })
        .await?;

        let Some(cloudlet) = stores.cloudlet.get(&key)? else {
            return Ok(());
        };

        // Map the site state onto the cloudlet tracked state machine.
        let new_state = match report.state {
            CloudletState::Init => Some(TrackedState::CrmInitOk),
            CloudletState::Ready => Some(TrackedState::Ready),
            CloudletState::Upgrade => Some(TrackedState::Updating),
            CloudletState::Errors => match cloudlet.state {
                TrackedState::UpdateRequested | TrackedState::Updating => {
                    Some(TrackedState::UpdateError)
                }
                TrackedState::CreateRequested | TrackedState::Creating => {
                    Some(TrackedState::CreateError)
                }
                _ => None,
            },
            _ => None,
        };

        if let Some(new_state) = new_state {
            self.stm(|stm| {
                let Some(mut cur) = stores.cloudlet.stm_get(stm, &key)? else {
                    return Ok(());
                };
                let mut update = false;
                if cur.state != new_state {
                    cur.state = new_state;
                    cur.errors = report.errors.clone();
                    if report.state == CloudletState::Ready {
                        cur.errors.clear();
                        if !cur.trust_policy.is_empty() {
                            cur.trust_policy_state = TrackedState::Ready;
                        }
                    }
                    update = true;
                }
                if !report.container_version.is_empty()
                    && cur.container_version != report.container_version
                {
                    cur.container_version = report.container_version.clone();
                    update = true;
                }
                if !key.is_federated() && !report.flavors.is_empty() {
                    // Mirror infra flavors so developers can see them.
                    cur.infra_flavors = report.flavors.clone();
                    update = true;
                }
                if update {
                    stores.cloudlet.stm_put(stm, &cur)?;
                }
                Ok(())
            })
            .await?;
            self.publish_cloudlet_snapshot(&key, new_state, &report.errors);
        }

        if changed_to_online {
            info!(cloudlet = %key, "cloudlet online");
            if cloudlet.features.is_single_kubernetes_cluster {
                self.sync_single_cluster_resources(&cloudlet, &report).await?;
            }
        }
        if report.state == CloudletState::Ready {
            // Recompute resource warnings from the fresh report.
            let warnings = {
                let mut src = CtrlSource::cache(&self.c);
                let mut calc = CloudletResCalc::new(&mut src, &key, self.settings());
                calc.deps.cloudlet_info = Some(report.clone());
                calc.cloudlet_fits_reqd_vals(&ResValMap::new())
            };
            match warnings {
                Ok(warnings) => {
                    for warning in warnings {
                        warn!(cloudlet = %key, warning, "resource usage warning");
                    }
                }
                Err(e) => warn!(cloudlet = %key, error = %e, "failed to validate cloudlet resources"),
            }
        }
        Ok(())
    }

    /// Mirror reported node pools onto the singleton cluster of a
    /// single-Kubernetes platform.
    async fn sync_single_cluster_resources(
        &self,
        cloudlet: &Cloudlet,
        report: &CloudletInfo,
    ) -> ApiResult<()> {
        if report.node_pools.is_empty() {
            return Ok(());
        }
        let owner = if cloudlet.single_kubernetes_cluster_owner.is_empty() {
            edgegrid_placement::PLATFORM_ORG.to_string()
        } else {
            cloudlet.single_kubernetes_cluster_owner.clone()
        };
        let cluster_key = edgegrid_model::ClusterKey::new(
            &owner,
            &format!("default-{}", edgegrid_model::dnslabel::dns_sanitize(&cloudlet.key.name)),
        );
        let stores = &self.c.stores;
        let cloudlet_key = cloudlet.key.clone();
        let pools = report.node_pools.clone();
        self.stm(|stm| {
            let mut cluster = stores
                .cluster_inst
                .stm_get(stm, &cluster_key)?
                .unwrap_or_else(|| edgegrid_model::ClusterInst {
                    key: cluster_key.clone(),
                    cloudlet_key: cloudlet_key.clone(),
                    deployment: edgegrid_model::DeploymentType::Kubernetes,
                    multi_tenant: true,
                    state: TrackedState::Ready,
                    ..Default::default()
                });
            cluster.node_pools = pools.clone();
            stores.cluster_inst.stm_put(stm, &cluster)?;
            let mut refs = stores
                .cloudlet_refs
                .stm_get(stm, &cloudlet_key)?
                .unwrap_or_else(|| CloudletRefs::new(cloudlet_key.clone()));
            if refs.cluster_insts.insert(cluster_key.clone()) {
                stores.cloudlet_refs.stm_put(stm, &refs)?;
            }
            if stores.cluster_refs.stm_get(stm, &cluster_key)?.is_none() {
                stores
                    .cluster_refs
                    .stm_put(stm, &edgegrid_model::ClusterRefs::new(cluster_key.clone()))?;
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Mark every info record reported through a disconnected notify
    /// subscriber OFFLINE.
    pub async fn flush_cloudlet_infos(&self, notify_id: i64) -> ApiResult<()> {
        let keys = self
            .c
            .caches
            .cloudlet_info
            .keys_filtered(|info| info.notify_id == notify_id);
        let stores = &self.c.stores;
        for key in keys {
            self.stm(|stm| {
                if let Some(mut cur) = stores.cloudlet_info.stm_get(stm, &key)? {
                    cur.state = CloudletState::Offline;
                    stores.cloudlet_info.stm_put(stm, &cur)?;
                }
                Ok(())
            })
            .await?;
            info!(cloudlet = %key, notify_id, "marked offline after notify disconnect");
        }
        Ok(())
    }

    pub async fn set_cloudlet_maintenance(
        &self,
        key: &CloudletKey,
        state: MaintenanceState,
    ) -> ApiResult<()> {
        let stores = &self.c.stores;
        self.stm(|stm| {
            let mut cur = stores
                .cloudlet
                .stm_get(stm, key)?
                .ok_or_else(|| key.not_found_error())?;
            cur.maintenance_state = state;
            cur.updated_at = epoch_secs();
            stores.cloudlet.stm_put(stm, &cur)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub fn show_cloudlets(&self, filter: impl Fn(&Cloudlet) -> bool) -> Vec<Cloudlet> {
        let mut out = Vec::new();
        self.c.caches.cloudlet.show(filter, |c| out.push(c.clone()));
        out
    }

    pub fn show_cloudlet_infos(&self) -> Vec<CloudletInfo> {
        let mut out = Vec::new();
        self.c
            .caches
            .cloudlet_info
            .show(|_| true, |i| out.push(i.clone()));
        out
    }

    /// Zones whose cloudlets could host an instance of this app right
    /// now. With `dry_run_deploy`, candidate sites must also pass the
    /// resource calculator. Zones sort lexicographically.
    pub fn zones_for_app_deployment(
        &self,
        app: &edgegrid_model::App,
        dry_run_deploy: bool,
    ) -> Vec<ZoneKey> {
        let caches = &self.c.caches;
        let cloudlets = caches.cloudlet.keys_filtered(|c| !c.delete_prepare);
        let mut zones: Vec<ZoneKey> = Vec::new();
        for key in cloudlets {
            let Some(cloudlet) = caches.cloudlet.get(&key) else {
                continue;
            };
            let zone_key = cloudlet.zone_key();
            if !zone_key.is_set() {
                continue;
            }
            if dry_run_deploy {
                let demand = match (&app.kubernetes_resources, &app.node_resources) {
                    (Some(kr), _) => kr.total(),
                    (None, Some(nr)) => (nr.vcpus, nr.ram_mb, nr.disk_gb),
                    (None, None) => continue,
                };
                let fits = {
                    let mut src = CtrlSource::cache(&self.c);
                    let mut calc = CloudletResCalc::new(&mut src, &key, self.settings());
                    calc.cloudlet_fits_reqd_vals(&ResValMap::from_totals(
                        demand.0, demand.1, demand.2,
                    ))
                    .is_ok()
                };
                if !fits {
                    continue;
                }
            }
            if !zones.contains(&zone_key) {
                zones.push(zone_key);
            }
        }
        zones.sort_by(|a, b| a.key_string().cmp(&b.key_string()));
        zones
    }
}
