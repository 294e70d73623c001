//! ClusterInst API: create, update, delete, reservations, and the
//! site-reported state handling that drives the tracked state machine.

use std::time::Duration;

use edgegrid_kv::Stm;
use edgegrid_lifecycle::{channel_for, wait_for_state, CrmOp, InfoSnapshot, WaitSpec};
use edgegrid_model::{
    epoch_secs, new_obj_id, CloudletRefs, ClusterInst, ClusterKey, ClusterRefs, CrmOverride,
    FieldMap, Obj, ObjKey, TrackedState,
};
use edgegrid_res::CloudletResCalc;
use tracing::{info, warn};

use crate::controller::{Controller, CtrlSource};
use crate::error::{ApiError, ApiResult};
use crate::refs::get_live;

impl Controller {
    /// Validate fit, claim a DNS label, and write a new cluster with its
    /// refs entries. Shared by the user-facing create and the
    /// autocluster path inside AppInst create.
    pub(crate) fn write_new_cluster(
        &self,
        stm: &mut Stm<'_>,
        cluster: &mut ClusterInst,
    ) -> ApiResult<()> {
        let cloudlet = get_live(&self.c.stores.cloudlet, stm, &cluster.cloudlet_key)?;
        if !cloudlet.accepts_new_instances() {
            return Err(ApiError::Conflict(format!(
                "cloudlet {} is under maintenance",
                cloudlet.key
            )));
        }
        cluster.zone_key = cloudlet.zone_key();

        {
            let mut src = CtrlSource::stm(&self.c, stm);
            let mut calc =
                CloudletResCalc::new(&mut src, &cluster.cloudlet_key, self.settings());
            let specs = calc.cloudlet_fits_cluster(cluster)?;
            for (pool, spec) in cluster.node_pools.iter_mut().zip(specs) {
                pool.node_resources.infra_node_flavor = spec.flavor_name;
                pool.node_resources.external_volume_gb = spec.external_volume_gb;
            }
        }

        cluster.dns_label =
            self.c
                .dns_labels
                .alloc(stm, &cluster.cloudlet_key, &cluster.key.name)?;
        cluster.obj_id = new_obj_id();
        cluster.created_at = epoch_secs();

        let mut cloudlet_refs = self
            .c
            .stores
            .cloudlet_refs
            .stm_get(stm, &cluster.cloudlet_key)?
            .unwrap_or_else(|| CloudletRefs::new(cluster.cloudlet_key.clone()));
        cloudlet_refs.cluster_insts.insert(cluster.key.clone());
        self.c.stores.cloudlet_refs.stm_put(stm, &cloudlet_refs)?;
        self.c
            .stores
            .cluster_refs
            .stm_put(stm, &ClusterRefs::new(cluster.key.clone()))?;
        self.c.stores.cluster_inst.stm_put(stm, cluster)?;
        Ok(())
    }

    pub async fn create_cluster_inst(
        &self,
        mut cluster: ClusterInst,
        mut on_status: impl FnMut(&str),
    ) -> ApiResult<()> {
        cluster.validate()?;
        let store = self.c.stores.cluster_inst.clone();
        let skip_crm = cluster.crm_override.skips_crm();
        cluster.state = if skip_crm {
            TrackedState::Ready
        } else {
            TrackedState::CreateRequested
        };

        self.stm(|stm| {
            if store.stm_has(stm, &cluster.key) {
                return Err(cluster.key.exists_error().into());
            }
            let mut obj = cluster.clone();
            self.write_new_cluster(stm, &mut obj)?;
            cluster.dns_label = obj.dns_label.clone();
            cluster.zone_key = obj.zone_key.clone();
            Ok(())
        })
        .await?;

        if skip_crm {
            info!(cluster = %cluster.key, "cluster created (crm skipped)");
            return Ok(());
        }

        self.c
            .crm
            .apply_cluster_inst(&store.get(&cluster.key)?.unwrap_or(cluster.clone()), CrmOp::Create);
        let result = self
            .wait_cluster_state(&cluster.key, TrackedState::Ready, &mut on_status)
            .await;
        match result {
            Ok(()) => {
                info!(cluster = %cluster.key, "cluster created");
                Ok(())
            }
            Err(err) => {
                if cluster.crm_override.ignores_crm_errors() {
                    self.force_cluster_state(&cluster.key, TrackedState::Ready).await;
                    return Ok(());
                }
                // Leave the error state for inspection but tear down the
                // intent we wrote.
                if let ApiError::Infra(edgegrid_lifecycle::LifecycleError::Failed(_)) = &err {
                    if let Err(undo) = self.cluster_delete_finish(&cluster.key).await {
                        warn!(cluster = %cluster.key, error = %undo, "undo of failed cluster create failed");
                    }
                }
                Err(err)
            }
        }
    }

    pub async fn update_cluster_inst(
        &self,
        update: ClusterInst,
        fmap: FieldMap,
        mut on_status: impl FnMut(&str),
    ) -> ApiResult<()> {
        let bad = fmap.disallowed(ClusterInst::UPDATABLE_FIELDS);
        if !bad.is_empty() {
            return Err(ApiError::invalid(format!(
                "fields not updatable: {}",
                bad.join(", ")
            )));
        }
        let store = self.c.stores.cluster_inst.clone();
        let skip_crm = update.crm_override.skips_crm();
        self.stm(|stm| {
            let mut cur = store
                .stm_get(stm, &update.key)?
                .ok_or_else(|| update.key.not_found_error())?;
            if cur.delete_prepare {
                return Err(update.key.being_deleted_error().into());
            }
            if cur.state != TrackedState::Ready {
                return Err(ApiError::Conflict(format!(
                    "cluster {} is not ready for update (state {})",
                    cur.key, cur.state
                )));
            }
            let old_total = cur.total_resources();
            cur.copy_in_fields(&update, &fmap);
            cur.validate()?;

            // Only the growth counts against the cloudlet.
            let new_total = cur.total_resources();
            let delta = edgegrid_res::ResValMap::from_totals(
                new_total.0.saturating_sub(old_total.0),
                new_total.1.saturating_sub(old_total.1),
                new_total.2.saturating_sub(old_total.2),
            );
            if !delta.is_empty() {
                let mut src = CtrlSource::stm(&self.c, stm);
                let mut calc = CloudletResCalc::new(&mut src, &cur.cloudlet_key, self.settings());
                calc.cloudlet_fits_reqd_vals(&delta)?;
            }

            cur.state = if skip_crm {
                TrackedState::Ready
            } else {
                TrackedState::UpdateRequested
            };
            cur.updated_at = epoch_secs();
            store.stm_put(stm, &cur)?;
            Ok(())
        })
        .await?;

        if skip_crm {
            return Ok(());
        }
        let current = store.get(&update.key)?.ok_or_else(|| update.key.not_found_error())?;
        self.c.crm.apply_cluster_inst(&current, CrmOp::Update);
        self.wait_cluster_state(&update.key, TrackedState::Ready, &mut on_status)
            .await
    }

    pub async fn delete_cluster_inst(
        &self,
        key: &ClusterKey,
        crm_override: CrmOverride,
        mut on_status: impl FnMut(&str),
    ) -> ApiResult<()> {
        let store = self.c.stores.cluster_inst.clone();
        let refs_store = self.c.stores.cluster_refs.clone();
        let skip_crm = crm_override.skips_crm();

        self.stm(|stm| {
            let mut cur = store
                .stm_get(stm, key)?
                .ok_or_else(|| key.not_found_error())?;
            if cur.delete_prepare {
                return Err(key.being_deleted_error().into());
            }
            if cur.state.is_transient() && !crm_override.ignores_transient_state() {
                return Err(ApiError::Conflict(format!(
                    "action is already in progress for cluster {} (state {})",
                    cur.key, cur.state
                )));
            }
            if let Some(refs) = refs_store.stm_get(stm, key)? {
                if let Some(user) = refs.apps.iter().next() {
                    return Err(ApiError::Conflict(format!(
                        "ClusterInst in use by AppInst {user}"
                    )));
                }
            }
            cur.delete_prepare = true;
            cur.crm_override = crm_override;
            cur.state = TrackedState::DeleteRequested;
            store.stm_put(stm, &cur)?;
            Ok(())
        })
        .await?;

        if skip_crm {
            return self.cluster_delete_finish(key).await;
        }

        let current = store.get(key)?.ok_or_else(|| key.not_found_error())?;
        self.c.crm.apply_cluster_inst(&current, CrmOp::Delete);
        let result = self
            .wait_cluster_state(key, TrackedState::NotPresent, &mut on_status)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                if crm_override.ignores_crm_errors() {
                    return self.cluster_delete_finish(key).await;
                }
                self.clear_delete_prepare::<ClusterInst>(key).await;
                Err(err)
            }
        }
    }

    /// Final removal: the cluster record, its refs, its autocluster id,
    /// and its DNS label, in one transaction. Idempotent.
    pub(crate) async fn cluster_delete_finish(&self, key: &ClusterKey) -> ApiResult<()> {
        let store = self.c.stores.cluster_inst.clone();
        let refs_store = self.c.stores.cluster_refs.clone();
        let cloudlet_refs_store = self.c.stores.cloudlet_refs.clone();
        let labels = self.c.dns_labels.clone();
        self.stm(|stm| {
            let Some(cur) = store.stm_get(stm, key)? else {
                return Ok(());
            };
            if let Some(mut refs) = cloudlet_refs_store.stm_get(stm, &cur.cloudlet_key)? {
                refs.cluster_insts.remove(key);
                if let Some(id) = cur.auto_cluster_id {
                    refs.free_auto_cluster_id(id);
                }
                cloudlet_refs_store.stm_put(stm, &refs)?;
            }
            if !cur.dns_label.is_empty() {
                labels.release(stm, &cur.cloudlet_key, &cur.dns_label);
            }
            refs_store.stm_del(stm, key);
            store.stm_del(stm, key);
            Ok(())
        })
        .await?;
        self.publish_cluster_snapshot(key, TrackedState::NotPresent, &[], &[]);
        info!(cluster = %key, "cluster removed");
        Ok(())
    }

    async fn wait_cluster_state(
        &self,
        key: &ClusterKey,
        target: TrackedState,
        on_status: &mut impl FnMut(&str),
    ) -> ApiResult<()> {
        let spec = WaitSpec {
            channel: channel_for(ClusterInst::TYPE, key),
            object: format!("ClusterInst {key}"),
            target,
            timeout: Duration::from_secs(self.settings().crm_operation_timeout_secs),
        };
        let me = self.clone();
        let key = key.clone();
        wait_for_state(
            self.c.bus.as_ref(),
            move || me.tracked_snapshot::<ClusterInst>(&key),
            &spec,
            on_status,
        )
        .await
        .map_err(ApiError::from)
    }

    fn publish_cluster_snapshot(
        &self,
        key: &ClusterKey,
        state: TrackedState,
        status_msgs: &[String],
        errors: &[String],
    ) {
        self.c.bus.publish(
            &channel_for(ClusterInst::TYPE, key),
            &InfoSnapshot {
                state,
                status_msgs: status_msgs.to_vec(),
                errors: errors.to_vec(),
            },
        );
    }

    /// Force a state without CRM involvement (IgnoreCrmErrors recovery).
    async fn force_cluster_state(&self, key: &ClusterKey, state: TrackedState) {
        let store = self.c.stores.cluster_inst.clone();
        let result = self
            .stm(|stm| {
                if let Some(mut cur) = store.stm_get(stm, key)? {
                    cur.state = state;
                    cur.errors.clear();
                    store.stm_put(stm, &cur)?;
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            warn!(cluster = %key, error = %e, "failed to force cluster state");
        }
    }

    /// Site-reported cluster state. Updates the store first, then
    /// publishes to the progress channel so waiters observe a state the
    /// store already has.
    pub async fn handle_cluster_inst_info(
        &self,
        key: &ClusterKey,
        state: TrackedState,
        status_msgs: Vec<String>,
        errors: Vec<String>,
    ) -> ApiResult<()> {
        if state == TrackedState::NotPresent {
            // Delete completed on site; remove the record.
            let finishing = {
                let cur = self.c.stores.cluster_inst.get(key)?;
                matches!(
                    cur.map(|c| c.state),
                    Some(TrackedState::DeleteRequested) | Some(TrackedState::Deleting)
                )
            };
            if finishing {
                return self.cluster_delete_finish(key).await;
            }
            return Ok(());
        }

        let store = self.c.stores.cluster_inst.clone();
        let mut applied = false;
        self.stm(|stm| {
            applied = false;
            let Some(mut cur) = store.stm_get(stm, key)? else {
                return Ok(());
            };
            if !crm_transition_allowed(cur.state, state) {
                return Ok(());
            }
            cur.state = state;
            if state.is_error() {
                cur.errors = errors.clone();
                cur.delete_prepare = false;
            } else if state == TrackedState::Ready {
                cur.errors.clear();
            }
            store.stm_put(stm, &cur)?;
            applied = true;
            Ok(())
        })
        .await?;
        if applied {
            self.publish_cluster_snapshot(key, state, &status_msgs, &errors);
        }
        Ok(())
    }

    /// Release a reservation when the last AppInst of the reserving org
    /// leaves the cluster. `reserved_by` stays set iff some
    /// AppInst of that org occupies the cluster.
    pub(crate) fn release_reservation_if_idle(
        &self,
        stm: &mut Stm<'_>,
        cluster_key: &ClusterKey,
    ) -> ApiResult<()> {
        let Some(mut cluster) = self.c.stores.cluster_inst.stm_get(stm, cluster_key)? else {
            return Ok(());
        };
        if !cluster.reservable || cluster.reserved_by.is_empty() {
            return Ok(());
        }
        let refs = self
            .c
            .stores
            .cluster_refs
            .stm_get(stm, cluster_key)?
            .unwrap_or_else(|| ClusterRefs::new(cluster_key.clone()));
        let still_used = refs
            .apps
            .iter()
            .any(|inst| inst.organization == cluster.reserved_by);
        if !still_used {
            cluster.reserved_by = String::new();
            cluster.reservation_ended_at = epoch_secs();
            self.c.stores.cluster_inst.stm_put(stm, &cluster)?;
        }
        Ok(())
    }

    pub fn show_cluster_insts(&self, filter: impl Fn(&ClusterInst) -> bool) -> Vec<ClusterInst> {
        let mut out = Vec::new();
        self.c
            .caches
            .cluster_inst
            .show(filter, |c| out.push(c.clone()));
        out
    }
}

/// Which site-reported transitions the controller accepts. Anything
/// else is a stale or out-of-order report and is dropped.
pub(crate) fn crm_transition_allowed(cur: TrackedState, next: TrackedState) -> bool {
    use TrackedState::*;
    match next {
        Creating => matches!(cur, CreateRequested | Creating),
        Updating => matches!(cur, UpdateRequested | Updating),
        Deleting => matches!(cur, DeleteRequested | Deleting),
        Ready => matches!(
            cur,
            CreateRequested | Creating | UpdateRequested | Updating | Ready
        ),
        CreateError => matches!(cur, CreateRequested | Creating),
        UpdateError => matches!(cur, UpdateRequested | Updating),
        DeleteError => matches!(cur, DeleteRequested | Deleting),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table() {
        use TrackedState::*;
        assert!(crm_transition_allowed(CreateRequested, Creating));
        assert!(crm_transition_allowed(Creating, Ready));
        assert!(crm_transition_allowed(Creating, CreateError));
        assert!(crm_transition_allowed(DeleteRequested, Deleting));
        assert!(crm_transition_allowed(Deleting, DeleteError));
        // Stale reports are dropped.
        assert!(!crm_transition_allowed(Ready, Creating));
        assert!(!crm_transition_allowed(DeleteRequested, Ready));
        assert!(!crm_transition_allowed(Ready, DeleteError));
    }
}
