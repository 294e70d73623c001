//! AppInst API: placement, creation, deletion, and site-reported state.
//!
//! Create picks a cloudlet and cluster using the cache-backed candidate
//! search, then re-validates and writes everything inside one STM so a
//! concurrent change retries the whole decision's checks. Deletion and
//! CRM error handling follow the tracked state machine.

use std::time::Duration;

use edgegrid_kv::Stm;
use edgegrid_lifecycle::{channel_for, wait_for_state, CrmOp, InfoSnapshot, WaitSpec};
use edgegrid_model::dnslabel::dns_sanitize;
use edgegrid_model::{
    epoch_secs, new_obj_id, parse_access_ports, App, AppInst, AppInstKey, AppInstRefs,
    CloudletRefs, ClusterKey, ClusterRefs, CrmOverride, DeploymentType, FieldMap, Liveness,
    NodePool, Obj, ObjKey, PolicyKey, TrackedState,
};
use edgegrid_placement::{
    build_reservable_cluster_name, place, verify_target_cluster, CloudletCandidate,
    ClusterAction, ClusterDemand, Placement, PlacementError, PLATFORM_ORG,
};
use edgegrid_res::{cluster_resource_usage, CloudletResCalc};
use tracing::{info, warn};

use crate::controller::{Controller, CtrlSource};
use crate::error::{ApiError, ApiResult};
use crate::refs::get_live;

impl Controller {
    /// Resolve the instance's resource shape from the App unless the
    /// request overrides it.
    fn resolve_inst_resources(&self, inst: &mut AppInst, app: &App) {
        if inst.kubernetes_resources.is_none() && inst.node_resources.is_none() {
            let (kr, nr) = Self::app_resources(app);
            inst.kubernetes_resources = kr;
            inst.node_resources = nr;
        }
        if !inst.flavor.is_set() {
            inst.flavor = app.default_flavor.clone();
        }
    }

    fn cluster_demand_for(&self, inst: &AppInst, app: &App) -> ClusterDemand {
        let demand = inst.resource_demand();
        let pool = match &inst.kubernetes_resources {
            Some(kr) => NodePool {
                name: "workers".to_string(),
                num_nodes: kr.num_nodes.max(1),
                node_resources: kr.node_resources.clone(),
                scalable: true,
            },
            None => NodePool {
                name: "workers".to_string(),
                num_nodes: 1,
                node_resources: inst.node_resources.clone().unwrap_or_default(),
                scalable: true,
            },
        };
        ClusterDemand {
            org: inst.key.organization.clone(),
            deployment: app.deployment,
            demand,
            new_cluster_pool: pool,
            min_kubernetes_version: inst
                .kubernetes_resources
                .as_ref()
                .map(|kr| kr.min_kubernetes_version.clone())
                .unwrap_or_default(),
        }
    }

    /// Build the candidate list from the caches: cloudlets in scope,
    /// their health, score, and the clusters the requester could use.
    /// Returns the candidates plus the reasons for pre-filtered sites.
    fn gather_candidates(
        &self,
        inst: &AppInst,
        app: &App,
    ) -> (Vec<CloudletCandidate>, Vec<String>) {
        let caches = &self.c.caches;
        let cloudlet_keys = if inst.zone_key.is_set() {
            self.cloudlets_in_zone(&inst.zone_key)
        } else {
            caches.cloudlet.keys_filtered(|_| true)
        };

        let mut candidates = Vec::new();
        let mut rejections = Vec::new();
        for key in cloudlet_keys {
            let Some(cloudlet) = caches.cloudlet.get(&key) else {
                continue;
            };
            if cloudlet.delete_prepare {
                rejections.push(format!("{key}: site is being deleted"));
                continue;
            }
            // Trust policy gates the site entirely.
            if !cloudlet.trust_policy.is_empty() {
                let policy_key = PolicyKey::new(&key.organization, &cloudlet.trust_policy);
                match caches.trust_policy.get(&policy_key) {
                    Some(policy) => {
                        if let Err(e) =
                            self.check_app_trust_compat(app, &policy, &cloudlet.zone_key())
                        {
                            rejections.push(format!("{key}: {e}"));
                            continue;
                        }
                    }
                    None => {
                        rejections.push(format!("{key}: trust policy missing"));
                        continue;
                    }
                }
            }
            let online = caches
                .cloudlet_info
                .get(&key)
                .map(|info| info.state == edgegrid_model::CloudletState::Ready)
                .unwrap_or(false);
            let score = {
                let mut src = CtrlSource::cache(&self.c);
                CloudletResCalc::new(&mut src, &key, self.settings())
                    .cloudlet_score()
                    .unwrap_or(0)
            };
            let org = inst.key.organization.clone();
            let clusters = caches
                .cluster_inst
                .keys_filtered(|c| {
                    c.cloudlet_key == key
                        && (c.reservable || c.multi_tenant || c.key.organization == org)
                })
                .into_iter()
                .filter_map(|ck| caches.cluster_inst.get(&ck))
                .map(|cluster| {
                    let insts: Vec<AppInst> = caches
                        .cluster_refs
                        .get(&cluster.key)
                        .map(|refs| {
                            refs.apps
                                .iter()
                                .filter_map(|ik| caches.app_inst.get(ik))
                                .collect()
                        })
                        .unwrap_or_default();
                    let usage = cluster_resource_usage(&cluster, &insts);
                    (cluster, usage)
                })
                .collect();
            candidates.push(CloudletCandidate {
                cloudlet,
                online,
                score,
                clusters,
            });
        }
        (candidates, rejections)
    }

    fn decide_placement(&self, inst: &AppInst, app: &App) -> ApiResult<Placement> {
        let demand = self.cluster_demand_for(inst, app);

        // Rule (a): the user named a cluster.
        if !inst.cluster_key.name.is_empty() {
            let cluster = self
                .c
                .caches
                .cluster_inst
                .get(&inst.cluster_key)
                .ok_or_else(|| inst.cluster_key.not_found_error())?;
            let insts: Vec<AppInst> = self
                .c
                .caches
                .cluster_refs
                .get(&cluster.key)
                .map(|refs| {
                    refs.apps
                        .iter()
                        .filter_map(|ik| self.c.caches.app_inst.get(ik))
                        .collect()
                })
                .unwrap_or_default();
            let usage = cluster_resource_usage(&cluster, &insts);
            verify_target_cluster(&cluster, &usage, &demand).map_err(ApiError::invalid)?;
            return Ok(Placement {
                cloudlet_key: cluster.cloudlet_key.clone(),
                action: ClusterAction::UseExisting {
                    key: cluster.key.clone(),
                },
                score: 0,
            });
        }

        let (candidates, mut rejections) = self.gather_candidates(inst, app);
        match place(&demand, &candidates) {
            Ok(placement) => Ok(placement),
            Err(PlacementError::NoCandidates) if !rejections.is_empty() => {
                rejections.sort();
                Err(PlacementError::NoFit(rejections.join("; ")).into())
            }
            Err(PlacementError::NoFit(msg)) if !rejections.is_empty() => {
                rejections.push(msg);
                rejections.sort();
                Err(PlacementError::NoFit(rejections.join("; ")).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn create_app_inst(
        &self,
        mut inst: AppInst,
        mut on_status: impl FnMut(&str),
    ) -> ApiResult<()> {
        inst.key.validate()?;
        inst.app_key.validate()?;
        if inst.liveness == Liveness::Unknown {
            inst.liveness = Liveness::Static;
        }
        let skip_crm = inst.crm_override.skips_crm();

        // Candidate search runs on the caches; everything is re-checked
        // transactionally below.
        let app = self
            .c
            .caches
            .app
            .get(&inst.app_key)
            .ok_or_else(|| inst.app_key.not_found_error())?;
        if app.delete_prepare {
            return Err(inst.app_key.being_deleted_error().into());
        }
        self.resolve_inst_resources(&mut inst, &app);
        let placement = self.decide_placement(&inst, &app)?;
        info!(
            inst = %inst.key,
            cloudlet = %placement.cloudlet_key,
            action = ?placement.action,
            "placement selected"
        );

        let stores = &self.c.stores;
        let mut written: Option<AppInst> = None;
        self.stm(|stm| {
            written = None;
            if stores.app_inst.stm_has(stm, &inst.key) {
                return Err(inst.key.exists_error().into());
            }
            let app = get_live(&stores.app, stm, &inst.app_key)?;
            let cloudlet = get_live(&stores.cloudlet, stm, &placement.cloudlet_key)?;
            if !cloudlet.accepts_new_instances() {
                return Err(ApiError::Conflict(format!(
                    "cloudlet {} is under maintenance",
                    cloudlet.key
                )));
            }
            if !cloudlet.trust_policy.is_empty() {
                let policy_key =
                    PolicyKey::new(&cloudlet.key.organization, &cloudlet.trust_policy);
                let policy = get_live(&stores.trust_policy, stm, &policy_key)?;
                self.check_app_trust_compat(&app, &policy, &cloudlet.zone_key())?;
            }

            let mut obj = inst.clone();
            obj.cloudlet_key = cloudlet.key.clone();
            obj.zone_key = cloudlet.zone_key();
            obj.state = if skip_crm {
                TrackedState::Ready
            } else {
                TrackedState::CreateRequested
            };

            match &placement.action {
                ClusterAction::UseExisting { key } => {
                    self.claim_cluster(stm, key, &mut obj, None)?;
                }
                ClusterAction::ScaleUp {
                    key,
                    pool_name,
                    add_nodes,
                } => {
                    self.claim_cluster(stm, key, &mut obj, Some((pool_name, *add_nodes)))?;
                }
                ClusterAction::CreateNewAuto => {
                    let mut crefs = stores
                        .cloudlet_refs
                        .stm_get(stm, &cloudlet.key)?
                        .unwrap_or_else(|| CloudletRefs::new(cloudlet.key.clone()));
                    let id = crefs.alloc_auto_cluster_id().ok_or_else(|| {
                        ApiError::Conflict(format!(
                            "no free reservable autocluster ids on cloudlet {}",
                            cloudlet.key
                        ))
                    })?;
                    stores.cloudlet_refs.stm_put(stm, &crefs)?;

                    let demand = self.cluster_demand_for(&obj, &app);
                    let name = build_reservable_cluster_name(id, &cloudlet.key);
                    let mut cluster = edgegrid_model::ClusterInst {
                        key: ClusterKey::new(PLATFORM_ORG, &name),
                        cloudlet_key: cloudlet.key.clone(),
                        deployment: if app.deployment == DeploymentType::Helm {
                            DeploymentType::Kubernetes
                        } else {
                            app.deployment
                        },
                        node_pools: vec![demand.new_cluster_pool.clone()],
                        reservable: true,
                        auto: true,
                        auto_cluster_id: Some(id),
                        reserved_by: obj.key.organization.clone(),
                        state: if skip_crm {
                            TrackedState::Ready
                        } else {
                            TrackedState::CreateRequested
                        },
                        crm_override: obj.crm_override,
                        ..Default::default()
                    };
                    self.write_new_cluster(stm, &mut cluster)?;

                    let mut refs = stores
                        .cluster_refs
                        .stm_get(stm, &cluster.key)?
                        .unwrap_or_else(|| ClusterRefs::new(cluster.key.clone()));
                    refs.apps.insert(obj.key.clone());
                    stores.cluster_refs.stm_put(stm, &refs)?;

                    obj.cluster_key = cluster.key.clone();
                    obj.auto_cluster = true;
                }
                ClusterAction::VmApp => {
                    let node_res = obj.node_resources.clone().unwrap_or_default();
                    let spec = {
                        let mut src = CtrlSource::stm(&self.c, stm);
                        let mut calc =
                            CloudletResCalc::new(&mut src, &cloudlet.key, self.settings());
                        calc.cloudlet_fits_vm_app(&node_res)?
                    };
                    let nr = obj.node_resources.get_or_insert_with(Default::default);
                    nr.infra_node_flavor = spec.flavor_name;
                    nr.external_volume_gb = spec.external_volume_gb;

                    let mut crefs = stores
                        .cloudlet_refs
                        .stm_get(stm, &cloudlet.key)?
                        .unwrap_or_else(|| CloudletRefs::new(cloudlet.key.clone()));
                    crefs.vm_app_insts.insert(obj.key.clone());
                    if obj.dedicated_ip {
                        crefs.used_dynamic_ips += 1;
                    }
                    stores.cloudlet_refs.stm_put(stm, &crefs)?;
                }
            }

            let mut ports = parse_access_ports(&app.access_ports)?;
            for port in &mut ports {
                port.public_port = port.internal_port;
            }
            obj.mapped_ports = ports;
            obj.dns_label = self
                .c
                .dns_labels
                .alloc(stm, &cloudlet.key, &obj.key.name)?;
            let site = dns_sanitize(&cloudlet.key.name);
            obj.uri = format!(
                "{}.{}.{}",
                obj.dns_label,
                site,
                self.settings().app_dns_root
            );
            obj.unique_id = format!("{}-{}", obj.dns_label, site);
            obj.obj_id = new_obj_id();
            obj.created_at = epoch_secs();

            let mut arefs = stores
                .app_inst_refs
                .stm_get(stm, &obj.app_key)?
                .unwrap_or_else(|| AppInstRefs::new(obj.app_key.clone()));
            arefs.insts.insert(obj.key.clone());
            stores.app_inst_refs.stm_put(stm, &arefs)?;

            stores.app_inst.stm_put(stm, &obj)?;
            written = Some(obj);
            Ok(())
        })
        .await?;

        let obj = written
            .ok_or_else(|| ApiError::Internal("create produced no object".to_string()))?;
        if skip_crm {
            info!(inst = %obj.key, "appinst created (crm skipped)");
            return Ok(());
        }

        // Dispatch cluster work first so the CRM sees the dependency in
        // order, then the instance itself.
        match &placement.action {
            ClusterAction::CreateNewAuto => {
                if let Some(cluster) = self.c.stores.cluster_inst.get(&obj.cluster_key)? {
                    self.c.crm.apply_cluster_inst(&cluster, CrmOp::Create);
                }
            }
            ClusterAction::ScaleUp { .. } => {
                if let Some(cluster) = self.c.stores.cluster_inst.get(&obj.cluster_key)? {
                    self.c.crm.apply_cluster_inst(&cluster, CrmOp::Update);
                }
            }
            _ => {}
        }
        self.c.crm.apply_app_inst(&obj, &app, CrmOp::Create);

        let result = self
            .wait_app_inst_state(&obj.key, TrackedState::Ready, &mut on_status)
            .await;
        match result {
            Ok(()) => {
                info!(inst = %obj.key, "appinst created");
                Ok(())
            }
            Err(err) => {
                if obj.crm_override.ignores_crm_errors() {
                    self.force_app_inst_state(&obj.key, TrackedState::Ready).await;
                    return Ok(());
                }
                if let ApiError::Infra(edgegrid_lifecycle::LifecycleError::Failed(_)) = &err {
                    // Undo in reverse; never let the undo mask the error.
                    if let Err(undo) = self.app_inst_delete_finish(&obj.key).await {
                        warn!(inst = %obj.key, error = %undo, "undo of failed appinst create failed");
                    } else if obj.auto_cluster {
                        if let Err(undo) = self.cluster_delete_finish(&obj.cluster_key).await {
                            warn!(cluster = %obj.cluster_key, error = %undo, "undo of autocluster failed");
                        }
                    }
                }
                Err(err)
            }
        }
    }

    /// Attach the instance to an existing cluster inside the create
    /// transaction: reservation claim, optional scale-up, refs entry.
    fn claim_cluster(
        &self,
        stm: &mut Stm<'_>,
        key: &ClusterKey,
        obj: &mut AppInst,
        scale: Option<(&String, u32)>,
    ) -> ApiResult<()> {
        let stores = &self.c.stores;
        let mut cluster = get_live(&stores.cluster_inst, stm, key)?;
        if cluster.reservable {
            if cluster.reserved_by.is_empty() {
                cluster.reserved_by = obj.key.organization.clone();
            } else if cluster.reserved_by != obj.key.organization {
                return Err(ApiError::Conflict(format!(
                    "cluster {key} is reserved by another organization"
                )));
            }
        }
        if let Some((pool_name, add_nodes)) = scale {
            let pool = cluster
                .node_pools
                .iter_mut()
                .find(|p| p.name == *pool_name)
                .ok_or_else(|| {
                    ApiError::Internal(format!("scale-up pool {pool_name} missing on {key}"))
                })?;
            pool.num_nodes += add_nodes;
            let added = {
                let per = &pool.node_resources;
                edgegrid_res::ResValMap::from_totals(
                    per.vcpus * u64::from(add_nodes),
                    per.ram_mb * u64::from(add_nodes),
                    per.disk_gb * u64::from(add_nodes),
                )
            };
            {
                let mut src = CtrlSource::stm(&self.c, stm);
                let mut calc = CloudletResCalc::new(&mut src, &cluster.cloudlet_key, self.settings());
                calc.cloudlet_fits_reqd_vals(&added)?;
            }
            if !obj.crm_override.skips_crm() {
                cluster.state = TrackedState::UpdateRequested;
            }
        }
        stores.cluster_inst.stm_put(stm, &cluster)?;

        let mut refs = stores
            .cluster_refs
            .stm_get(stm, key)?
            .unwrap_or_else(|| ClusterRefs::new(key.clone()));
        refs.apps.insert(obj.key.clone());
        stores.cluster_refs.stm_put(stm, &refs)?;
        obj.cluster_key = key.clone();
        Ok(())
    }

    pub async fn delete_app_inst(
        &self,
        key: &AppInstKey,
        on_status: impl FnMut(&str),
    ) -> ApiResult<()> {
        self.delete_app_inst_opts(key, CrmOverride::NoOverride, on_status)
            .await
    }

    pub async fn delete_app_inst_opts(
        &self,
        key: &AppInstKey,
        crm_override: CrmOverride,
        mut on_status: impl FnMut(&str),
    ) -> ApiResult<()> {
        let store = self.c.stores.app_inst.clone();
        let skip_crm = crm_override.skips_crm();

        self.stm(|stm| {
            let mut cur = store
                .stm_get(stm, key)?
                .ok_or_else(|| key.not_found_error())?;
            if cur.state.is_transient() && !crm_override.ignores_transient_state() {
                return Err(ApiError::Conflict(format!(
                    "action is already in progress for {} (state {})",
                    cur.key, cur.state
                )));
            }
            cur.state = TrackedState::DeleteRequested;
            cur.crm_override = crm_override;
            store.stm_put(stm, &cur)?;
            Ok(())
        })
        .await?;

        if skip_crm {
            return self.app_inst_delete_finish(key).await;
        }

        let current = store.get(key)?.ok_or_else(|| key.not_found_error())?;
        let app = self.c.caches.app.get(&current.app_key).unwrap_or_default();
        self.c.crm.apply_app_inst(&current, &app, CrmOp::Delete);

        let result = self
            .wait_app_inst_state(key, TrackedState::NotPresent, &mut on_status)
            .await;
        match result {
            Ok(()) => {
                info!(inst = %key, "appinst deleted");
                Ok(())
            }
            Err(err) => {
                if crm_override.ignores_crm_errors() {
                    return self.app_inst_delete_finish(key).await;
                }
                Err(err)
            }
        }
    }

    /// Remove the instance record and every reference to it: cluster
    /// refs, the reservation, VM refs and dynamic IPs, app refs,
    /// and the DNS label. Idempotent; the autocluster itself is left for
    /// the idle reaper.
    pub(crate) async fn app_inst_delete_finish(&self, key: &AppInstKey) -> ApiResult<()> {
        let stores = &self.c.stores;
        let labels = self.c.dns_labels.clone();
        self.stm(|stm| {
            let Some(cur) = stores.app_inst.stm_get(stm, key)? else {
                return Ok(());
            };
            if !cur.cluster_key.name.is_empty() {
                if let Some(mut refs) = stores.cluster_refs.stm_get(stm, &cur.cluster_key)? {
                    refs.apps.remove(key);
                    stores.cluster_refs.stm_put(stm, &refs)?;
                }
                self.release_reservation_if_idle(stm, &cur.cluster_key)?;
            }
            if let Some(mut crefs) = stores.cloudlet_refs.stm_get(stm, &cur.cloudlet_key)? {
                if crefs.vm_app_insts.remove(key) {
                    if cur.dedicated_ip {
                        crefs.used_dynamic_ips = crefs.used_dynamic_ips.saturating_sub(1);
                    }
                    stores.cloudlet_refs.stm_put(stm, &crefs)?;
                }
            }
            if let Some(mut arefs) = stores.app_inst_refs.stm_get(stm, &cur.app_key)? {
                arefs.insts.remove(key);
                stores.app_inst_refs.stm_put(stm, &arefs)?;
            }
            if !cur.dns_label.is_empty() {
                labels.release(stm, &cur.cloudlet_key, &cur.dns_label);
            }
            stores.app_inst.stm_del(stm, key);
            Ok(())
        })
        .await?;
        self.c.bus.publish(
            &channel_for(AppInst::TYPE, key),
            &InfoSnapshot {
                state: TrackedState::NotPresent,
                status_msgs: Vec::new(),
                errors: Vec::new(),
            },
        );
        Ok(())
    }

    /// Limited update surface: the CRM override knob, then an optional
    /// re-dispatch to refresh the instance on site.
    pub async fn update_app_inst(
        &self,
        update: AppInst,
        fmap: FieldMap,
        mut on_status: impl FnMut(&str),
    ) -> ApiResult<()> {
        let allowed = ["crm_override"];
        let bad = fmap.disallowed(&allowed);
        if !bad.is_empty() {
            return Err(ApiError::invalid(format!(
                "fields not updatable: {}",
                bad.join(", ")
            )));
        }
        let store = self.c.stores.app_inst.clone();
        let skip_crm = update.crm_override.skips_crm();
        self.stm(|stm| {
            let mut cur = store
                .stm_get(stm, &update.key)?
                .ok_or_else(|| update.key.not_found_error())?;
            if cur.state.is_transient() {
                return Err(ApiError::Conflict(format!(
                    "action is already in progress for {} (state {})",
                    cur.key, cur.state
                )));
            }
            if fmap.has("crm_override") {
                cur.crm_override = update.crm_override;
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
        let app = self.c.caches.app.get(&current.app_key).unwrap_or_default();
        self.c.crm.apply_app_inst(&current, &app, CrmOp::Update);
        self.wait_app_inst_state(&update.key, TrackedState::Ready, &mut on_status)
            .await
    }

    async fn wait_app_inst_state(
        &self,
        key: &AppInstKey,
        target: TrackedState,
        on_status: &mut impl FnMut(&str),
    ) -> ApiResult<()> {
        let spec = WaitSpec {
            channel: channel_for(AppInst::TYPE, key),
            object: format!("AppInst {key}"),
            target,
            timeout: Duration::from_secs(self.settings().crm_operation_timeout_secs),
        };
        let me = self.clone();
        let key = key.clone();
        wait_for_state(
            self.c.bus.as_ref(),
            move || me.tracked_snapshot::<AppInst>(&key),
            &spec,
            on_status,
        )
        .await
        .map_err(ApiError::from)
    }

    async fn force_app_inst_state(&self, key: &AppInstKey, state: TrackedState) {
        let store = self.c.stores.app_inst.clone();
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
            warn!(inst = %key, error = %e, "failed to force appinst state");
        }
    }

    /// Site-reported instance state. Store first, then publish.
    pub async fn handle_app_inst_info(
        &self,
        key: &AppInstKey,
        state: TrackedState,
        status_msgs: Vec<String>,
        errors: Vec<String>,
    ) -> ApiResult<()> {
        if state == TrackedState::NotPresent {
            let finishing = {
                let cur = self.c.stores.app_inst.get(key)?;
                matches!(
                    cur.map(|c| c.state),
                    Some(TrackedState::DeleteRequested) | Some(TrackedState::Deleting)
                )
            };
            if finishing {
                return self.app_inst_delete_finish(key).await;
            }
            return Ok(());
        }

        let store = self.c.stores.app_inst.clone();
        let mut applied = false;
        self.stm(|stm| {
            applied = false;
            let Some(mut cur) = store.stm_get(stm, key)? else {
                return Ok(());
            };
            if !crate::cluster_api::crm_transition_allowed(cur.state, state) {
                return Ok(());
            }
            cur.state = state;
            if state.is_error() {
                cur.errors = errors.clone();
            } else if state == TrackedState::Ready {
                cur.errors.clear();
            }
            store.stm_put(stm, &cur)?;
            applied = true;
            Ok(())
        })
        .await?;
        if applied {
            self.c.bus.publish(
                &channel_for(AppInst::TYPE, key),
                &InfoSnapshot {
                    state,
                    status_msgs,
                    errors,
                },
            );
        }
        Ok(())
    }

    pub fn show_app_insts(&self, filter: impl Fn(&AppInst) -> bool) -> Vec<AppInst> {
        let mut out = Vec::new();
        self.c.caches.app_inst.show(filter, |i| out.push(i.clone()));
        out
    }
}
