//! App API: create, update, delete, policy attachment, trust checks.

use edgegrid_kv::Stm;
use edgegrid_model::dnslabel::dns_sanitize;
use edgegrid_model::{
    app_fields, epoch_secs, new_obj_id, parse_access_ports, redact_secret_vars,
    validate_security_rules, validate_skip_hc_ports, App, AppInstRefs, AppKey, DelOpt,
    DeploymentType, FieldMap, KubernetesResources, Liveness, NodeResources, ObjKey, PolicyKey,
    SecurityRule, TrustPolicy, APP_COMPATIBILITY_VERSION,
};
use tracing::{info, warn};

use crate::controller::Controller;
use crate::error::{ApiError, ApiResult};
use crate::refs::get_live;

impl Controller {
    /// Configure and validate an App. Common code for create and update.
    fn configure_app(&self, stm: &mut Stm<'_>, app: &mut App, revision: &str) -> ApiResult<()> {
        let ports = parse_access_ports(&app.access_ports)?;
        if !app.deployment.deploys_to_kubernetes() {
            let http_ports: Vec<u16> = ports
                .iter()
                .filter(|p| p.proto == edgegrid_model::LProto::Http)
                .map(|p| p.internal_port)
                .collect();
            if !http_ports.is_empty() {
                return Err(ApiError::invalid(format!(
                    "http ports {http_ports:?} not allowed for {} deployment",
                    app.deployment
                )));
            }
        }
        validate_skip_hc_ports(&app.access_ports, &app.skip_hc_ports)?;
        validate_security_rules(&app.required_outbound_connections)?;

        if app.image_path.is_empty() {
            // Derive from the region registry for container deployments.
            match app.deployment {
                DeploymentType::Docker | DeploymentType::Kubernetes | DeploymentType::Helm => {
                    let registry = self.settings().registry_fqdn;
                    if registry.is_empty() {
                        return Err(ApiError::invalid(
                            "no image path specified and no default registry to fall back upon",
                        ));
                    }
                    app.image_path = format!(
                        "{}/{}/images/{}:{}",
                        registry,
                        dns_sanitize(&app.key.organization),
                        dns_sanitize(&app.key.name),
                        dns_sanitize(&app.key.version),
                    );
                }
                DeploymentType::Vm => {
                    return Err(ApiError::invalid("image path required for VM deployments"));
                }
            }
        }
        for prefix in ["http://", "https://"] {
            if app.deployment != DeploymentType::Vm {
                if let Some(stripped) = app.image_path.strip_prefix(prefix) {
                    app.image_path = stripped.to_string();
                }
            }
        }

        self.resolve_app_resources(stm, app)?;
        self.validate_app_policies(stm, app)?;
        self.validate_app_alert_policies(stm, app)?;
        app.revision = revision.to_string();
        Ok(())
    }

    /// Resolve the flavor-or-explicit resource shape. A named flavor
    /// always overrides; the explicit structs are the internal source of
    /// truth.
    fn resolve_app_resources(&self, stm: &mut Stm<'_>, app: &mut App) -> ApiResult<()> {
        if app.default_flavor.is_set() {
            let flavor = get_live(&self.c.stores.flavor, stm, &app.default_flavor)?;
            if app.deployment.deploys_to_kubernetes() {
                let kr = app.kubernetes_resources.get_or_insert_with(Default::default);
                kr.set_from_flavor(&flavor);
            } else {
                let nr = app.node_resources.get_or_insert_with(Default::default);
                nr.set_from_flavor(&flavor);
            }
        }
        if app.deployment.deploys_to_kubernetes() {
            if app.node_resources.is_some() {
                return Err(ApiError::invalid(
                    "cannot specify node resources for Kubernetes deployment",
                ));
            }
            let Some(kr) = &app.kubernetes_resources else {
                return Err(ApiError::invalid("missing flavor or Kubernetes resources"));
            };
            kr.validate()?;
        } else {
            if app.kubernetes_resources.is_some() {
                return Err(ApiError::invalid(format!(
                    "cannot specify Kubernetes resources for {} deployment",
                    app.deployment
                )));
            }
            let Some(nr) = &app.node_resources else {
                return Err(ApiError::invalid("missing flavor or node resources"));
            };
            nr.validate()?;
        }
        Ok(())
    }

    fn validate_app_policies(&self, stm: &mut Stm<'_>, app: &App) -> ApiResult<()> {
        for name in &app.auto_prov_policies {
            let key = PolicyKey::new(&app.key.organization, name);
            get_live(&self.c.stores.auto_prov_policy, stm, &key)?;
        }
        if !app.auto_prov_policies.is_empty() && !app.has_resources() {
            return Err(ApiError::invalid(
                "for auto-provisioning the App must have desired resources specified",
            ));
        }
        Ok(())
    }

    fn validate_app_alert_policies(&self, stm: &mut Stm<'_>, app: &App) -> ApiResult<()> {
        for name in &app.alert_policies {
            let key = PolicyKey::new(&app.key.organization, name);
            get_live(&self.c.stores.alert_policy, stm, &key)?;
        }
        Ok(())
    }

    pub async fn create_app(&self, mut app: App) -> ApiResult<()> {
        app.key.validate()?;

        let saved_secrets = !app.secret_env_vars.is_empty();
        if saved_secrets {
            self.c
                .secrets
                .save_app_secret_vars(&self.c.region, &app.key, &app.secret_env_vars)
                .map_err(ApiError::Internal)?;
            app.secret_env_vars = redact_secret_vars(&app.secret_env_vars);
        }

        let store = self.c.stores.app.clone();
        let refs_store = self.c.stores.app_inst_refs.clone();
        let result = self
            .stm(|stm| {
                if store.stm_has(stm, &app.key) {
                    return Err(app.key.exists_error().into());
                }
                let mut cfg = app.clone();
                let revision = cfg.revision.clone();
                self.configure_app(stm, &mut cfg, &revision)?;
                cfg.obj_id = new_obj_id();
                cfg.global_id = format!(
                    "{}-{}-{}",
                    dns_sanitize(&cfg.key.organization),
                    dns_sanitize(&cfg.key.name),
                    dns_sanitize(&cfg.key.version),
                );
                cfg.compatibility_version = APP_COMPATIBILITY_VERSION;
                cfg.created_at = epoch_secs();
                store.stm_put(stm, &cfg)?;
                refs_store.stm_put(stm, &AppInstRefs::new(cfg.key.clone()))?;
                Ok(())
            })
            .await;

        if let Err(err) = result {
            if saved_secrets {
                if let Err(e) = self.c.secrets.delete_app_secret_vars(&self.c.region, &app.key) {
                    warn!(app = %app.key, error = %e, "failed to undo save of app secret vars");
                }
            }
            return Err(err);
        }
        info!(app = %app.key, "app created");
        Ok(())
    }

    pub async fn update_app(&self, mut update: App, fmap: FieldMap) -> ApiResult<()> {
        update.key.validate()?;
        let bad = fmap.disallowed(App::UPDATABLE_FIELDS);
        if !bad.is_empty() {
            return Err(ApiError::invalid(format!(
                "fields not updatable: {}",
                bad.join(", ")
            )));
        }

        if fmap.has_or_has_child(app_fields::SECRET_ENV_VARS) {
            self.c
                .secrets
                .update_app_secret_vars(&self.c.region, &update.key, &update.secret_env_vars)
                .map_err(ApiError::Internal)?;
            update.secret_env_vars = redact_secret_vars(&update.secret_env_vars);
        }

        let store = self.c.stores.app.clone();
        let refs_store = self.c.stores.app_inst_refs.clone();
        self.stm(|stm| {
            let mut cur = store
                .stm_get(stm, &update.key)?
                .ok_or_else(|| update.key.not_found_error())?;
            if cur.delete_prepare {
                return Err(update.key.being_deleted_error().into());
            }
            let refs = refs_store
                .stm_get(stm, &update.key)?
                .unwrap_or_else(|| AppInstRefs::new(update.key.clone()));
            let insts_exist = !refs.insts.is_empty();
            if insts_exist {
                for field in App::IN_USE_IMMUTABLE_FIELDS {
                    if fmap.has_or_has_child(field) {
                        return Err(ApiError::invalid(format!(
                            "cannot update {field} when AppInst exists"
                        )));
                    }
                }
            }

            let trusted_cleared = fmap.has(app_fields::TRUSTED) && !update.trusted;
            let outbound_changed =
                fmap.has_or_has_child(app_fields::REQUIRED_OUTBOUND_CONNECTIONS);
            cur.copy_in_fields(&update, &fmap);

            if insts_exist && (trusted_cleared || outbound_changed) {
                self.verify_trust_for_app_insts(stm, &cur, &refs).map_err(|e| {
                    if trusted_cleared {
                        ApiError::invalid(
                            "cannot set app to untrusted which has an instance on a trusted cloudlet",
                        )
                    } else {
                        e
                    }
                })?;
            }
            if trusted_cleared {
                if let Some(tpe) = self.trust_policy_exception_for_app(&cur.key) {
                    return Err(ApiError::Conflict(format!(
                        "Application in use by Trust Policy Exception {tpe}"
                    )));
                }
            }

            let revision = if update.revision.is_empty() {
                epoch_secs().to_string()
            } else {
                update.revision.clone()
            };
            self.configure_app(stm, &mut cur, &revision)?;
            cur.updated_at = epoch_secs();
            store.stm_put(stm, &cur)?;
            Ok(())
        })
        .await?;
        info!(app = %update.key, "app updated");
        Ok(())
    }

    /// Re-verify the app's outbound requirements against the trust
    /// policy of every cloudlet it has instances on.
    fn verify_trust_for_app_insts(
        &self,
        stm: &mut Stm<'_>,
        app: &App,
        refs: &AppInstRefs,
    ) -> ApiResult<()> {
        for inst_key in &refs.insts {
            let Some(inst) = self.c.stores.app_inst.stm_get(stm, inst_key)? else {
                continue;
            };
            let Some(cloudlet) = self.c.stores.cloudlet.stm_get(stm, &inst.cloudlet_key)? else {
                continue;
            };
            if cloudlet.trust_policy.is_empty() {
                continue;
            }
            let policy_key =
                PolicyKey::new(&cloudlet.key.organization, &cloudlet.trust_policy);
            let Some(policy) = self.c.stores.trust_policy.stm_get(stm, &policy_key)? else {
                continue;
            };
            self.check_app_trust_compat(app, &policy, &cloudlet.zone_key())?;
        }
        Ok(())
    }

    /// A trusted App's required outbound set must fit within the policy
    /// rules plus any exception granted to this app in the zone.
    pub(crate) fn check_app_trust_compat(
        &self,
        app: &App,
        policy: &TrustPolicy,
        zone_key: &edgegrid_model::ZoneKey,
    ) -> ApiResult<()> {
        if !app.trusted {
            return Err(ApiError::invalid(format!(
                "non trusted app {} not compatible with trust policy {}",
                app.key, policy.key
            )));
        }
        let mut allowed: Vec<SecurityRule> = policy.outbound_security_rules.clone();
        if zone_key.is_set() {
            self.c.caches.trust_policy_exception.show(
                |e| e.app_key == app.key && e.zone_key == *zone_key,
                |e| allowed.extend(e.outbound_security_rules.iter().cloned()),
            );
        }
        for required in &app.required_outbound_connections {
            let mut matched = false;
            for rule in &allowed {
                if rule.covers(required)? {
                    matched = true;
                    break;
                }
            }
            if !matched {
                return Err(ApiError::invalid(format!(
                    "No outbound rule in policy or exception to match required connection \
                     {}:{}:{}-{} for App {}",
                    required.protocol,
                    required.remote_cidr,
                    required.port_range_min,
                    required.port_range_max,
                    app.key
                )));
            }
        }
        Ok(())
    }

    pub async fn delete_app(&self, key: &AppKey) -> ApiResult<()> {
        let store = self.c.stores.app.clone();
        let refs_store = self.c.stores.app_inst_refs.clone();
        let inst_store = self.c.stores.app_inst.clone();

        // Mark delete-prepare, collecting auto-deletable instances and
        // refusing on any static one.
        let mut dyn_insts: Vec<edgegrid_model::AppInstKey> = Vec::new();
        self.stm(|stm| {
            dyn_insts.clear();
            let mut cur = store
                .stm_get(stm, key)?
                .ok_or_else(|| key.not_found_error())?;
            if cur.delete_prepare {
                return Err(key.being_deleted_error().into());
            }
            let refs = refs_store
                .stm_get(stm, key)?
                .unwrap_or_else(|| AppInstRefs::new(key.clone()));
            for inst_key in &refs.insts {
                let Some(inst) = inst_store.stm_get(stm, inst_key)? else {
                    continue;
                };
                let auto_ok = inst.liveness == Liveness::Dynamic
                    || inst.liveness == Liveness::Autoprov
                    || cur.del_opt == DelOpt::AutoDelete;
                if auto_ok {
                    dyn_insts.push(inst_key.clone());
                } else {
                    return Err(ApiError::Conflict(format!(
                        "Application in use by static AppInst {inst_key}"
                    )));
                }
            }
            cur.delete_prepare = true;
            store.stm_put(stm, &cur)?;
            Ok(())
        })
        .await?;

        let result = self.delete_app_finish(key, dyn_insts).await;
        if result.is_err() {
            self.clear_delete_prepare::<App>(key).await;
        }
        result
    }

    async fn delete_app_finish(
        &self,
        key: &AppKey,
        dyn_insts: Vec<edgegrid_model::AppInstKey>,
    ) -> ApiResult<()> {
        if let Some(tpe) = self.trust_policy_exception_for_app(key) {
            return Err(ApiError::Conflict(format!(
                "Application in use by Trust Policy Exception {tpe}"
            )));
        }

        // Auto-delete dynamic instances; failures surface as our error.
        for inst_key in dyn_insts {
            self.delete_app_inst(&inst_key, |_msg| {}).await?;
        }

        let store = self.c.stores.app.clone();
        let refs_store = self.c.stores.app_inst_refs.clone();
        self.stm(|stm| {
            if store.stm_get(stm, key)?.is_none() {
                // Already deleted.
                return Ok(());
            }
            store.stm_del(stm, key);
            refs_store.stm_del(stm, key);
            Ok(())
        })
        .await?;

        if let Err(e) = self.c.secrets.delete_app_secret_vars(&self.c.region, key) {
            warn!(app = %key, error = %e, "failed to delete app secret vars");
        }
        info!(app = %key, "app deleted");
        Ok(())
    }

    pub fn show_apps(&self, filter: impl Fn(&App) -> bool) -> Vec<App> {
        let mut out = Vec::new();
        self.c.caches.app.show(filter, |a| out.push(a.clone()));
        out
    }

    /// Find an App by its object id. Returns None rather than an error
    /// when absent.
    pub fn get_app_by_id(&self, id: &str) -> Option<App> {
        let mut found = None;
        self.c.caches.app.show(
            |a| a.obj_id == id,
            |a| {
                if found.is_none() {
                    found = Some(a.clone());
                }
            },
        );
        found
    }

    pub async fn add_app_auto_prov_policy(&self, key: &AppKey, policy: &str) -> ApiResult<()> {
        let store = self.c.stores.app.clone();
        let policy = policy.to_string();
        self.stm(|stm| {
            let mut cur = store
                .stm_get(stm, key)?
                .ok_or_else(|| key.not_found_error())?;
            if cur.auto_prov_policies.iter().any(|p| *p == policy) {
                return Err(ApiError::invalid(format!(
                    "AutoProvPolicy {policy} already on App"
                )));
            }
            cur.auto_prov_policies.push(policy.clone());
            self.validate_app_policies(stm, &cur)?;
            store.stm_put(stm, &cur)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn remove_app_auto_prov_policy(&self, key: &AppKey, policy: &str) -> ApiResult<()> {
        let store = self.c.stores.app.clone();
        self.stm(|stm| {
            let mut cur = store
                .stm_get(stm, key)?
                .ok_or_else(|| key.not_found_error())?;
            let before = cur.auto_prov_policies.len();
            cur.auto_prov_policies.retain(|p| p != policy);
            if cur.auto_prov_policies.len() == before {
                return Ok(());
            }
            store.stm_put(stm, &cur)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn add_app_alert_policy(&self, key: &AppKey, policy: &str) -> ApiResult<()> {
        let store = self.c.stores.app.clone();
        let policy = policy.to_string();
        self.stm(|stm| {
            let mut cur = store
                .stm_get(stm, key)?
                .ok_or_else(|| key.not_found_error())?;
            if cur.alert_policies.iter().any(|p| *p == policy) {
                return Err(ApiError::invalid(format!(
                    "alert {policy} already monitored on App"
                )));
            }
            cur.alert_policies.push(policy.clone());
            self.validate_app_alert_policies(stm, &cur)?;
            store.stm_put(stm, &cur)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn remove_app_alert_policy(&self, key: &AppKey, policy: &str) -> ApiResult<()> {
        let store = self.c.stores.app.clone();
        self.stm(|stm| {
            let mut cur = store
                .stm_get(stm, key)?
                .ok_or_else(|| key.not_found_error())?;
            let before = cur.alert_policies.len();
            cur.alert_policies.retain(|p| p != policy);
            if cur.alert_policies.len() == before {
                return Err(PolicyKey::new(&key.organization, policy)
                    .not_found_error()
                    .into());
            }
            store.stm_put(stm, &cur)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// The resolved resource demand an instance of this app needs.
    pub(crate) fn app_resources(
        app: &App,
    ) -> (Option<KubernetesResources>, Option<NodeResources>) {
        (app.kubernetes_resources.clone(), app.node_resources.clone())
    }
}
