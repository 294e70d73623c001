//! The controller aggregate.
//!
//! Owns the KV store, the typed stores and caches, the cache sync loop,
//! the progress bus, and the CRM/secret-store connectors. All per-type
//! API handlers are `impl Controller` blocks in their own modules; this
//! file is construction, startup, and the shared helpers they build on.

use std::sync::Arc;
use std::time::Duration;

use edgegrid_kv::{KvStore, Stm};
use edgegrid_lifecycle::{CrmConnector, ProgressBus};
use edgegrid_model::verhash::{check_version, key_shape_hash, UpgradeFunc, VersionCheck, VERSION_HASH_PATH};
use edgegrid_model::{
    AlertPolicy, App, AppInst, AppInstRefs, AutoProvPolicy, AutoScalePolicy, Cloudlet,
    CloudletInfo, CloudletRefs, ClusterInst, ClusterRefs, Flavor, Obj, ResTagTable, Settings,
    TrustPolicy, TrustPolicyException, Zone,
};
use edgegrid_store::{Cache, DnsLabelStore, ObjStore, OptionalStm, Sync};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::secret::SecretStore;

macro_rules! typed_layers {
    ($($field:ident: $ty:ty),+ $(,)?) => {
        /// One typed store per persisted type.
        pub struct Stores {
            $(pub $field: ObjStore<$ty>),+
        }

        /// One cache per persisted type, fed by the sync loop.
        pub struct Caches {
            $(pub $field: Cache<$ty>),+
        }

        impl Stores {
            fn new(kv: &KvStore) -> Self {
                Self {
                    $($field: ObjStore::new(kv.clone())),+
                }
            }
        }

        impl Caches {
            fn new() -> Self {
                Self {
                    $($field: Cache::new()),+
                }
            }

            fn register_all(&self, sync: &Sync) {
                $(sync.register_cache(&self.$field);)+
            }
        }
    };
}

typed_layers! {
    app: App,
    app_inst: AppInst,
    cluster_inst: ClusterInst,
    cloudlet: Cloudlet,
    cloudlet_info: CloudletInfo,
    zone: Zone,
    flavor: Flavor,
    trust_policy: TrustPolicy,
    trust_policy_exception: TrustPolicyException,
    auto_prov_policy: AutoProvPolicy,
    auto_scale_policy: AutoScalePolicy,
    alert_policy: AlertPolicy,
    res_tag_table: ResTagTable,
    cloudlet_refs: CloudletRefs,
    cluster_refs: ClusterRefs,
    app_inst_refs: AppInstRefs,
}

pub(crate) struct CtrlInner {
    pub region: String,
    pub kv: KvStore,
    pub sync: Arc<Sync>,
    pub bus: Arc<dyn ProgressBus>,
    pub crm: Arc<dyn CrmConnector>,
    pub secrets: Arc<dyn SecretStore>,
    pub dns_labels: DnsLabelStore,
    pub settings: RwLock<Settings>,
    pub stores: Stores,
    pub caches: Caches,
}

/// Construction inputs for a controller.
pub struct ControllerOpts {
    pub region: String,
    pub kv: KvStore,
    pub crm: Arc<dyn CrmConnector>,
    pub bus: Arc<dyn ProgressBus>,
    pub secrets: Arc<dyn SecretStore>,
    pub settings: Settings,
    /// Migrations for older stored key shapes.
    pub upgrades: Vec<UpgradeFunc>,
}

/// The regional controller. Cheap to clone; all per-type APIs hang off
/// this handle.
#[derive(Clone)]
pub struct Controller {
    pub(crate) c: Arc<CtrlInner>,
}

impl Controller {
    pub fn new(opts: ControllerOpts) -> ApiResult<Self> {
        check_data_model_version(&opts.kv, &opts.upgrades)?;

        let sync = Sync::new(opts.kv.clone());
        let stores = Stores::new(&opts.kv);
        let caches = Caches::new();
        caches.register_all(&sync);

        Ok(Self {
            c: Arc::new(CtrlInner {
                region: opts.region,
                kv: opts.kv,
                sync,
                bus: opts.bus,
                crm: opts.crm,
                secrets: opts.secrets,
                dns_labels: DnsLabelStore,
                settings: RwLock::new(opts.settings),
                stores,
                caches,
            }),
        })
    }

    /// Start the sync loop and background workers. The returned handles
    /// finish when `shutdown` flips.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = vec![self.c.sync.start(shutdown.clone())];
        handles.push(self.spawn_lease_sweeper(shutdown.clone()));
        handles.push(self.spawn_idle_reaper(shutdown));
        info!(region = %self.c.region, "controller started");
        handles
    }

    /// Expire lapsed CloudletInfo leases so dead sites disappear even if
    /// their notify connection never closed cleanly.
    fn spawn_lease_sweeper(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let kv = self.c.kv.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        match kv.sweep_expired_leases(edgegrid_model::epoch_secs()) {
                            Ok(deleted) if !deleted.is_empty() => {
                                info!(count = deleted.len(), "expired leased records");
                            }
                            Err(e) => warn!(error = %e, "lease sweep failed"),
                            _ => {}
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    pub fn settings(&self) -> Settings {
        self.c.settings.read().clone()
    }

    pub fn update_settings(&self, settings: Settings) {
        *self.c.settings.write() = settings;
    }

    pub(crate) fn max_retries(&self) -> u32 {
        self.c.settings.read().max_stm_retries
    }

    /// Run a transaction and wait until the caches observe the commit.
    pub(crate) async fn stm<F>(&self, f: F) -> ApiResult<u64>
    where
        F: FnMut(&mut Stm) -> ApiResult<()>,
    {
        self.c.sync.apply_stm_wait(self.max_retries(), f).await
    }
}

fn check_data_model_version(kv: &KvStore, upgrades: &[UpgradeFunc]) -> ApiResult<()> {
    let stored = kv.get(VERSION_HASH_PATH).map(|v| v.value);
    match check_version(stored.as_deref(), upgrades).map_err(ApiError::Internal)? {
        VersionCheck::Match => Ok(()),
        VersionCheck::Fresh => {
            kv.put(VERSION_HASH_PATH, &key_shape_hash(), None)?;
            Ok(())
        }
        VersionCheck::UpgradeAvailable(idx) => {
            let upgrade = &upgrades[idx];
            info!(from = %upgrade.from_hash, to = %key_shape_hash(), "migrating data model");
            for (path, val) in kv.list("") {
                if path == VERSION_HASH_PATH {
                    continue;
                }
                match (upgrade.migrate)(&path, &val.value) {
                    Some((new_path, new_val)) => {
                        if new_path != path {
                            kv.delete(&path)?;
                        }
                        kv.put(&new_path, &new_val, None)?;
                    }
                    None => {
                        kv.delete(&path)?;
                    }
                }
            }
            kv.put(VERSION_HASH_PATH, &key_shape_hash(), None)?;
            Ok(())
        }
    }
}

// ── Resource calculator data source ────────────────────────────────

/// [`edgegrid_res::ResDataSource`] over the controller's stores, reading
/// through a live STM or the caches.
pub(crate) struct CtrlSource<'c, 'a, 'b> {
    c: &'c CtrlInner,
    ostm: OptionalStm<'a, 'b>,
}

impl<'c, 'a, 'b> CtrlSource<'c, 'a, 'b> {
    pub fn stm(c: &'c CtrlInner, stm: &'a mut Stm<'b>) -> Self {
        Self {
            c,
            ostm: OptionalStm::stm(stm),
        }
    }

    pub fn cache(c: &'c CtrlInner) -> Self {
        Self {
            c,
            ostm: OptionalStm::cache(),
        }
    }
}

fn dep_err(e: edgegrid_store::StoreError) -> edgegrid_res::ResError {
    edgegrid_res::ResError::Dependency(e.to_string())
}

impl edgegrid_res::ResDataSource for CtrlSource<'_, '_, '_> {
    fn get_cloudlet(
        &mut self,
        key: &edgegrid_model::CloudletKey,
    ) -> edgegrid_res::ResResult<Option<Cloudlet>> {
        self.c
            .stores
            .cloudlet
            .get_via(&mut self.ostm, &self.c.caches.cloudlet, key)
            .map_err(dep_err)
    }

    fn get_cloudlet_info(
        &mut self,
        key: &edgegrid_model::CloudletKey,
    ) -> edgegrid_res::ResResult<Option<CloudletInfo>> {
        self.c
            .stores
            .cloudlet_info
            .get_via(&mut self.ostm, &self.c.caches.cloudlet_info, key)
            .map_err(dep_err)
    }

    fn get_cloudlet_refs(
        &mut self,
        key: &edgegrid_model::CloudletKey,
    ) -> edgegrid_res::ResResult<Option<CloudletRefs>> {
        self.c
            .stores
            .cloudlet_refs
            .get_via(&mut self.ostm, &self.c.caches.cloudlet_refs, key)
            .map_err(dep_err)
    }

    fn get_cluster_inst(
        &mut self,
        key: &edgegrid_model::ClusterKey,
    ) -> edgegrid_res::ResResult<Option<ClusterInst>> {
        self.c
            .stores
            .cluster_inst
            .get_via(&mut self.ostm, &self.c.caches.cluster_inst, key)
            .map_err(dep_err)
    }

    fn get_app_inst(
        &mut self,
        key: &edgegrid_model::AppInstKey,
    ) -> edgegrid_res::ResResult<Option<AppInst>> {
        self.c
            .stores
            .app_inst
            .get_via(&mut self.ostm, &self.c.caches.app_inst, key)
            .map_err(dep_err)
    }

    fn get_res_tag_table(
        &mut self,
        key: &edgegrid_model::ResTagTableKey,
    ) -> edgegrid_res::ResResult<Option<ResTagTable>> {
        self.c
            .stores
            .res_tag_table
            .get_via(&mut self.ostm, &self.c.caches.res_tag_table, key)
            .map_err(dep_err)
    }
}

// ── Cache read accessors ───────────────────────────────────────────

impl Controller {
    pub fn get_app(&self, key: &edgegrid_model::AppKey) -> Option<App> {
        self.c.caches.app.get(key)
    }

    pub fn get_app_inst(&self, key: &edgegrid_model::AppInstKey) -> Option<AppInst> {
        self.c.caches.app_inst.get(key)
    }

    pub fn get_cluster_inst(&self, key: &edgegrid_model::ClusterKey) -> Option<ClusterInst> {
        self.c.caches.cluster_inst.get(key)
    }

    pub fn get_cloudlet(&self, key: &edgegrid_model::CloudletKey) -> Option<Cloudlet> {
        self.c.caches.cloudlet.get(key)
    }

    pub fn get_cloudlet_info(&self, key: &edgegrid_model::CloudletKey) -> Option<CloudletInfo> {
        self.c.caches.cloudlet_info.get(key)
    }

    pub fn get_cloudlet_refs(&self, key: &edgegrid_model::CloudletKey) -> Option<CloudletRefs> {
        self.c.caches.cloudlet_refs.get(key)
    }

    pub fn get_cluster_refs(&self, key: &edgegrid_model::ClusterKey) -> Option<ClusterRefs> {
        self.c.caches.cluster_refs.get(key)
    }

    pub fn get_app_inst_refs(&self, key: &edgegrid_model::AppKey) -> Option<AppInstRefs> {
        self.c.caches.app_inst_refs.get(key)
    }
}

// ── Shared helpers for lifecycle waits ─────────────────────────────

impl Controller {
    /// Snapshot read-back for the coordinator: the store is the source
    /// of truth, the bus only wakes waiters.
    pub(crate) fn tracked_snapshot<T>(
        &self,
        key: &T::Key,
    ) -> Option<edgegrid_lifecycle::InfoSnapshot>
    where
        T: Obj + edgegrid_model::Tracked,
    {
        let store: ObjStore<T> = ObjStore::new(self.c.kv.clone());
        let obj = store.get(key).ok().flatten()?;
        Some(edgegrid_lifecycle::InfoSnapshot {
            state: obj.state(),
            status_msgs: Vec::new(),
            errors: obj.errors().to_vec(),
        })
    }
}
