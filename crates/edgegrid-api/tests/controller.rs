//! End-to-end controller flows against an in-process fake CRM.
//!
//! The fake CRM reacts to dispatched intent the way a site resource
//! manager would: it reports progress through the controller's info
//! handlers, which write etcd state first and then publish to the
//! progress bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use edgegrid_api::{attach_notify, ApiError, Controller, ControllerOpts, InMemorySecretStore};
use edgegrid_kv::KvStore;
use edgegrid_lifecycle::{CrmConnector, CrmOp, InProcBus};
use edgegrid_model::verhash::{key_shape_hash, UpgradeFunc, VERSION_HASH_PATH};
use edgegrid_model::{
    epoch_secs, App, AppInst, AppInstKey, AppKey, Cloudlet, CloudletInfo, CloudletKey,
    CloudletState, ClusterInst, ClusterKey, CrmOverride, DeploymentType, FieldMap, Flavor,
    FlavorInfo, FlavorKey, InfraResource, PolicyKey, SecurityRule, Settings, TrackedState,
    TrustPolicy, Zone, ZoneKey,
};
use edgegrid_notify::NotifyServer;
use parking_lot::Mutex;
use tokio::sync::watch;

const OPERATOR: &str = "op";

struct FakeCrm {
    controller: Mutex<Option<Controller>>,
    /// vcpu capacity reported per cloudlet name.
    infra_vcpus: Mutex<HashMap<String, u64>>,
    fail_appinst_delete: AtomicBool,
    fail_appinst_create: AtomicBool,
    silent_appinst_create: AtomicBool,
}

impl FakeCrm {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            controller: Mutex::new(None),
            infra_vcpus: Mutex::new(HashMap::new()),
            fail_appinst_delete: AtomicBool::new(false),
            fail_appinst_create: AtomicBool::new(false),
            silent_appinst_create: AtomicBool::new(false),
        })
    }

    fn set_controller(&self, controller: Controller) {
        *self.controller.lock() = Some(controller);
    }

    fn ctrl(&self) -> Controller {
        self.controller.lock().clone().expect("controller wired")
    }

    fn site_info(&self, key: &CloudletKey) -> CloudletInfo {
        let vcpus = self
            .infra_vcpus
            .lock()
            .get(&key.name)
            .copied()
            .unwrap_or(10);
        CloudletInfo {
            key: key.clone(),
            state: CloudletState::Ready,
            flavors: vec![FlavorInfo {
                name: "m4.small".to_string(),
                vcpus: 2,
                ram_mb: 2048,
                disk_gb: 40,
                ..Default::default()
            }],
            infra_resources: vec![
                InfraResource {
                    name: "vcpus".to_string(),
                    value: 0,
                    infra_max_value: vcpus,
                },
                InfraResource {
                    name: "ram".to_string(),
                    value: 0,
                    infra_max_value: 1_000_000,
                },
                InfraResource {
                    name: "disk".to_string(),
                    value: 0,
                    infra_max_value: 100_000,
                },
            ],
            ..Default::default()
        }
    }
}

impl CrmConnector for FakeCrm {
    fn apply_cluster_inst(&self, cluster: &ClusterInst, op: CrmOp) {
        let c = self.ctrl();
        let key = cluster.key.clone();
        tokio::spawn(async move {
            match op {
                CrmOp::Create => {
                    let _ = c
                        .handle_cluster_inst_info(
                            &key,
                            TrackedState::Creating,
                            vec!["creating cluster".to_string()],
                            vec![],
                        )
                        .await;
                    let _ = c
                        .handle_cluster_inst_info(
                            &key,
                            TrackedState::Ready,
                            vec!["creating cluster".to_string(), "cluster ready".to_string()],
                            vec![],
                        )
                        .await;
                }
                CrmOp::Update => {
                    let _ = c
                        .handle_cluster_inst_info(&key, TrackedState::Updating, vec![], vec![])
                        .await;
                    let _ = c
                        .handle_cluster_inst_info(&key, TrackedState::Ready, vec![], vec![])
                        .await;
                }
                CrmOp::Delete => {
                    let _ = c
                        .handle_cluster_inst_info(&key, TrackedState::Deleting, vec![], vec![])
                        .await;
                    let _ = c
                        .handle_cluster_inst_info(&key, TrackedState::NotPresent, vec![], vec![])
                        .await;
                }
            }
        });
    }

    fn apply_app_inst(&self, inst: &AppInst, _app: &App, op: CrmOp) {
        let c = self.ctrl();
        let key = inst.key.clone();
        let fail_delete = self.fail_appinst_delete.load(Ordering::SeqCst);
        let fail_create = self.fail_appinst_create.load(Ordering::SeqCst);
        let silent_create = self.silent_appinst_create.load(Ordering::SeqCst);
        tokio::spawn(async move {
            match op {
                CrmOp::Create => {
                    if silent_create {
                        return;
                    }
                    let _ = c
                        .handle_app_inst_info(
                            &key,
                            TrackedState::Creating,
                            vec!["deploying app".to_string()],
                            vec![],
                        )
                        .await;
                    if fail_create {
                        let _ = c
                            .handle_app_inst_info(
                                &key,
                                TrackedState::CreateError,
                                vec!["deploying app".to_string()],
                                vec!["image pull failed".to_string()],
                            )
                            .await;
                    } else {
                        let _ = c
                            .handle_app_inst_info(
                                &key,
                                TrackedState::Ready,
                                vec!["deploying app".to_string(), "app ready".to_string()],
                                vec![],
                            )
                            .await;
                    }
                }
                CrmOp::Update => {
                    let _ = c
                        .handle_app_inst_info(&key, TrackedState::Updating, vec![], vec![])
                        .await;
                    let _ = c
                        .handle_app_inst_info(&key, TrackedState::Ready, vec![], vec![])
                        .await;
                }
                CrmOp::Delete => {
                    if fail_delete {
                        let _ = c
                            .handle_app_inst_info(
                                &key,
                                TrackedState::DeleteError,
                                vec![],
                                vec!["infra delete failure".to_string()],
                            )
                            .await;
                    } else {
                        let _ = c
                            .handle_app_inst_info(&key, TrackedState::Deleting, vec![], vec![])
                            .await;
                        let _ = c
                            .handle_app_inst_info(&key, TrackedState::NotPresent, vec![], vec![])
                            .await;
                    }
                }
            }
        });
    }

    fn apply_cloudlet(&self, cloudlet: &Cloudlet, op: CrmOp) {
        let c = self.ctrl();
        let key = cloudlet.key.clone();
        let info = self.site_info(&key);
        tokio::spawn(async move {
            match op {
                CrmOp::Create | CrmOp::Update => {
                    let _ = c.handle_cloudlet_info(info, None).await;
                }
                CrmOp::Delete => {
                    let gone = CloudletInfo {
                        key: key.clone(),
                        state: CloudletState::NotPresent,
                        ..Default::default()
                    };
                    let _ = c.handle_cloudlet_info(gone, None).await;
                }
            }
        });
    }
}

struct Harness {
    controller: Controller,
    crm: Arc<FakeCrm>,
    _shutdown: watch::Sender<bool>,
}

async fn start_controller() -> Harness {
    let crm = FakeCrm::new();
    let settings = Settings {
        registry_fqdn: "registry.test".to_string(),
        crm_operation_timeout_secs: 2,
        ..Default::default()
    };
    let controller = Controller::new(ControllerOpts {
        region: "local".to_string(),
        kv: KvStore::open_in_memory(),
        crm: crm.clone(),
        bus: Arc::new(InProcBus::new()),
        secrets: Arc::new(InMemorySecretStore::new()),
        settings,
        upgrades: Vec::new(),
    })
    .unwrap();
    crm.set_controller(controller.clone());
    let (shutdown, rx) = watch::channel(false);
    controller.start(rx);
    Harness {
        controller,
        crm,
        _shutdown: shutdown,
    }
}

async fn setup_region(h: &Harness, cloudlets: &[(&str, u64)]) {
    let c = &h.controller;
    c.create_flavor(Flavor {
        key: FlavorKey::new("small"),
        vcpus: 2,
        ram_mb: 2048,
        disk_gb: 10,
        ..Default::default()
    })
    .await
    .unwrap();
    c.create_zone(Zone {
        key: ZoneKey::new(OPERATOR, "zoneA"),
        ..Default::default()
    })
    .await
    .unwrap();
    for (name, vcpus) in cloudlets {
        h.crm.infra_vcpus.lock().insert(name.to_string(), *vcpus);
        c.create_cloudlet(
            Cloudlet {
                key: CloudletKey::new(OPERATOR, name),
                zone: "zoneA".to_string(),
                platform_type: "openstack".to_string(),
                ..Default::default()
            },
            |_| {},
        )
        .await
        .unwrap();
    }
}

fn web_app(org: &str) -> App {
    App {
        key: AppKey::new(org, "web", "1.0"),
        deployment: DeploymentType::Kubernetes,
        access_ports: "tcp:443".to_string(),
        default_flavor: FlavorKey::new("small"),
        ..Default::default()
    }
}

fn inst(org: &str, name: &str) -> AppInst {
    AppInst {
        key: AppInstKey::new(org, name),
        app_key: AppKey::new(org, "web", "1.0"),
        zone_key: ZoneKey::new(OPERATOR, "zoneA"),
        ..Default::default()
    }
}

// ── Scenario 1: create App then AppInst ────────────────────────────

#[tokio::test]
async fn create_app_then_app_inst_places_on_freest_cloudlet() {
    let h = start_controller().await;
    setup_region(&h, &[("c1", 10), ("c2", 5), ("c3", 2)]).await;
    let c = &h.controller;

    c.create_app(web_app("acme")).await.unwrap();

    let mut statuses = Vec::new();
    c.create_app_inst(inst("acme", "web-prod"), |msg| {
        statuses.push(msg.to_string())
    })
    .await
    .unwrap();
    assert!(statuses.iter().any(|s| s.contains("deploying")), "{statuses:?}");

    let created = c
        .get_app_inst(&AppInstKey::new("acme", "web-prod"))
        .expect("inst exists");
    assert_eq!(created.state, TrackedState::Ready);
    assert_eq!(created.cloudlet_key.name, "c1");
    assert_eq!(created.cluster_key.name, "reservable0-c1");
    assert!(created.auto_cluster);
    assert!(!created.uri.is_empty());
    assert_eq!(created.dns_label, "web-prod");

    // Autocluster id 0 allocated on c1, refs track the instance.
    let crefs = c
        .get_cloudlet_refs(&CloudletKey::new(OPERATOR, "c1"))
        .unwrap();
    assert_eq!(crefs.reserved_auto_cluster_ids, 0b1);
    let cluster_refs = c
        .get_cluster_refs(&created.cluster_key)
        .expect("cluster refs exist");
    assert!(cluster_refs.apps.contains(&created.key));

    // The reservable cluster is reserved by acme.
    let cluster = c.get_cluster_inst(&created.cluster_key).unwrap();
    assert!(cluster.reservable);
    assert_eq!(cluster.reserved_by, "acme");
    assert_eq!(cluster.state, TrackedState::Ready);
}

// ── Scenario 2: second instance reuses the reserved autocluster ────

#[tokio::test]
async fn second_inst_scales_up_reserved_autocluster() {
    let h = start_controller().await;
    setup_region(&h, &[("c1", 10), ("c2", 5), ("c3", 2)]).await;
    let c = &h.controller;

    c.create_app(web_app("acme")).await.unwrap();
    c.create_app_inst(inst("acme", "web-prod"), |_| {})
        .await
        .unwrap();
    c.create_app_inst(inst("acme", "web-prod-2"), |_| {})
        .await
        .unwrap();

    let first = c.get_app_inst(&AppInstKey::new("acme", "web-prod")).unwrap();
    let second = c
        .get_app_inst(&AppInstKey::new("acme", "web-prod-2"))
        .unwrap();
    // Same cluster, held by the same reservation.
    assert_eq!(second.cluster_key, first.cluster_key);
    assert_eq!(second.state, TrackedState::Ready);

    let cluster = c.get_cluster_inst(&first.cluster_key).unwrap();
    assert_eq!(cluster.reserved_by, "acme");
    // The scalable pool grew to absorb the second instance.
    assert_eq!(cluster.node_pools[0].num_nodes, 2);

    // Still only autocluster id 0 on c1.
    let crefs = c
        .get_cloudlet_refs(&CloudletKey::new(OPERATOR, "c1"))
        .unwrap();
    assert_eq!(crefs.reserved_auto_cluster_ids, 0b1);
}

// ── Scenario 3: delete with dependency ─────────────────────────────

#[tokio::test]
async fn app_delete_blocked_by_static_inst_reverts_prepare() {
    let h = start_controller().await;
    setup_region(&h, &[("c1", 10)]).await;
    let c = &h.controller;

    c.create_app(web_app("acme")).await.unwrap();
    c.create_app_inst(inst("acme", "web-prod"), |_| {})
        .await
        .unwrap();

    let err = c
        .delete_app(&AppKey::new("acme", "web", "1.0"))
        .await
        .unwrap_err();
    assert!(
        err.to_string()
            .contains("Application in use by static AppInst"),
        "{err}"
    );

    // The failed delete left no delete-prepare mark.
    let app = c.get_app(&AppKey::new("acme", "web", "1.0")).unwrap();
    assert!(!app.delete_prepare);

    // The instance's whole reference chain is live.
    let created = c.get_app_inst(&AppInstKey::new("acme", "web-prod")).unwrap();
    assert!(c.get_cluster_inst(&created.cluster_key).is_some());
    assert!(c.get_cloudlet(&created.cloudlet_key).is_some());
}

// ── Scenario 4: autocluster id reuse after cleanup ─────────────────

#[tokio::test]
async fn autocluster_ids_reused_after_idle_cleanup() {
    let h = start_controller().await;
    setup_region(&h, &[("c1", 20)]).await;
    let c = &h.controller;

    for org in ["alpha", "beta", "gamma"] {
        c.create_app(web_app(org)).await.unwrap();
        c.create_app_inst(inst(org, "web-prod"), |_| {})
            .await
            .unwrap();
    }
    let c1 = CloudletKey::new(OPERATOR, "c1");
    assert_eq!(
        c.get_cloudlet_refs(&c1).unwrap().reserved_auto_cluster_ids,
        0b111
    );

    // Delete the middle org's instance; its reservation releases but
    // the autocluster lingers until the idle reaper runs.
    c.delete_app_inst(&AppInstKey::new("beta", "web-prod"), |_| {})
        .await
        .unwrap();
    let middle = c
        .get_cluster_inst(&ClusterKey::new("edgegrid", "reservable1-c1"))
        .unwrap();
    assert_eq!(middle.reserved_by, "");
    assert_eq!(
        c.get_cloudlet_refs(&c1).unwrap().reserved_auto_cluster_ids,
        0b111
    );

    let idle = c.settings().cleanup_reservable_auto_cluster_idle_secs;
    let reaped = c.run_idle_reaper_once(epoch_secs() + idle + 10).await;
    assert_eq!(reaped, 1);
    // Set bits equal exactly the surviving reservable clusters.
    assert_eq!(
        c.get_cloudlet_refs(&c1).unwrap().reserved_auto_cluster_ids,
        0b101
    );

    // The next create picks the freed id 1.
    c.create_app(web_app("delta")).await.unwrap();
    c.create_app_inst(inst("delta", "web-prod"), |_| {})
        .await
        .unwrap();
    let fourth = c.get_app_inst(&AppInstKey::new("delta", "web-prod")).unwrap();
    assert_eq!(fourth.cluster_key.name, "reservable1-c1");
    assert_eq!(
        c.get_cloudlet_refs(&c1).unwrap().reserved_auto_cluster_ids,
        0b111
    );
}

// ── Scenario 5: CRM error then override ────────────────────────────

#[tokio::test]
async fn crm_delete_error_then_override_succeeds() {
    let h = start_controller().await;
    setup_region(&h, &[("c1", 10)]).await;
    let c = &h.controller;

    c.create_app(web_app("acme")).await.unwrap();
    c.create_app_inst(inst("acme", "web-prod"), |_| {})
        .await
        .unwrap();

    h.crm.fail_appinst_delete.store(true, Ordering::SeqCst);
    let key = AppInstKey::new("acme", "web-prod");
    let err = c.delete_app_inst(&key, |_| {}).await.unwrap_err();
    assert!(err.to_string().contains("infra delete failure"), "{err}");
    assert_eq!(c.get_app_inst(&key).unwrap().state, TrackedState::DeleteError);

    // Operator overrides CRM errors; removal completes fully.
    c.delete_app_inst_opts(&key, CrmOverride::IgnoreCrmErrors, |_| {})
        .await
        .unwrap();
    assert!(c.get_app_inst(&key).is_none());

    // After removal the reservation is released.
    let cluster = c
        .get_cluster_inst(&ClusterKey::new("edgegrid", "reservable0-c1"))
        .unwrap();
    assert_eq!(cluster.reserved_by, "");
    // Refs no longer mention the instance.
    let refs = c.get_cluster_refs(&cluster.key).unwrap();
    assert!(refs.apps.is_empty());
}

// ── Scenario 6: trust policy violation ─────────────────────────────

#[tokio::test]
async fn trust_policy_rejects_wider_outbound_request() {
    let h = start_controller().await;
    let c = &h.controller;
    c.create_trust_policy(TrustPolicy {
        key: PolicyKey::new(OPERATOR, "locked"),
        outbound_security_rules: vec![SecurityRule::new("tcp", "10.0.0.0/16", 80, 80)],
        ..Default::default()
    })
    .await
    .unwrap();
    c.create_flavor(Flavor {
        key: FlavorKey::new("small"),
        vcpus: 2,
        ram_mb: 2048,
        disk_gb: 10,
        ..Default::default()
    })
    .await
    .unwrap();
    c.create_zone(Zone {
        key: ZoneKey::new(OPERATOR, "zoneA"),
        ..Default::default()
    })
    .await
    .unwrap();
    h.crm.infra_vcpus.lock().insert("c1".to_string(), 10);
    c.create_cloudlet(
        Cloudlet {
            key: CloudletKey::new(OPERATOR, "c1"),
            zone: "zoneA".to_string(),
            trust_policy: "locked".to_string(),
            ..Default::default()
        },
        |_| {},
    )
    .await
    .unwrap();

    let mut app = web_app("acme");
    app.trusted = true;
    app.required_outbound_connections = vec![SecurityRule::new("tcp", "10.0.0.0/8", 80, 80)];
    c.create_app(app).await.unwrap();

    let err = c
        .create_app_inst(inst("acme", "web-prod"), |_| {})
        .await
        .unwrap_err();
    assert!(
        err.to_string()
            .contains("No outbound rule in policy or exception to match required connection"),
        "{err}"
    );

    // A narrower requirement fits the same policy.
    let mut ok_app = web_app("narrow");
    ok_app.trusted = true;
    ok_app.required_outbound_connections = vec![SecurityRule::new("tcp", "10.0.5.0/24", 80, 80)];
    c.create_app(ok_app).await.unwrap();
    c.create_app_inst(inst("narrow", "web-prod"), |_| {})
        .await
        .unwrap();
}

// ── Undo on create failure ─────────────────────────────────────────

#[tokio::test]
async fn failed_create_undoes_refs_and_autocluster() {
    let h = start_controller().await;
    setup_region(&h, &[("c1", 10)]).await;
    let c = &h.controller;

    c.create_app(web_app("acme")).await.unwrap();
    h.crm.fail_appinst_create.store(true, Ordering::SeqCst);

    let err = c
        .create_app_inst(inst("acme", "web-prod"), |_| {})
        .await
        .unwrap_err();
    assert!(err.to_string().contains("image pull failed"), "{err}");

    let key = AppInstKey::new("acme", "web-prod");
    assert!(c.get_app_inst(&key).is_none());
    // The autocluster and its id were rolled back.
    let crefs = c
        .get_cloudlet_refs(&CloudletKey::new(OPERATOR, "c1"))
        .unwrap();
    assert_eq!(crefs.reserved_auto_cluster_ids, 0);
    assert!(c
        .get_cluster_inst(&ClusterKey::new("edgegrid", "reservable0-c1"))
        .is_none());
    // The app's inst refs are clean, so the app can be deleted.
    h.crm.fail_appinst_create.store(false, Ordering::SeqCst);
    c.delete_app(&AppKey::new("acme", "web", "1.0")).await.unwrap();
}

// ── Deadline while transient ───────────────────────────────────────

#[tokio::test]
async fn deadline_in_transient_state_reports_in_progress() {
    let h = start_controller().await;
    setup_region(&h, &[("c1", 10)]).await;
    let c = &h.controller;

    c.create_app(web_app("acme")).await.unwrap();
    h.crm.silent_appinst_create.store(true, Ordering::SeqCst);

    let err = c
        .create_app_inst(inst("acme", "web-prod"), |_| {})
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            ApiError::Infra(edgegrid_lifecycle::LifecycleError::InProgress(_))
        ),
        "{err}"
    );
    // The object was not undone; Show observes the real state.
    let created = c.get_app_inst(&AppInstKey::new("acme", "web-prod")).unwrap();
    assert!(created.state.is_transient());
}

// ── DNS label uniqueness ───────────────────────────────────────────

#[tokio::test]
async fn dns_labels_unique_per_cloudlet() {
    let h = start_controller().await;
    setup_region(&h, &[("c1", 20)]).await;
    let c = &h.controller;

    c.create_app(web_app("acme")).await.unwrap();
    c.create_app_inst(inst("acme", "web.prod"), |_| {})
        .await
        .unwrap();
    c.create_app_inst(inst("acme", "web prod"), |_| {})
        .await
        .unwrap();

    let a = c.get_app_inst(&AppInstKey::new("acme", "web.prod")).unwrap();
    let b = c.get_app_inst(&AppInstKey::new("acme", "web prod")).unwrap();
    assert_eq!(a.dns_label, "web-prod");
    assert_eq!(b.dns_label, "web-prod1");
    assert_ne!(a.uri, b.uri);
}

// ── Zone listing for deployment (fixed sort) ───────────────────────

#[tokio::test]
async fn zones_for_app_deployment_sorted() {
    let h = start_controller().await;
    let c = &h.controller;
    c.create_flavor(Flavor {
        key: FlavorKey::new("small"),
        vcpus: 2,
        ram_mb: 2048,
        disk_gb: 10,
        ..Default::default()
    })
    .await
    .unwrap();
    for zone in ["zebra", "alpha", "mid"] {
        c.create_zone(Zone {
            key: ZoneKey::new(OPERATOR, zone),
            ..Default::default()
        })
        .await
        .unwrap();
        let name = format!("site-{zone}");
        h.crm.infra_vcpus.lock().insert(name.clone(), 10);
        c.create_cloudlet(
            Cloudlet {
                key: CloudletKey::new(OPERATOR, &name),
                zone: zone.to_string(),
                ..Default::default()
            },
            |_| {},
        )
        .await
        .unwrap();
    }

    let mut app = web_app("acme");
    app.kubernetes_resources = None;
    let zones = c.zones_for_app_deployment(&app, false);
    let names: Vec<&str> = zones.iter().map(|z| z.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "mid", "zebra"]);
}

// ── Version hash guard ─────────────────────────────────────────────

#[tokio::test]
async fn version_hash_guard_refuses_mismatched_store() {
    let kv = KvStore::open_in_memory();
    kv.put(VERSION_HASH_PATH, "0123456789abcdef", None).unwrap();

    let crm = FakeCrm::new();
    let make_opts = |kv: KvStore, upgrades| ControllerOpts {
        region: "local".to_string(),
        kv,
        crm: crm.clone(),
        bus: Arc::new(InProcBus::new()),
        secrets: Arc::new(InMemorySecretStore::new()),
        settings: Settings::default(),
        upgrades,
    };

    let Err(err) = Controller::new(make_opts(kv.clone(), Vec::new())) else {
        panic!("controller started against a mismatched store");
    };
    assert!(err.to_string().contains("data-model version mismatch"), "{err}");

    // With a registered upgrade the controller migrates and starts.
    let upgrades = vec![UpgradeFunc {
        from_hash: "0123456789abcdef".to_string(),
        migrate: |path, value| Some((path.to_string(), value.to_string())),
    }];
    assert!(Controller::new(make_opts(kv.clone(), upgrades)).is_ok());
    assert_eq!(kv.get(VERSION_HASH_PATH).unwrap().value, key_shape_hash());
}

// ── Notify fan-out end to end ──────────────────────────────────────

#[tokio::test]
async fn notify_disconnect_marks_cloudlet_info_offline() {
    let h = start_controller().await;
    setup_region(&h, &[("c1", 10)]).await;
    let c = &h.controller;

    let server = NotifyServer::new();
    attach_notify(c, &server);

    let (notify_id, mut rx) = server.connect();
    // The full sync list includes the cloudlet we created.
    let mut saw_cloudlet = false;
    while let Ok(msg) = rx.try_recv() {
        if let edgegrid_notify::NotifyMsg::Update { typ, .. } = &msg {
            if typ == "Cloudlet" {
                saw_cloudlet = true;
            }
        }
    }
    assert!(saw_cloudlet);

    // The site reports through this subscriber, then drops.
    let mut report = h.crm.site_info(&CloudletKey::new(OPERATOR, "c1"));
    report.notify_id = notify_id;
    server.handle_upstream(notify_id, "CloudletInfo", &serde_json::to_string(&report).unwrap());
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    server.disconnect(notify_id);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let infos = c.show_cloudlet_infos();
    let info = infos
        .iter()
        .find(|i| i.key.name == "c1")
        .expect("info present");
    assert_eq!(info.state, CloudletState::Offline);
}

// ── App update immutability while instances exist ──────────────────

#[tokio::test]
async fn app_update_immutable_fields_blocked_by_instances() {
    let h = start_controller().await;
    setup_region(&h, &[("c1", 10)]).await;
    let c = &h.controller;

    c.create_app(web_app("acme")).await.unwrap();

    // Before any instance exists, access ports may change.
    let mut update = web_app("acme");
    update.access_ports = "tcp:8443".to_string();
    c.update_app(update.clone(), FieldMap::new(["access_ports"]))
        .await
        .unwrap();

    c.create_app_inst(inst("acme", "web-prod"), |_| {})
        .await
        .unwrap();

    // With an instance present, the same update is refused.
    update.access_ports = "tcp:9000".to_string();
    let err = c
        .update_app(update.clone(), FieldMap::new(["access_ports"]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cannot update"), "{err}");

    // But always-updatable fields still go through.
    update.trusted = true;
    c.update_app(update, FieldMap::new(["trusted"]))
        .await
        .unwrap();
    assert!(c.get_app(&AppKey::new("acme", "web", "1.0")).unwrap().trusted);

    // Key and generated fields are never updatable.
    let err = c
        .update_app(web_app("acme"), FieldMap::new(["key.name"]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not updatable"), "{err}");
}

// ── User-named target cluster (rule a) ─────────────────────────────

#[tokio::test]
async fn named_cluster_placement_and_delete_protection() {
    let h = start_controller().await;
    setup_region(&h, &[("c1", 10)]).await;
    let c = &h.controller;

    c.create_cluster_inst(
        ClusterInst {
            key: ClusterKey::new("acme", "own-cluster"),
            cloudlet_key: CloudletKey::new(OPERATOR, "c1"),
            deployment: DeploymentType::Kubernetes,
            node_pools: vec![edgegrid_model::NodePool {
                name: "workers".to_string(),
                num_nodes: 2,
                node_resources: edgegrid_model::NodeResources {
                    vcpus: 2,
                    ram_mb: 2048,
                    disk_gb: 10,
                    ..Default::default()
                },
                scalable: true,
            }],
            kubernetes_version: "1.28".to_string(),
            ..Default::default()
        },
        |_| {},
    )
    .await
    .unwrap();

    c.create_app(web_app("acme")).await.unwrap();
    let mut req = inst("acme", "web-prod");
    req.cluster_key = ClusterKey::new("acme", "own-cluster");
    c.create_app_inst(req, |_| {}).await.unwrap();

    let created = c.get_app_inst(&AppInstKey::new("acme", "web-prod")).unwrap();
    assert_eq!(created.cluster_key.name, "own-cluster");
    assert!(!created.auto_cluster);
    // No autocluster was allocated.
    let crefs = c
        .get_cloudlet_refs(&CloudletKey::new(OPERATOR, "c1"))
        .unwrap();
    assert_eq!(crefs.reserved_auto_cluster_ids, 0);

    // The occupied cluster refuses deletion; the failed attempt leaves
    // no delete-prepare mark.
    let err = c
        .delete_cluster_inst(
            &ClusterKey::new("acme", "own-cluster"),
            CrmOverride::NoOverride,
            |_| {},
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("ClusterInst in use"), "{err}");
    assert!(
        !c.get_cluster_inst(&ClusterKey::new("acme", "own-cluster"))
            .unwrap()
            .delete_prepare
    );

    // A foreign org cannot land on it.
    c.create_app(web_app("rival")).await.unwrap();
    let mut foreign = inst("rival", "web-prod");
    foreign.cluster_key = ClusterKey::new("acme", "own-cluster");
    assert!(c.create_app_inst(foreign, |_| {}).await.is_err());
}

// ── Trust policy exception grants extra rules ──────────────────────

#[tokio::test]
async fn trust_policy_exception_allows_wider_connection() {
    let h = start_controller().await;
    let c = &h.controller;
    c.create_trust_policy(TrustPolicy {
        key: PolicyKey::new(OPERATOR, "locked"),
        outbound_security_rules: vec![SecurityRule::new("tcp", "10.0.0.0/16", 80, 80)],
        ..Default::default()
    })
    .await
    .unwrap();
    c.create_flavor(Flavor {
        key: FlavorKey::new("small"),
        vcpus: 2,
        ram_mb: 2048,
        disk_gb: 10,
        ..Default::default()
    })
    .await
    .unwrap();
    c.create_zone(Zone {
        key: ZoneKey::new(OPERATOR, "zoneA"),
        ..Default::default()
    })
    .await
    .unwrap();
    h.crm.infra_vcpus.lock().insert("c1".to_string(), 10);
    c.create_cloudlet(
        Cloudlet {
            key: CloudletKey::new(OPERATOR, "c1"),
            zone: "zoneA".to_string(),
            trust_policy: "locked".to_string(),
            ..Default::default()
        },
        |_| {},
    )
    .await
    .unwrap();

    let mut app = web_app("acme");
    app.trusted = true;
    app.required_outbound_connections = vec![SecurityRule::new("tcp", "10.0.0.0/8", 80, 80)];
    c.create_app(app).await.unwrap();

    // Without the exception, placement fails; with it, the same app
    // lands on the same cloudlet.
    assert!(c.create_app_inst(inst("acme", "web-prod"), |_| {}).await.is_err());

    c.create_trust_policy_exception(edgegrid_model::TrustPolicyException {
        key: PolicyKey::new(OPERATOR, "acme-wide-open"),
        zone_key: ZoneKey::new(OPERATOR, "zoneA"),
        app_key: AppKey::new("acme", "web", "1.0"),
        outbound_security_rules: vec![SecurityRule::new("tcp", "10.0.0.0/8", 80, 80)],
        ..Default::default()
    })
    .await
    .unwrap();

    c.create_app_inst(inst("acme", "web-prod"), |_| {})
        .await
        .unwrap();

    // The exception now blocks deleting the app until it is removed.
    c.delete_app_inst(&AppInstKey::new("acme", "web-prod"), |_| {})
        .await
        .unwrap();
    let err = c
        .delete_app(&AppKey::new("acme", "web", "1.0"))
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("Trust Policy Exception"),
        "{err}"
    );
    assert!(!c.get_app(&AppKey::new("acme", "web", "1.0")).unwrap().delete_prepare);
}

// ── Cloudlet delete protocol ───────────────────────────────────────

#[tokio::test]
async fn cloudlet_delete_blocked_while_clusters_exist() {
    let h = start_controller().await;
    setup_region(&h, &[("c1", 10)]).await;
    let c = &h.controller;

    c.create_app(web_app("acme")).await.unwrap();
    c.create_app_inst(inst("acme", "web-prod"), |_| {})
        .await
        .unwrap();

    let key = CloudletKey::new(OPERATOR, "c1");
    let err = c
        .delete_cloudlet(&key, CrmOverride::NoOverride, |_| {})
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Cloudlet in use"), "{err}");
    assert!(!c.get_cloudlet(&key).unwrap().delete_prepare);

    // Tear the instance and cluster down, then the cloudlet goes away.
    c.delete_app_inst(&AppInstKey::new("acme", "web-prod"), |_| {})
        .await
        .unwrap();
    let idle = c.settings().cleanup_reservable_auto_cluster_idle_secs;
    c.run_idle_reaper_once(epoch_secs() + idle + 10).await;
    c.delete_cloudlet(&key, CrmOverride::NoOverride, |_| {})
        .await
        .unwrap();
    assert!(c.get_cloudlet(&key).is_none());
}
