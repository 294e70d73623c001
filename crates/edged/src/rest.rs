//! REST adapter over the controller.
//!
//! A thin JSON surface: each handler parses the payload, calls the
//! controller, and maps error categories onto status codes. Update
//! requests carry the dotted field names being set, honoring
//! parent-implies-child semantics.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use edgegrid_api::{ApiError, Controller};
use edgegrid_model::{
    App, AppInst, AppInstKey, AppKey, Cloudlet, CloudletKey, ClusterKey, CrmOverride, FieldMap,
    Flavor, FlavorKey, TrustPolicy, Zone, ZoneKey,
};
use edgegrid_notify::NotifyServer;
use serde::Deserialize;

#[derive(Clone)]
struct RestState {
    controller: Controller,
    _notify: NotifyServer,
}

/// Response envelope for all endpoints.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(err: &ApiError) -> axum::response::Response {
    let status = if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.is_already_exists() || err.is_being_deleted() {
        StatusCode::CONFLICT
    } else {
        match err {
            ApiError::Model(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) | ApiError::Placement(_) | ApiError::Res(_) => {
                StatusCode::CONFLICT
            }
            ApiError::Infra(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    };
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(err.to_string()),
        }),
    )
        .into_response()
}

macro_rules! respond {
    ($result:expr) => {
        match $result {
            Ok(value) => ApiResponse::ok(value).into_response(),
            Err(err) => error_response(&err),
        }
    };
}

/// Update payloads: the object plus the dotted fields being set.
#[derive(Deserialize)]
struct UpdateRequest<T> {
    #[serde(flatten)]
    obj: T,
    fields: Vec<String>,
}

#[derive(Deserialize)]
struct DeleteRequest<K> {
    key: K,
    #[serde(default)]
    crm_override: CrmOverride,
}

pub fn build_router(controller: Controller, notify: NotifyServer) -> Router {
    let state = RestState {
        controller,
        _notify: notify,
    };
    Router::new()
        .route("/api/v1/apps", get(list_apps).post(create_app).put(update_app).delete(delete_app))
        .route("/api/v1/appinsts", get(list_app_insts).post(create_app_inst).delete(delete_app_inst))
        .route("/api/v1/clusterinsts", get(list_cluster_insts).post(create_cluster_inst).delete(delete_cluster_inst))
        .route("/api/v1/cloudlets/maintenance", post(set_maintenance))
        .route("/api/v1/cloudlets", get(list_cloudlets).post(create_cloudlet).delete(delete_cloudlet))
        .route("/api/v1/cloudletinfos", get(list_cloudlet_infos))
        .route("/api/v1/zones", get(list_zones).post(create_zone).delete(delete_zone))
        .route("/api/v1/flavors", get(list_flavors).post(create_flavor).delete(delete_flavor))
        .route("/api/v1/trustpolicies", post(create_trust_policy))
        .route("/api/v1/zones/deployment", post(zones_for_deployment))
        .with_state(state)
}

// ── Apps ───────────────────────────────────────────────────────────

async fn list_apps(State(s): State<RestState>) -> impl IntoResponse {
    ApiResponse::ok(s.controller.show_apps(|_| true)).into_response()
}

async fn create_app(State(s): State<RestState>, Json(app): Json<App>) -> impl IntoResponse {
    respond!(s.controller.create_app(app).await.map(|_| "created"))
}

async fn update_app(
    State(s): State<RestState>,
    Json(req): Json<UpdateRequest<App>>,
) -> impl IntoResponse {
    let fmap: FieldMap = req.fields.iter().cloned().collect();
    respond!(s.controller.update_app(req.obj, fmap).await.map(|_| "updated"))
}

async fn delete_app(
    State(s): State<RestState>,
    Json(req): Json<DeleteRequest<AppKey>>,
) -> impl IntoResponse {
    respond!(s.controller.delete_app(&req.key).await.map(|_| "deleted"))
}

// ── AppInsts ───────────────────────────────────────────────────────

async fn list_app_insts(State(s): State<RestState>) -> impl IntoResponse {
    ApiResponse::ok(s.controller.show_app_insts(|_| true)).into_response()
}

async fn create_app_inst(
    State(s): State<RestState>,
    Json(inst): Json<AppInst>,
) -> impl IntoResponse {
    respond!(s
        .controller
        .create_app_inst(inst, |_msg| {})
        .await
        .map(|_| "created"))
}

async fn delete_app_inst(
    State(s): State<RestState>,
    Json(req): Json<DeleteRequest<AppInstKey>>,
) -> impl IntoResponse {
    respond!(s
        .controller
        .delete_app_inst_opts(&req.key, req.crm_override, |_msg| {})
        .await
        .map(|_| "deleted"))
}

// ── ClusterInsts ───────────────────────────────────────────────────

async fn list_cluster_insts(State(s): State<RestState>) -> impl IntoResponse {
    ApiResponse::ok(s.controller.show_cluster_insts(|_| true)).into_response()
}

async fn create_cluster_inst(
    State(s): State<RestState>,
    Json(cluster): Json<edgegrid_model::ClusterInst>,
) -> impl IntoResponse {
    respond!(s
        .controller
        .create_cluster_inst(cluster, |_msg| {})
        .await
        .map(|_| "created"))
}

async fn delete_cluster_inst(
    State(s): State<RestState>,
    Json(req): Json<DeleteRequest<ClusterKey>>,
) -> impl IntoResponse {
    respond!(s
        .controller
        .delete_cluster_inst(&req.key, req.crm_override, |_msg| {})
        .await
        .map(|_| "deleted"))
}

/// Maintenance request for a cloudlet.
#[derive(Deserialize)]
struct MaintenanceRequest {
    key: CloudletKey,
    maintenance_state: edgegrid_model::MaintenanceState,
}

async fn set_maintenance(
    State(s): State<RestState>,
    Json(req): Json<MaintenanceRequest>,
) -> impl IntoResponse {
    respond!(s
        .controller
        .set_cloudlet_maintenance(&req.key, req.maintenance_state)
        .await
        .map(|_| "updated"))
}

// ── Cloudlets ──────────────────────────────────────────────────────

async fn list_cloudlets(State(s): State<RestState>) -> impl IntoResponse {
    ApiResponse::ok(s.controller.show_cloudlets(|_| true)).into_response()
}

async fn create_cloudlet(
    State(s): State<RestState>,
    Json(cloudlet): Json<Cloudlet>,
) -> impl IntoResponse {
    respond!(s
        .controller
        .create_cloudlet(cloudlet, |_msg| {})
        .await
        .map(|_| "created"))
}

async fn delete_cloudlet(
    State(s): State<RestState>,
    Json(req): Json<DeleteRequest<CloudletKey>>,
) -> impl IntoResponse {
    respond!(s
        .controller
        .delete_cloudlet(&req.key, req.crm_override, |_msg| {})
        .await
        .map(|_| "deleted"))
}

async fn list_cloudlet_infos(State(s): State<RestState>) -> impl IntoResponse {
    ApiResponse::ok(s.controller.show_cloudlet_infos()).into_response()
}

// ── Zones / flavors / policies ─────────────────────────────────────

async fn list_zones(State(s): State<RestState>) -> impl IntoResponse {
    ApiResponse::ok(s.controller.show_zones(|_| true)).into_response()
}

async fn create_zone(State(s): State<RestState>, Json(zone): Json<Zone>) -> impl IntoResponse {
    respond!(s.controller.create_zone(zone).await.map(|_| "created"))
}

async fn delete_zone(
    State(s): State<RestState>,
    Json(req): Json<DeleteRequest<ZoneKey>>,
) -> impl IntoResponse {
    respond!(s.controller.delete_zone(&req.key).await.map(|_| "deleted"))
}

async fn list_flavors(State(s): State<RestState>) -> impl IntoResponse {
    ApiResponse::ok(s.controller.show_flavors()).into_response()
}

async fn create_flavor(
    State(s): State<RestState>,
    Json(flavor): Json<Flavor>,
) -> impl IntoResponse {
    respond!(s.controller.create_flavor(flavor).await.map(|_| "created"))
}

async fn delete_flavor(
    State(s): State<RestState>,
    Json(req): Json<DeleteRequest<FlavorKey>>,
) -> impl IntoResponse {
    respond!(s.controller.delete_flavor(&req.key).await.map(|_| "deleted"))
}

async fn create_trust_policy(
    State(s): State<RestState>,
    Json(policy): Json<TrustPolicy>,
) -> impl IntoResponse {
    respond!(s
        .controller
        .create_trust_policy(policy)
        .await
        .map(|_| "created"))
}

/// Zones whose cloudlets could host an instance of the posted App.
async fn zones_for_deployment(
    State(s): State<RestState>,
    Json(app): Json<App>,
) -> impl IntoResponse {
    ApiResponse::ok(s.controller.zones_for_app_deployment(&app, true)).into_response()
}
