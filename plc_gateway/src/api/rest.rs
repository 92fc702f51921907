use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::health::HealthRegistry;
use crate::poll::{PollerHandle, TagWrite};
use crate::tags::store::TagStore;
use crate::tags::structures::{Datatype, PlcName, TagRecord, Value};

/// Collaborators the REST layer translates verbs onto. Injected at startup;
/// the adapter itself is stateless.
#[derive(Clone)]
pub struct AppState {
    pub store: TagStore,
    pub health: Arc<HealthRegistry>,
    pub writers: Arc<HashMap<PlcName, PollerHandle>>,
    pub shutdown: CancellationToken,
}

/// Gateway error as an HTTP response: 400 invalid argument, 404 not found,
/// 409 duplicate, 422 datatype mismatch, 503 unavailable, 500 internal.
pub struct ApiError(GatewayError);

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::AlreadyExists(_) => StatusCode::CONFLICT,
            GatewayError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            GatewayError::TypeMismatch(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::Unavailable(_) | GatewayError::Timeout(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Deserialize)]
pub struct CreateTagRequest {
    id: String,
    plc: PlcName,
    address: String,
    datatype: Datatype,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    writable: bool,
    #[serde(default)]
    scale: u32,
}

#[derive(Deserialize)]
pub struct GetTagQuery {
    /// `?fresh=true` refuses cached data from a faulted controller with 503
    /// instead of the default cached-with-`Stale` reply.
    #[serde(default)]
    fresh: bool,
}

#[derive(Deserialize)]
pub struct PatchTagRequest {
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    writable: Option<bool>,
}

pub fn create_api_routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/tags", post(create_tag).get(list_tags))
        .route(
            "/api/v1/tags/:id",
            get(get_tag).patch(patch_tag).delete(delete_tag),
        )
        .route("/api/v1/hmi/data", get(hmi_data))
        .route("/api/v1/hmi/ready", get(hmi_ready))
        .route("/api/v1/hmi/health", get(hmi_health))
        .route("/api/v1/hmi/stop", post(hmi_stop))
        .layer(TraceLayer::new_for_http())
}

async fn create_tag(
    State(state): State<AppState>,
    Json(req): Json<CreateTagRequest>,
) -> Result<Json<TagRecord>, ApiError> {
    let value = match &req.value {
        Some(j) if !j.is_null() => Value::from_json(req.datatype, j)?,
        _ => Value::Null,
    };
    let record = TagRecord::new(
        req.id,
        req.plc,
        req.address,
        req.datatype,
        value,
        req.writable,
        req.scale,
    )?;
    let created = state.store.insert(record)?;
    info!(tag = %created.id, plc = %created.plc, "tag created");
    Ok(Json(created))
}

async fn list_tags(State(state): State<AppState>) -> Json<Vec<TagRecord>> {
    Json(state.store.snapshot())
}

async fn get_tag(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<GetTagQuery>,
) -> Result<Json<TagRecord>, ApiError> {
    let record = state.store.get(&id)?;
    if query.fresh {
        let connected = state
            .health
            .get(record.plc)
            .map(|e| e.connected)
            .unwrap_or(false);
        if !connected {
            return Err(GatewayError::Unavailable(format!(
                "controller '{}' is faulted",
                record.plc
            ))
            .into());
        }
    }
    Ok(Json(record))
}

async fn patch_tag(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PatchTagRequest>,
) -> Result<Json<TagRecord>, ApiError> {
    let current = state.store.get(&id)?;

    let value = match &req.value {
        Some(j) => Some(Value::from_json(current.datatype, j)?),
        None => None,
    };

    // Write-through goes to the owning poller's bounded queue before the
    // store commits, so an overflowing patch changes nothing.
    if let Some(value) = &value {
        let effective_writable = req.writable.unwrap_or(current.writable);
        if !effective_writable {
            return Err(GatewayError::InvalidArgument(format!(
                "tag '{id}' is not writable"
            ))
            .into());
        }
        if let Some(writer) = state.writers.get(&current.plc) {
            let raw = value.to_raw(current.scale)?;
            writer.enqueue(TagWrite {
                id: id.clone(),
                address: current.address.clone(),
                value: raw,
            })?;
        } else {
            warn!(tag = %id, plc = %current.plc, "no poller registered, skipping write-through");
        }
    }

    let updated = state.store.patch(&id, value, req.writable)?;
    Ok(Json(updated))
}

async fn delete_tag(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state.store.delete(&id)?;
    info!(tag = %deleted, "tag deleted");
    Ok(Json(json!({ "deleted": deleted })))
}

/// HMI snapshot keyed by tag id; per-record consistency only.
async fn hmi_data(State(state): State<AppState>) -> Json<BTreeMap<String, TagRecord>> {
    let snapshot = state
        .store
        .snapshot()
        .into_iter()
        .map(|r| (r.id.clone(), r))
        .collect();
    Json(snapshot)
}

async fn hmi_ready(State(state): State<AppState>) -> Response {
    if state.health.is_ready() {
        (StatusCode::OK, Json(json!({ "ready": true }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ready": false })),
        )
            .into_response()
    }
}

async fn hmi_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "ready": state.health.is_ready(),
        "state": state.health.readiness(),
        "plcs": state.health.snapshot_all(),
    }))
}

async fn hmi_stop(State(state): State<AppState>) -> Json<serde_json::Value> {
    info!("stop requested over REST");
    state.health.set_stopping();
    state.shutdown.cancel();
    Json(json!({ "stopping": true }))
}
