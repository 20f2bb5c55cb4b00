//! REST API handlers.
//!
//! Each handler resolves the caller from request headers, delegates to the
//! `CreationManager` or `PilotSlotManager` and returns JSON responses.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::warn;

use pilotgrid_core::{AsyncCreateRequest, Caller, CompensationResult, CreateRequest, VmId};
use pilotgrid_creation::CreationError;

use crate::ApiState;

pub const CALLER_HEADER: &str = "x-pilotgrid-caller";
pub const SUPERUSER_HEADER: &str = "x-pilotgrid-superuser";

/// Response wrapper for consistent API format.
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

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn creation_error(e: CreationError) -> Response {
    let status = match &e {
        CreationError::Request(_) => StatusCode::BAD_REQUEST,
        CreationError::Denied(_) => StatusCode::FORBIDDEN,
        CreationError::IdempotentMismatch { .. } => StatusCode::CONFLICT,
        CreationError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %e, "request failed");
    }
    error_response(&e.to_string(), status).into_response()
}

/// Missing identity yields an empty caller, which the manager rejects.
fn caller(headers: &HeaderMap) -> Caller {
    let identity = headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .trim()
        .to_string();
    let superuser = headers
        .get(SUPERUSER_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    Caller {
        identity,
        superuser,
    }
}

// ── Instances ──────────────────────────────────────────────────

/// GET /api/v1/instances
pub async fn list_instances(State(state): State<ApiState>, headers: HeaderMap) -> impl IntoResponse {
    match state.creation.list(&caller(&headers)).await {
        Ok(instances) => ApiResponse::ok(instances).into_response(),
        Err(e) => creation_error(e),
    }
}

/// POST /api/v1/instances
pub async fn create_instances(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<CreateRequest>,
) -> impl IntoResponse {
    match state.creation.create(&request, &caller(&headers)).await {
        Ok(instances) => (StatusCode::CREATED, ApiResponse::ok(instances)).into_response(),
        Err(e) => creation_error(e),
    }
}

/// GET /api/v1/instances/{id}
pub async fn get_instance(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<VmId>,
) -> impl IntoResponse {
    match state.creation.find(id, &caller(&headers)).await {
        Ok(instance) => ApiResponse::ok(instance).into_response(),
        Err(e) => creation_error(e),
    }
}

/// What a teardown released and what it could not.
#[derive(Debug, serde::Serialize)]
pub struct TeardownReport {
    pub vmid: VmId,
    pub clean: bool,
    pub completed: Vec<String>,
    pub failures: Vec<String>,
}

impl TeardownReport {
    fn new(vmid: VmId, result: &CompensationResult) -> Self {
        Self {
            vmid,
            clean: result.is_clean(),
            completed: result.completed().to_vec(),
            failures: result
                .failures()
                .iter()
                .map(|f| format!("{}: {}", f.step, f.cause))
                .collect(),
        }
    }
}

/// DELETE /api/v1/instances/{id}
pub async fn destroy_instance(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<VmId>,
) -> impl IntoResponse {
    match state.creation.destroy(id, &caller(&headers)).await {
        Ok(result) => ApiResponse::ok(TeardownReport::new(id, &result)).into_response(),
        Err(e) => creation_error(e),
    }
}

// ── Async requests ─────────────────────────────────────────────

/// POST /api/v1/async-requests
pub async fn add_async_request(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<AsyncCreateRequest>,
) -> impl IntoResponse {
    match state.creation.add_async_request(&request, &caller(&headers)).await {
        Ok(accepted) => (StatusCode::ACCEPTED, ApiResponse::ok(accepted)).into_response(),
        Err(e) => creation_error(e),
    }
}

// ── Co-scheduling ──────────────────────────────────────────────

/// POST /api/v1/coschedule/{id}/proceed
pub async fn proceed_coschedule(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.creation.proceed_coschedule(&id, &caller(&headers)).await {
        Ok(()) => ApiResponse::ok(serde_json::json!({
            "cosched_id": id,
            "status": "submitted"
        }))
        .into_response(),
        Err(e) => creation_error(e),
    }
}

// ── Slots ──────────────────────────────────────────────────────

/// GET /api/v1/slots
pub async fn list_slots(State(state): State<ApiState>) -> impl IntoResponse {
    match state.slots.slots() {
        Ok(slots) => ApiResponse::ok(slots).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}
