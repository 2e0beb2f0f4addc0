//! HTTP request handlers.

use super::AppState;
use crate::db::{DbError, DeviceStore, DeviceUpdate, NewDevice};
use crate::scheduler::PollError;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;

const DEFAULT_PAGE_LIMIT: u32 = 100;
const MAX_PAGE_LIMIT: u32 = 1000;

fn page_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
}

fn is_valid_protocol(protocol: &str) -> bool {
    ["ssh", "telnet"].contains(&protocol)
}

/// Malformed or incomplete JSON bodies are a bad request.
fn json_rejection_response(rejection: JsonRejection) -> Response {
    (StatusCode::BAD_REQUEST, rejection.body_text()).into_response()
}

fn db_error_response(e: DbError) -> Response {
    match e {
        DbError::NotFound => (StatusCode::NOT_FOUND, "Device not found").into_response(),
        DbError::InvalidData(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
        other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response(),
    }
}

fn poll_error_response(e: PollError) -> Response {
    match e {
        PollError::DeviceNotFound(_) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
        PollError::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
        PollError::Store(e) => db_error_response(e),
    }
}

// ============================================================================
// API: Device registry
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub skip: u32,
    #[serde(default)]
    pub limit: Option<u32>,
}

pub async fn handle_list_devices(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    match state.store.list_devices_page(query.skip, page_limit(query.limit)) {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => db_error_response(e),
    }
}

pub async fn handle_get_device(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.store.get_device(id) {
        Ok(Some(device)) => Json(device).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Device not found").into_response(),
        Err(e) => db_error_response(e),
    }
}

pub async fn handle_create_device(
    State(state): State<AppState>,
    payload: Result<Json<NewDevice>, JsonRejection>,
) -> impl IntoResponse {
    let Json(req) = match payload {
        Ok(req) => req,
        Err(rejection) => return json_rejection_response(rejection),
    };
    if !is_valid_protocol(&req.protocol) {
        return (StatusCode::BAD_REQUEST, "Invalid protocol").into_response();
    }

    match state.store.add_device(&req) {
        Ok(device) => {
            tracing::info!("Registered device {} ({})", device.name, device.address);
            (StatusCode::CREATED, Json(device)).into_response()
        }
        Err(e) => db_error_response(e),
    }
}

pub async fn handle_update_device(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Result<Json<DeviceUpdate>, JsonRejection>,
) -> impl IntoResponse {
    let Json(req) = match payload {
        Ok(req) => req,
        Err(rejection) => return json_rejection_response(rejection),
    };
    if req.protocol.as_deref().is_some_and(|p| !is_valid_protocol(p)) {
        return (StatusCode::BAD_REQUEST, "Invalid protocol").into_response();
    }

    match state.store.update_device(id, &req) {
        Ok(device) => {
            tracing::info!("Updated device {} ({})", device.name, device.address);
            Json(device).into_response()
        }
        Err(e) => db_error_response(e),
    }
}

pub async fn handle_delete_device(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.store.delete_device(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => db_error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<u32>,
}

pub async fn handle_poll_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    match state.store.get_device(id) {
        Ok(Some(_)) => {}
        Ok(None) => return (StatusCode::NOT_FOUND, "Device not found").into_response(),
        Err(e) => return db_error_response(e),
    }

    match state.store.get_poll_history(id, page_limit(query.limit)) {
        Ok(history) => Json(history).into_response(),
        Err(e) => db_error_response(e),
    }
}

// ============================================================================
// API: Polling
// ============================================================================

pub async fn handle_poll_device(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.poller.poll_one(id).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => poll_error_response(e),
    }
}

pub async fn handle_poll_all(State(state): State<AppState>) -> impl IntoResponse {
    let cancel = state.shutdown.child_token();
    match state.poller.poll_all(&cancel).await {
        Ok(batch) => Json(batch).into_response(),
        Err(e) => {
            tracing::error!("Batch poll request failed: {}", e);
            poll_error_response(e)
        }
    }
}

// ============================================================================
// API: Connectivity checks
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PingRequest {
    #[serde(alias = "ip_address")]
    pub address: String,
}

pub async fn handle_ping(
    State(state): State<AppState>,
    payload: Result<Json<PingRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(req) = match payload {
        Ok(req) => req,
        Err(rejection) => return json_rejection_response(rejection),
    };
    if req.address.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "Address must not be empty").into_response();
    }
    Json(state.poller.ping_only(&req.address).await).into_response()
}

pub async fn handle_test_connection(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.poller.test_connection(id).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => poll_error_response(e),
    }
}
