//! Axum request handlers for the admin API.

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use barrier::{BarrierError, KeySummary, RotationEvent, DEFAULT_HISTORY_LIMIT};
use common::{
    protocol::{
        BarrierKeysStatusResponse, ContentKeysStatusResponse, ErrorResponse, HealthResponse,
        KeyStatus, RotateContentKeyResponse, RotateKeyResponse, RotateRequest,
        RotationEventResponse, RotationHistoryResponse,
    },
    ServiceError,
};
use serde::Deserialize;
use tracing::{error, warn};

use super::state::AppState;

/// Upper bound on `GET /barrier/rotations?limit=`.
pub const MAX_HISTORY_LIMIT: usize = 1000;

/// Error body plus status, built from any barrier or request failure.
#[derive(Debug)]
pub struct ApiError(ServiceError);

impl From<BarrierError> for ApiError {
    fn from(e: BarrierError) -> Self {
        Self(ServiceError::from(e))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self(ServiceError::BadRequest(e.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(code = self.0.code(), error = %self.0, "request failed");
        } else {
            warn!(code = self.0.code(), error = %self.0, "request rejected");
        }
        (status, Json(ErrorResponse::from(&self.0))).into_response()
    }
}

fn key_status(summary: &KeySummary) -> KeyStatus {
    KeyStatus {
        uuid: summary.id.to_string(),
        created_at: summary.created_at.timestamp_millis(),
        updated_at: summary.updated_at.timestamp_millis(),
    }
}

fn rotate_key_response(event: RotationEvent) -> RotateKeyResponse {
    RotateKeyResponse {
        old_key_uuid: event.old_key_uuid.map(|id| id.to_string()).unwrap_or_default(),
        new_key_uuid: event.new_key_uuid.to_string(),
        reason: event.reason,
        rotated_at: event.rotated_at.timestamp_millis(),
    }
}

/// `POST /barrier/rotate/root`
pub async fn rotate_root(
    State(state): State<AppState>,
    body: Result<Json<RotateRequest>, JsonRejection>,
) -> Result<Json<RotateKeyResponse>, ApiError> {
    let Json(req) = body?;
    let event = state.rotation.rotate_root(&req.reason).await?;
    Ok(Json(rotate_key_response(event)))
}

/// `POST /barrier/rotate/intermediate`
pub async fn rotate_intermediate(
    State(state): State<AppState>,
    body: Result<Json<RotateRequest>, JsonRejection>,
) -> Result<Json<RotateKeyResponse>, ApiError> {
    let Json(req) = body?;
    let event = state.rotation.rotate_intermediate(&req.reason).await?;
    Ok(Json(rotate_key_response(event)))
}

/// `POST /barrier/rotate/content`: elastic; the response has no
/// `old_key_uuid`.
pub async fn rotate_content(
    State(state): State<AppState>,
    body: Result<Json<RotateRequest>, JsonRejection>,
) -> Result<Json<RotateContentKeyResponse>, ApiError> {
    let Json(req) = body?;
    let event = state.rotation.rotate_content(&req.reason).await?;
    Ok(Json(RotateContentKeyResponse {
        new_key_uuid: event.new_key_uuid.to_string(),
        reason: event.reason,
        rotated_at: event.rotated_at.timestamp_millis(),
    }))
}

/// `GET /barrier/keys/status`
pub async fn keys_status(
    State(state): State<AppState>,
) -> Result<Json<BarrierKeysStatusResponse>, ApiError> {
    let status = state.rotation.status().await?;
    Ok(Json(BarrierKeysStatusResponse {
        root_key: key_status(&status.root),
        intermediate_key: key_status(&status.intermediate),
    }))
}

/// `GET /barrier/keys/content`: active content keys, preferred first.
pub async fn content_keys(
    State(state): State<AppState>,
) -> Result<Json<ContentKeysStatusResponse>, ApiError> {
    let keys = state.rotation.content_status().await?;
    Ok(Json(ContentKeysStatusResponse {
        content_keys: keys.iter().map(key_status).collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// `GET /barrier/rotations?limit=N`
pub async fn rotations(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<RotationHistoryResponse>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    let events = state.rotation.rotation_history(limit).await?;
    Ok(Json(RotationHistoryResponse {
        rotations: events
            .into_iter()
            .map(|e| RotationEventResponse {
                tier: e.tier.to_string(),
                old_key_uuid: e.old_key_uuid.map(|id| id.to_string()),
                new_key_uuid: e.new_key_uuid.to_string(),
                reason: e.reason,
                rotated_at: e.rotated_at.timestamp_millis(),
            })
            .collect(),
    }))
}

/// `GET /health`: liveness and readiness check.
///
/// Returns `200 OK` once the barrier has bootstrapped and `503 Service
/// Unavailable` before that or after shutdown.
pub async fn health(State(state): State<AppState>) -> Response {
    let barrier_ready = state.barrier.is_ready().await;
    let active_content_keys = state.barrier.active_content_count().await;

    let (status_code, status_str) = if barrier_ready {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    let body = HealthResponse {
        status: status_str.into(),
        barrier_ready,
        active_content_keys,
    };
    (status_code, Json(body)).into_response()
}

/// Catch-all 404 handler.
pub async fn not_found() -> impl IntoResponse {
    let err = ErrorResponse::new("not_found", "the requested resource does not exist");
    (StatusCode::NOT_FOUND, Json(err))
}
