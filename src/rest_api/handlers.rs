//! HTTP handlers for the REST API

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use tracing::{error, instrument};

use super::dto::{ErrorResponse, HealthResponse, ReadyResponse};
use super::server::ApiState;

/// Liveness: the process is up and serving
#[instrument]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness: controllers are running, which implies leadership when
/// leader election is enabled
#[instrument(skip(state))]
pub async fn readyz(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<ReadyResponse>) {
    let ready = state.controllers_started.load(Ordering::Relaxed);
    let leader = state.is_leader.load(Ordering::Relaxed);
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(ReadyResponse {
            ready,
            leader,
            controllers: state.controllers.clone(),
        }),
    )
}

pub async fn metrics() -> Result<String, (StatusCode, Json<ErrorResponse>)> {
    crate::controller::metrics::encode_metrics().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new("encode_failed", &e.to_string())),
        )
    })
}
