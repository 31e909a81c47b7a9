//! Health check endpoints
//!
//! Probes for monitoring and container orchestration, plus a pool status view.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::server::state::AppState;
use crate::services::PoolSnapshot;

/// Response for the main health check endpoint
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub environment: String,
    pub uptime_seconds: u64,
}

/// Response for readiness probe
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub checks: ReadinessChecks,
}

/// Individual readiness checks
#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub config_loaded: bool,
    pub pool_loaded: bool,
    pub active_keys: usize,
}

/// Response for liveness probe
#[derive(Serialize)]
pub struct LivenessResponse {
    pub alive: bool,
}

/// Response for the pool status endpoint
#[derive(Serialize)]
pub struct PoolStatusResponse {
    pub backend: String,
    pub storage_key: String,
    #[serde(flatten)]
    pub pool: PoolSnapshot,
}

/// Main health check endpoint
///
/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: state.settings.app_version.clone(),
        environment: state.settings.environment.to_string(),
        uptime_seconds: state.uptime_seconds(),
    })
}

/// Readiness probe endpoint
///
/// Ready once the credential pool has been loaded from the store. An empty
/// pool is still ready: requests get a 503 while provisioning catches up.
///
/// GET /ready
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let checks = ReadinessChecks {
        config_loaded: true,
        pool_loaded: state.pool.is_initialized(),
        active_keys: state.pool.active_count(),
    };

    let ready = checks.config_loaded && checks.pool_loaded;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    if !ready {
        tracing::warn!(checks = ?checks, "Service not ready");
    }

    (status, Json(ReadinessResponse { ready, checks }))
}

/// Liveness probe endpoint
///
/// GET /liveness
pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { alive: true })
}

/// Pool size, provisioning state, and background failures. Never includes
/// credentials.
///
/// GET /pool/status
pub async fn pool_status(State(state): State<AppState>) -> Json<PoolStatusResponse> {
    Json(PoolStatusResponse {
        backend: state.settings.store.backend.to_string(),
        storage_key: state.settings.pool.storage_key.clone(),
        pool: state.pool.snapshot(),
    })
}
