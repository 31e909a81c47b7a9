//! Application routing
//!
//! Probes and pool status have their own routes; everything else falls
//! through to the proxy.

use axum::{http::HeaderName, middleware, routing::get, Router};
use tower_http::cors::{Any, CorsLayer};

use crate::api::{health, proxy};
use crate::middleware::logging::{log_request, REQUEST_ID_HEADER, TRACE_ID_HEADER};
use crate::server::state::AppState;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    let health_routes = Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness))
        .route("/liveness", get(health::liveness))
        .route("/pool/status", get(health::pool_status));

    Router::new()
        // `GET /` is the banner; any other method on `/` is proxied
        .route("/", get(proxy::banner).fallback(proxy::forward))
        .merge(health_routes)
        .fallback(proxy::forward)
        // Layer order: last added = outermost = runs first
        .layer(create_cors_layer())
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

/// Permissive CORS with the trace headers exposed
fn create_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static(TRACE_ID_HEADER),
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
}
