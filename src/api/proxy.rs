//! Proxy endpoints
//!
//! Every path without its own route lands in [`forward`] and is sent to the
//! upstream base URL with the same path and query.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Method, Uri},
    response::{IntoResponse, Response},
};

use crate::error::ApiError;
use crate::server::state::AppState;

/// Forward a request upstream through the credential pool
pub async fn forward(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let upstream = &state.settings.upstream;
    if !upstream.allows(&method) {
        return ApiError::MethodNotAllowed(method.to_string()).into_response();
    }

    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let target_url = upstream.target_url(path_and_query);

    state
        .dispatcher
        .handle_request(&target_url, method, &headers, body)
        .await
}

/// Plain-text banner on `GET /`
///
/// GET /
pub async fn banner(State(state): State<AppState>) -> String {
    format!(
        "{} {} relaying to {}",
        state.settings.app_name, state.settings.app_version, state.settings.upstream.base_url
    )
}
