//! Request dispatcher
//!
//! Sends an inbound request upstream with each active credential in slot
//! order until one produces a response that is not the exhaustion status.
//! The inbound body is split into one replay reader per credential so every
//! attempt sees the full body.

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};

use crate::error::ApiError;
use crate::services::pool::PoolManager;
use crate::services::replay::ReplayBody;
use crate::utils::mask_secret;

/// Connection-scoped headers that never cross the proxy
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Inbound headers minus hop-by-hop headers, `host`, and the caller's own
/// `authorization`
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name) && *name != header::HOST && *name != header::AUTHORIZATION)
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

pub struct Dispatcher {
    client: reqwest::Client,
    pool: PoolManager,
    exhausted_status: StatusCode,
}

impl Dispatcher {
    pub fn new(client: reqwest::Client, pool: PoolManager, exhausted_status: StatusCode) -> Self {
        Self {
            client,
            pool,
            exhausted_status,
        }
    }

    pub fn pool(&self) -> &PoolManager {
        &self.pool
    }

    /// Forward one request, failing over across credentials
    pub async fn handle_request(
        &self,
        target_url: &str,
        method: Method,
        headers: &HeaderMap,
        body: Body,
    ) -> Response {
        match self.dispatch(target_url, method, headers, body).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        }
    }

    async fn dispatch(
        &self,
        target_url: &str,
        method: Method,
        headers: &HeaderMap,
        body: Body,
    ) -> Result<Response, ApiError> {
        self.pool.initialize().await.map_err(|e| {
            tracing::error!(error = %e, "Credential pool could not be loaded");
            ApiError::PoolUnavailable(e.to_string())
        })?;

        let slots = self.pool.active_slots();
        if slots.is_empty() {
            let trigger = self.pool.provision_if_needed();
            tracing::warn!(trigger = ?trigger, "No active credentials; rejecting request");
            return Err(ApiError::NoCredentials);
        }

        let forwarded = forwardable_headers(headers);
        let readers = ReplayBody::split(body.into_data_stream(), slots.len());

        for (attempt, (slot, reader)) in slots.iter().zip(readers).enumerate() {
            let credential = mask_secret(&slot.token);
            let authorization = match HeaderValue::from_str(&format!("Bearer {}", slot.token)) {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(
                        slot = slot.index,
                        credential = %credential,
                        error = %err,
                        "Credential is not a valid header value; trying next credential"
                    );
                    continue;
                }
            };

            let mut request_headers = forwarded.clone();
            request_headers.insert(header::AUTHORIZATION, authorization);

            tracing::debug!(
                attempt = attempt + 1,
                slot = slot.index,
                credential = %credential,
                method = %method,
                url = %target_url,
                "Forwarding request upstream"
            );

            let result = self
                .client
                .request(method.clone(), target_url)
                .headers(request_headers)
                .body(reqwest::Body::wrap_stream(reader.into_stream()))
                .send()
                .await;

            let response = match result {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!(
                        slot = slot.index,
                        credential = %credential,
                        error = %err,
                        "Upstream transport error; trying next credential"
                    );
                    continue;
                }
            };

            if response.status() == self.exhausted_status {
                tracing::info!(
                    slot = slot.index,
                    credential = %credential,
                    status = response.status().as_u16(),
                    "Credential exhausted upstream; failing over"
                );
                self.pool.record_exhausted(slot.index, &slot.token);
                continue;
            }

            tracing::debug!(
                slot = slot.index,
                status = response.status().as_u16(),
                attempts = attempt + 1,
                "Relaying upstream response"
            );
            self.pool.provision_if_needed();
            return Ok(relay(response));
        }

        let trigger = self.pool.provision_if_needed();
        tracing::warn!(
            tried = slots.len(),
            active = self.pool.active_count(),
            trigger = ?trigger,
            "No credential produced a response"
        );
        Err(ApiError::CredentialsDepleted)
    }
}

/// Stream an upstream response back unchanged, minus hop-by-hop headers
fn relay(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let headers: HeaderMap = upstream
        .headers()
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::pool::PoolConfig;
    use crate::services::provisioner::testing::{wait_until, ScriptedProvisioner};
    use crate::services::tasks::TaskSupervisor;
    use crate::store::{CredentialStore, MemoryStore};
    use httpmock::{Method as MockMethod, MockServer};
    use std::sync::Arc;

    const KEY: &str = "pool";

    struct Harness {
        dispatcher: Dispatcher,
        provisioner: Arc<ScriptedProvisioner>,
    }

    async fn harness(persisted: &str, provisioner: ScriptedProvisioner) -> Harness {
        let store = Arc::new(MemoryStore::new());
        store.set(KEY, persisted).await.unwrap();
        let provisioner = Arc::new(provisioner);

        let pool = PoolManager::new(
            PoolConfig::new(1).with_storage_key(KEY),
            store,
            provisioner.clone(),
            TaskSupervisor::new(),
        );

        Harness {
            dispatcher: Dispatcher::new(reqwest::Client::new(), pool, StatusCode::PAYMENT_REQUIRED),
            provisioner,
        }
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_failover_on_exhausted_credential() {
        let server = MockServer::start_async().await;
        let k1 = server
            .mock_async(|when, then| {
                when.method(MockMethod::POST).path("/models/gpt2").header("authorization", "Bearer k1");
                then.status(402);
            })
            .await;
        let k2 = server
            .mock_async(|when, then| {
                when.method(MockMethod::POST).path("/models/gpt2").header("authorization", "Bearer k2");
                then.status(200).body("generated");
            })
            .await;
        let k3 = server
            .mock_async(|when, then| {
                when.method(MockMethod::POST).path("/models/gpt2").header("authorization", "Bearer k3");
                then.status(200);
            })
            .await;

        let h = harness(r#"["k1","k2","k3"]"#, ScriptedProvisioner::default()).await;
        let response = h
            .dispatcher
            .handle_request(&server.url("/models/gpt2"), Method::POST, &HeaderMap::new(), Body::from("{}"))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "generated");
        assert_eq!(k1.hits_async().await, 1);
        assert_eq!(k2.hits_async().await, 1);
        assert_eq!(k3.hits_async().await, 0);

        let pool = h.dispatcher.pool();
        assert_eq!(pool.active_count(), 2);
        assert_eq!(pool.active_slots()[0].token, "k2");
    }

    #[tokio::test]
    async fn test_body_replayed_to_next_credential() {
        let server = MockServer::start_async().await;
        let first = server
            .mock_async(|when, then| {
                when.method(MockMethod::POST)
                    .header("authorization", "Bearer k1")
                    .body(r#"{"inputs":"hello"}"#);
                then.status(402);
            })
            .await;
        let second = server
            .mock_async(|when, then| {
                when.method(MockMethod::POST)
                    .header("authorization", "Bearer k2")
                    .body(r#"{"inputs":"hello"}"#);
                then.status(200).body("ok");
            })
            .await;

        let h = harness(r#"["k1","k2"]"#, ScriptedProvisioner::default()).await;
        let response = h
            .dispatcher
            .handle_request(
                &server.url("/v1/chat"),
                Method::POST,
                &HeaderMap::new(),
                Body::from(r#"{"inputs":"hello"}"#),
            )
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_total_depletion() {
        let server = MockServer::start_async().await;
        let exhausted = server
            .mock_async(|when, then| {
                when.method(MockMethod::POST);
                then.status(402);
            })
            .await;

        let h = harness(r#"["k1","k2"]"#, ScriptedProvisioner::hanging()).await;
        let response = h
            .dispatcher
            .handle_request(&server.url("/x"), Method::POST, &HeaderMap::new(), Body::empty())
            .await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body_text(response).await.contains("All API keys depleted"));
        assert_eq!(exhausted.hits_async().await, 2);
        assert_eq!(h.dispatcher.pool().active_count(), 0);
        assert!(wait_until(|| h.provisioner.calls() == 1).await);
    }

    #[tokio::test]
    async fn test_empty_pool_fast_path() {
        let server = MockServer::start_async().await;
        let upstream = server
            .mock_async(|when, then| {
                when.any_request();
                then.status(200);
            })
            .await;

        let h = harness("[null,null]", ScriptedProvisioner::hanging()).await;
        let response = h
            .dispatcher
            .handle_request(&server.url("/x"), Method::POST, &HeaderMap::new(), Body::empty())
            .await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body_text(response).await.contains("No API keys available"));
        assert_eq!(upstream.hits_async().await, 0);

        assert!(wait_until(|| h.provisioner.calls() == 1).await);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(h.provisioner.calls(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_keeps_credentials() {
        let h = harness(r#"["k1","k2"]"#, ScriptedProvisioner::hanging()).await;
        let response = h
            .dispatcher
            .handle_request("http://127.0.0.1:1/unreachable", Method::POST, &HeaderMap::new(), Body::empty())
            .await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(h.dispatcher.pool().active_count(), 2);
    }

    #[tokio::test]
    async fn test_unusable_token_is_skipped() {
        let server = MockServer::start_async().await;
        let upstream = server
            .mock_async(|when, then| {
                when.method(MockMethod::POST).header("authorization", "Bearer k2");
                then.status(200).body("ok");
            })
            .await;

        let h = harness(r#"["bad\ntoken","k2"]"#, ScriptedProvisioner::hanging()).await;
        let response = h
            .dispatcher
            .handle_request(&server.url("/x"), Method::POST, &HeaderMap::new(), Body::from("{}"))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
        upstream.assert_async().await;
        assert_eq!(h.dispatcher.pool().active_count(), 2);
    }

    #[tokio::test]
    async fn test_other_errors_pass_through() {
        let server = MockServer::start_async().await;
        let upstream = server
            .mock_async(|when, then| {
                when.method(MockMethod::POST).header("authorization", "Bearer k1");
                then.status(503)
                    .header("x-upstream", "loading")
                    .body(r#"{"error":"Model is loading"}"#);
            })
            .await;

        let h = harness(r#"["k1","k2"]"#, ScriptedProvisioner::default()).await;
        let response = h
            .dispatcher
            .handle_request(&server.url("/x"), Method::POST, &HeaderMap::new(), Body::from("{}"))
            .await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["x-upstream"], "loading");
        assert_eq!(body_text(response).await, r#"{"error":"Model is loading"}"#);
        upstream.assert_async().await;
        assert_eq!(h.dispatcher.pool().active_count(), 2);
    }

    #[tokio::test]
    async fn test_unloadable_pool_is_unavailable() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let pool = PoolManager::new(
            PoolConfig::new(1).with_storage_key(KEY),
            store,
            Arc::new(ScriptedProvisioner::default()),
            TaskSupervisor::new(),
        );
        let dispatcher = Dispatcher::new(reqwest::Client::new(), pool, StatusCode::PAYMENT_REQUIRED);

        let response = dispatcher
            .handle_request("http://127.0.0.1:1/x", Method::POST, &HeaderMap::new(), Body::empty())
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body_text(response).await.contains("storage_error"));
    }

    #[test]
    fn test_forwardable_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("relay.local"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer caller"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("x-use-cache", HeaderValue::from_static("false"));

        let forwarded = forwardable_headers(&headers);
        assert_eq!(forwarded.len(), 2);
        assert_eq!(forwarded[header::CONTENT_TYPE], "application/json");
        assert_eq!(forwarded["x-use-cache"], "false");
    }
}
