use axum::{extract::State, http::StatusCode, Json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::AppState;
use request_orchestrator::{
    budget::BudgetSnapshot, identity::IdentitySnapshot, observability::MetricsSnapshot,
    signature::SignaturePoolSnapshot, HttpMethod, Payload, RequestOptions,
};

/// Largest batch accepted by `/v1/requests/batch`
const MAX_BATCH_SIZE: usize = 50;

/// Body of `POST /v1/requests`
#[derive(Debug, Clone, serde::Deserialize)]
pub struct OrchestrateRequest {
    pub endpoint: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl OrchestrateRequest {
    fn validate(&self) -> Result<(), (StatusCode, String)> {
        if self.endpoint.trim().is_empty() {
            return Err((StatusCode::BAD_REQUEST, "endpoint must not be empty".to_string()));
        }
        if self.timeout_ms == Some(0) {
            return Err((StatusCode::BAD_REQUEST, "timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    fn into_parts(self) -> (String, RequestOptions) {
        let options = RequestOptions {
            method: self.method,
            headers: self.headers,
            body: self.body,
            timeout: self.timeout_ms.map(Duration::from_millis),
        };
        (self.endpoint, options)
    }
}

/// POST /v1/requests - Orchestrate one upstream call
///
/// Always answers 200 with a payload once the request is valid; the
/// payload's `source` tells live data from a fallback.
pub async fn create_request(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OrchestrateRequest>,
) -> Result<Json<Payload>, (StatusCode, String)> {
    req.validate()?;
    let (endpoint, options) = req.into_parts();

    info!("Orchestrating {} {}", options.method.as_str(), endpoint);
    Ok(Json(state.orchestrator.orchestrate(&endpoint, options).await))
}

#[derive(Debug, serde::Deserialize)]
pub struct BatchRequest {
    pub requests: Vec<OrchestrateRequest>,
}

#[derive(Debug, serde::Serialize)]
pub struct BatchResponse {
    pub payloads: Vec<Payload>,
    pub live: usize,
    pub fallback: usize,
}

/// POST /v1/requests/batch - Orchestrate several calls concurrently
pub async fn create_requests_batch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, (StatusCode, String)> {
    if req.requests.len() > MAX_BATCH_SIZE {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("batch holds {} requests, limit is {}", req.requests.len(), MAX_BATCH_SIZE),
        ));
    }
    for request in &req.requests {
        request.validate()?;
    }

    let calls = req.requests.into_iter().map(|request| {
        let orchestrator = state.orchestrator.clone();
        async move {
            let (endpoint, options) = request.into_parts();
            orchestrator.orchestrate(&endpoint, options).await
        }
    });
    let payloads = futures::future::join_all(calls).await;

    let live = payloads.iter().filter(|p| p.is_live()).count();
    Ok(Json(BatchResponse {
        fallback: payloads.len() - live,
        live,
        payloads,
    }))
}

#[derive(Debug, serde::Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_ratio: f64,
    pub identities: Vec<IdentitySnapshot>,
    pub signatures: SignaturePoolSnapshot,
    pub budgets: Vec<BudgetSnapshot>,
}

/// GET /health - Identity pool health
///
/// `healthy` while at least half of the identities are active.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let orchestrator = &state.orchestrator;
    let identities = orchestrator.pool().snapshot().await;
    let active_ratio = orchestrator.pool().active_ratio().await;

    Json(HealthResponse {
        status: if active_ratio >= 0.5 { "healthy".to_string() } else { "degraded".to_string() },
        active_ratio,
        identities,
        signatures: orchestrator.signatures().snapshot(),
        budgets: orchestrator.budgets().snapshot().await,
    })
}

/// GET /metrics - Counter snapshot
pub async fn metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.orchestrator.metrics().snapshot().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use request_orchestrator::{
        config::IdentityConfig, OrchestratorConfig, OutboundRequest, RequestOrchestrator, Transport,
        TransportError, TransportResponse,
    };

    struct EchoTransport;

    #[async_trait::async_trait]
    impl Transport for EchoTransport {
        async fn send(
            &self,
            identity: &request_orchestrator::Identity,
            request: OutboundRequest,
        ) -> Result<TransportResponse, TransportError> {
            if request.url.contains("down") {
                return Err(TransportError::Connect("refused".to_string()));
            }
            let body = serde_json::json!({ "identity": identity.id, "url": request.url });
            Ok(TransportResponse::new(200, body.to_string()))
        }
    }

    fn state() -> Arc<AppState> {
        let config = OrchestratorConfig {
            identities: vec![IdentityConfig::new("a", "test"), IdentityConfig::new("b", "test")],
            upstream_base_url: Some("http://upstream.test".to_string()),
            backoff: request_orchestrator::config::BackoffConfig {
                base_delay_ms: 1,
                max_jitter_ms: 0,
                ..Default::default()
            },
            ..OrchestratorConfig::default()
        };
        let orchestrator = RequestOrchestrator::builder(config)
            .with_transport(Arc::new(EchoTransport))
            .with_seed(3)
            .build()
            .unwrap();
        Arc::new(AppState { orchestrator })
    }

    fn request(endpoint: &str) -> OrchestrateRequest {
        OrchestrateRequest {
            endpoint: endpoint.to_string(),
            method: HttpMethod::Get,
            headers: HashMap::new(),
            body: None,
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn test_create_request_returns_live_payload() {
        let Json(payload) = create_request(State(state()), Json(request("/ping"))).await.unwrap();
        assert!(payload.is_live());
        assert_eq!(payload.data["url"], "http://upstream.test/ping");
    }

    #[tokio::test]
    async fn test_empty_endpoint_rejected() {
        let err = create_request(State(state()), Json(request("  "))).await.unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_batch_mixes_live_and_fallback() {
        let batch = BatchRequest {
            requests: vec![request("/ping"), request("/down/simple/price?ids=bitcoin")],
        };
        let Json(response) = create_requests_batch(State(state()), Json(batch)).await.unwrap();

        assert_eq!(response.live, 1);
        assert_eq!(response.fallback, 1);
        assert!(response.payloads[1].data.get("bitcoin").is_some());
    }

    #[tokio::test]
    async fn test_oversized_batch_rejected() {
        let batch = BatchRequest {
            requests: (0..=MAX_BATCH_SIZE).map(|i| request(&format!("/p/{}", i))).collect(),
        };
        let err = create_requests_batch(State(state()), Json(batch)).await.unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_reports_pool() {
        let state = state();
        let Json(health) = health_check(State(state.clone())).await;
        assert_eq!(health.status, "healthy");
        assert_eq!(health.identities.len(), 2);
        assert_eq!(health.signatures.generation, 1);
        assert!((health.active_ratio - 1.0).abs() < 1e-9);

        state.orchestrator.pool().block("a").await;
        let Json(health) = health_check(State(state.clone())).await;
        assert_eq!(health.status, "healthy");
        assert!((health.active_ratio - 0.5).abs() < 1e-9);

        state.orchestrator.pool().block("b").await;
        let Json(health) = health_check(State(state)).await;
        assert_eq!(health.status, "degraded");
        assert_eq!(health.active_ratio, 0.0);
    }
}
