//! Single-attempt execution against one identity
//!
//! The executor turns an endpoint plus a chosen identity and signature into
//! one outbound call, classifies the result and applies its health effects.
//! It never retries; that is the orchestrator's job.

use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::cancel::CancelToken;
use crate::config::IdentityConfig;
use crate::fallback::ResultCache;
use crate::identity::{Identity, IdentityPool};
use crate::observability::Observer;
use crate::signature::Signature;
use crate::types::{
    AttemptError, AttemptOutcome, AttemptRecord, HttpMethod, OrchestratorError, RequestOptions,
    Result,
};

/// Longest upstream error body kept in an attempt error
const ERROR_BODY_LIMIT: usize = 256;

/// Fully resolved outbound call
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<serde_json::Value>,
    pub timeout: Duration,
}

/// Raw upstream answer, before classification
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    /// `Retry-After` in seconds, when the upstream sent one
    pub retry_after: Option<u64>,
    pub body: String,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            retry_after: None,
            body: body.into(),
        }
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after = Some(secs);
        self
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Connection could not be established or was torn down
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Other(String),
}

/// Network seam between the executor and the upstream
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        identity: &Identity,
        request: OutboundRequest,
    ) -> std::result::Result<TransportResponse, TransportError>;
}

/// reqwest transport with one client per identity.
///
/// Each client carries the identity's proxy and local bind address, so the
/// identity decides which egress path a request takes.
pub struct HttpTransport {
    clients: HashMap<String, Client>,
    default_client: Client,
}

impl HttpTransport {
    pub fn new(identities: &[IdentityConfig]) -> Result<Self> {
        let mut clients = HashMap::new();
        for identity in identities {
            clients.insert(identity.id.clone(), Self::build_client(identity)?);
        }

        let default_client = Self::client_builder()
            .build()
            .map_err(|e| OrchestratorError::HttpClient(e.to_string()))?;

        Ok(Self {
            clients,
            default_client,
        })
    }

    fn client_builder() -> reqwest::ClientBuilder {
        Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
    }

    fn build_client(identity: &IdentityConfig) -> Result<Client> {
        let mut builder = Self::client_builder();

        if let Some(proxy_url) = &identity.proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| OrchestratorError::InvalidIdentity {
                id: identity.id.clone(),
                reason: format!("invalid proxy url: {}", e),
            })?;
            builder = builder.proxy(proxy);
        }
        if let Some(addr) = identity.local_address {
            builder = builder.local_address(addr);
        }

        builder
            .build()
            .map_err(|e| OrchestratorError::HttpClient(format!("{}: {}", identity.id, e)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        identity: &Identity,
        request: OutboundRequest,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let client = self.clients.get(&identity.id).unwrap_or(&self.default_client);

        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let mut builder = client.request(method, &request.url).timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(classify_reqwest_error)?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response.text().await.map_err(classify_reqwest_error)?;

        Ok(TransportResponse {
            status,
            retry_after,
            body,
        })
    }
}

fn classify_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        return TransportError::Timeout;
    }
    if error.is_connect() || has_connection_io_error(&error) {
        return TransportError::Connect(error.to_string());
    }
    TransportError::Other(error.to_string())
}

fn has_connection_io_error(error: &reqwest::Error) -> bool {
    use std::io::ErrorKind;

    let mut source = std::error::Error::source(error);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        source = err.source();
    }
    false
}

/// Position of an attempt within its call
#[derive(Debug, Clone, Copy)]
pub struct AttemptMeta {
    /// 1-based
    pub attempt: u32,
    /// Backoff awaited before this attempt
    pub delay: Duration,
}

/// Performs one attempt and applies its health effects
pub struct RequestExecutor {
    pool: Arc<IdentityPool>,
    transport: Arc<dyn Transport>,
    cache: Arc<ResultCache>,
    observer: Observer,
    base_url: Option<Url>,
    default_timeout: Duration,
}

impl RequestExecutor {
    pub fn new(
        pool: Arc<IdentityPool>,
        transport: Arc<dyn Transport>,
        cache: Arc<ResultCache>,
        observer: Observer,
        base_url: Option<&str>,
        default_timeout: Duration,
    ) -> Result<Self> {
        let base_url = base_url
            .map(|raw| {
                Url::parse(raw).map_err(|e| {
                    OrchestratorError::Config(format!("invalid upstream_base_url {}: {}", raw, e))
                })
            })
            .transpose()?;

        Ok(Self {
            pool,
            transport,
            cache,
            observer,
            base_url,
            default_timeout,
        })
    }

    /// Execute `endpoint` once through `identity`.
    ///
    /// Outcome effects:
    /// - 2xx: cache updated, success recorded
    /// - 429: failure recorded, identity cooled (honouring `Retry-After`)
    /// - connection failure: failure recorded
    /// - anything else, including timeouts and bad JSON: failure recorded
    ///
    /// A cancelled attempt returns [`AttemptError::Cancelled`] and leaves
    /// identity health untouched.
    pub async fn execute(
        &self,
        endpoint: &str,
        identity: &Identity,
        signature: &Signature,
        options: &RequestOptions,
        meta: AttemptMeta,
        cancel: &CancelToken,
    ) -> std::result::Result<serde_json::Value, AttemptError> {
        let started = Instant::now();

        let (result, status) = match self.build_request(endpoint, signature, options) {
            Ok(request) => {
                let timeout = request.timeout;
                let response = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(endpoint, identity = %identity.id, "attempt cancelled");
                        return Err(AttemptError::Cancelled);
                    }
                    r = tokio::time::timeout(timeout, self.transport.send(identity, request)) => r,
                };

                match response {
                    Err(_) | Ok(Err(TransportError::Timeout)) => (
                        Err(AttemptError::Other(format!("timed out after {}ms", timeout.as_millis()))),
                        None,
                    ),
                    Ok(Err(TransportError::Connect(msg))) => (Err(AttemptError::Network(msg)), None),
                    Ok(Err(TransportError::Other(msg))) => (Err(AttemptError::Other(msg)), None),
                    Ok(Ok(response)) => (classify_response(&response), Some(response.status)),
                }
            }
            Err(reason) => (Err(AttemptError::Other(reason)), None),
        };

        self.apply_health(endpoint, identity, &result).await;

        let outcome = match &result {
            Ok(_) => AttemptOutcome::Success,
            Err(e) => e.outcome().unwrap_or(AttemptOutcome::OtherError),
        };
        self.observer
            .attempt(AttemptRecord {
                endpoint: endpoint.to_string(),
                attempt: meta.attempt,
                identity_id: identity.id.clone(),
                signature_id: signature.id.clone(),
                delay_ms: meta.delay.as_millis() as u64,
                outcome,
                status,
                latency_ms: started.elapsed().as_millis() as u64,
            })
            .await;

        result
    }

    async fn apply_health(
        &self,
        endpoint: &str,
        identity: &Identity,
        result: &std::result::Result<serde_json::Value, AttemptError>,
    ) {
        match result {
            Ok(data) => {
                self.cache.store(endpoint, data.clone()).await;
                self.pool.record_outcome(&identity.id, true).await;
            }
            Err(AttemptError::RateLimited { retry_after }) => {
                warn!(endpoint, identity = %identity.id, ?retry_after, "rate limited");
                self.pool.record_rate_limited(&identity.id, *retry_after).await;
            }
            Err(AttemptError::Network(msg)) => {
                warn!(endpoint, identity = %identity.id, "network error: {}", msg);
                self.pool.record_network_error(&identity.id).await;
            }
            Err(AttemptError::Other(msg)) => {
                debug!(endpoint, identity = %identity.id, "attempt failed: {}", msg);
                self.pool.record_outcome(&identity.id, false).await;
            }
            Err(AttemptError::Cancelled) => {}
        }
    }

    fn build_request(
        &self,
        endpoint: &str,
        signature: &Signature,
        options: &RequestOptions,
    ) -> std::result::Result<OutboundRequest, String> {
        let url = self.resolve(endpoint)?;

        // Signature template, then client identifier, then caller overrides
        let mut headers = signature.headers.clone();
        headers.insert("User-Agent".to_string(), signature.client_identifier.clone());
        for (name, value) in &options.headers {
            headers.retain(|existing, _| !existing.eq_ignore_ascii_case(name));
            headers.insert(name.clone(), value.clone());
        }

        Ok(OutboundRequest {
            method: options.method,
            url: url.to_string(),
            headers,
            body: options.body.clone(),
            timeout: options.timeout.unwrap_or(self.default_timeout),
        })
    }

    fn resolve(&self, endpoint: &str) -> std::result::Result<Url, String> {
        if let Ok(url) = Url::parse(endpoint) {
            return match url.scheme() {
                "http" | "https" => Ok(url),
                other => Err(format!("unroutable endpoint {}: unsupported scheme {}", endpoint, other)),
            };
        }

        let Some(base) = &self.base_url else {
            return Err(format!("unroutable endpoint {}: no upstream base url", endpoint));
        };
        let joined = format!(
            "{}/{}",
            base.as_str().trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        );
        Url::parse(&joined).map_err(|e| format!("unroutable endpoint {}: {}", endpoint, e))
    }
}

fn classify_response(response: &TransportResponse) -> std::result::Result<serde_json::Value, AttemptError> {
    match response.status {
        429 => Err(AttemptError::RateLimited {
            retry_after: response.retry_after,
        }),
        200..=299 => {
            let body = response.body.trim();
            if body.is_empty() {
                return Ok(serde_json::json!({}));
            }
            serde_json::from_str(body).map_err(|e| AttemptError::Other(format!("invalid JSON: {}", e)))
        }
        status => {
            let mut snippet: String = response.body.chars().take(ERROR_BODY_LIMIT).collect();
            if snippet.len() < response.body.len() {
                snippet.push_str("...");
            }
            Err(AttemptError::Other(format!("HTTP {}: {}", status, snippet)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CooldownConfig, HealthConfig, SignatureConfig};
    use crate::identity::IdentityState;
    use crate::observability::{metrics, OrchestratorEvent};
    use crate::signature::SignatureGenerator;
    use serde_json::json;
    use std::sync::Mutex;

    /// Answers every request with the same response after an optional delay
    struct FixedTransport {
        response: std::result::Result<TransportResponse, TransportError>,
        delay: Duration,
        seen: Mutex<Vec<OutboundRequest>>,
    }

    impl FixedTransport {
        fn new(response: std::result::Result<TransportResponse, TransportError>) -> Self {
            Self {
                response,
                delay: Duration::ZERO,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for FixedTransport {
        async fn send(
            &self,
            _identity: &Identity,
            request: OutboundRequest,
        ) -> std::result::Result<TransportResponse, TransportError> {
            self.seen.lock().unwrap().push(request);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.response.clone()
        }
    }

    struct Fixture {
        pool: Arc<IdentityPool>,
        cache: Arc<ResultCache>,
        observer: Observer,
        transport: Arc<FixedTransport>,
        executor: RequestExecutor,
        signature: Signature,
    }

    fn fixture(transport: FixedTransport) -> Fixture {
        let pool = Arc::new(IdentityPool::new(
            &[IdentityConfig::new("a", "test")],
            HealthConfig::default(),
            CooldownConfig::default(),
        ));
        let cache = Arc::new(ResultCache::new());
        let observer = Observer::new();
        let transport = Arc::new(transport);
        let executor = RequestExecutor::new(
            pool.clone(),
            transport.clone(),
            cache.clone(),
            observer.clone(),
            Some("http://upstream.test/api/v3"),
            Duration::from_secs(20),
        )
        .unwrap();
        let signature = SignatureGenerator::seeded(SignatureConfig::default(), 1)
            .unwrap()
            .pick_random();

        Fixture {
            pool,
            cache,
            observer,
            transport,
            executor,
            signature,
        }
    }

    fn first() -> AttemptMeta {
        AttemptMeta {
            attempt: 1,
            delay: Duration::ZERO,
        }
    }

    impl Fixture {
        async fn run(&self, endpoint: &str, options: &RequestOptions) -> std::result::Result<serde_json::Value, AttemptError> {
            let identity = self.pool.get("a").await.unwrap();
            self.executor
                .execute(endpoint, &identity, &self.signature, options, first(), &CancelToken::never())
                .await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_updates_cache_and_health() {
        let f = fixture(FixedTransport::new(Ok(TransportResponse::new(200, r#"{"ok":true}"#))));
        let data = f.run("/ping", &RequestOptions::get()).await.unwrap();

        assert_eq!(data, json!({"ok": true}));
        assert_eq!(f.cache.get("/ping").await.unwrap().data, data);
        let a = f.pool.get("a").await.unwrap();
        assert!((a.success_rate() - 0.92).abs() < 1e-9);
        assert_eq!(f.transport.seen.lock().unwrap()[0].url, "http://upstream.test/api/v3/ping");
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_body_becomes_empty_object() {
        let f = fixture(FixedTransport::new(Ok(TransportResponse::new(204, ""))));
        assert_eq!(f.run("/ping", &RequestOptions::get()).await.unwrap(), json!({}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_cools_identity_for_retry_after() {
        let f = fixture(FixedTransport::new(Ok(
            TransportResponse::new(429, "slow down").with_retry_after(45)
        )));
        let mut events = f.observer.subscribe();

        let err = f.run("/ping", &RequestOptions::get()).await.unwrap_err();
        assert_eq!(err, AttemptError::RateLimited { retry_after: Some(45) });
        assert_eq!(f.pool.state_of("a").await, Some(IdentityState::Cooling));

        tokio::time::advance(Duration::from_secs(44)).await;
        assert_eq!(f.pool.state_of("a").await, Some(IdentityState::Cooling));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(f.pool.state_of("a").await, Some(IdentityState::Active));

        match events.recv().await.unwrap() {
            OrchestratorEvent::Attempt(record) => {
                assert_eq!(record.outcome, AttemptOutcome::RateLimited);
                assert_eq!(record.status, Some(429));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_is_network_error_without_cooldown() {
        let f = fixture(FixedTransport::new(Err(TransportError::Connect("refused".into()))));
        let err = f.run("/ping", &RequestOptions::get()).await.unwrap_err();

        assert!(matches!(err, AttemptError::Network(_)));
        assert_eq!(f.pool.state_of("a").await, Some(IdentityState::Active));
        assert_eq!(f.observer.metrics().get_counter(metrics::NETWORK_ERRORS).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_and_bad_json_are_other_errors() {
        let f = fixture(FixedTransport::new(Ok(TransportResponse::new(503, "maintenance"))));
        let err = f.run("/ping", &RequestOptions::get()).await.unwrap_err();
        assert_eq!(err, AttemptError::Other("HTTP 503: maintenance".to_string()));

        let f = fixture(FixedTransport::new(Ok(TransportResponse::new(200, "<html>"))));
        assert!(matches!(
            f.run("/ping", &RequestOptions::get()).await,
            Err(AttemptError::Other(msg)) if msg.starts_with("invalid JSON")
        ));
        assert!(f.cache.get("/ping").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_other_error() {
        let mut transport = FixedTransport::new(Ok(TransportResponse::new(200, "{}")));
        transport.delay = Duration::from_secs(30);
        let f = fixture(transport);

        let options = RequestOptions::get().with_timeout(Duration::from_secs(2));
        let err = f.run("/slow", &options).await.unwrap_err();
        assert_eq!(err, AttemptError::Other("timed out after 2000ms".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unroutable_endpoint_never_reaches_transport() {
        let f = fixture(FixedTransport::new(Ok(TransportResponse::new(200, "{}"))));
        let err = f.run("ftp://files.test/x", &RequestOptions::get()).await.unwrap_err();

        assert!(matches!(err, AttemptError::Other(msg) if msg.contains("unroutable")));
        assert!(f.transport.seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_headers_override_signature() {
        let f = fixture(FixedTransport::new(Ok(TransportResponse::new(200, "{}"))));
        let options = RequestOptions::get()
            .with_header("user-agent", "custom/1.0")
            .with_header("X-Api-Key", "k");
        f.run("https://other.test/v1/x", &options).await.unwrap();

        let seen = f.transport.seen.lock().unwrap();
        let headers = &seen[0].headers;
        assert_eq!(seen[0].url, "https://other.test/v1/x");
        assert_eq!(headers.get("user-agent").map(String::as_str), Some("custom/1.0"));
        assert!(!headers.contains_key("User-Agent"));
        assert_eq!(headers.get("X-Request-Origin"), Some(&f.signature.origin));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_attempt_leaves_health_untouched() {
        let mut transport = FixedTransport::new(Ok(TransportResponse::new(200, "{}")));
        transport.delay = Duration::from_secs(10);
        let f = fixture(transport);
        let (handle, token) = CancelToken::new();

        let identity = f.pool.get("a").await.unwrap();
        let options = RequestOptions::get();
        let call = f
            .executor
            .execute("/ping", &identity, &f.signature, &options, first(), &token);
        let cancel = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            handle.cancel();
        };
        let (result, _) = tokio::join!(call, cancel);

        assert_eq!(result, Err(AttemptError::Cancelled));
        assert_eq!(f.pool.get("a").await.unwrap().request_count(), 0);
        assert_eq!(f.observer.metrics().get_counter(metrics::ATTEMPTS).await, 0);
    }
}
