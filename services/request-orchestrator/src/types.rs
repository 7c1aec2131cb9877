use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// HTTP method for an outbound call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// Caller-supplied options for one logical request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestOptions {
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    /// Per-attempt timeout override
    #[serde(default, with = "optional_millis")]
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn post(body: serde_json::Value) -> Self {
        Self {
            method: HttpMethod::Post,
            body: Some(body),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Where the data in a [`Payload`] came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadSource {
    /// Retrieved from the upstream during this call
    Live { identity: String },
    /// Last known good result for the same endpoint
    Cached { stored_at: DateTime<Utc> },
    /// Built from static seed values for the endpoint's category
    Synthetic { category: String },
    /// Nothing known about the endpoint
    Empty,
}

/// What a caller of the orchestrator receives. Always present, possibly stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub endpoint: String,
    pub data: serde_json::Value,
    pub source: PayloadSource,
    pub attempts: u32,
    pub retrieved_at: DateTime<Utc>,
}

impl Payload {
    pub fn is_live(&self) -> bool {
        matches!(self.source, PayloadSource::Live { .. })
    }

    pub fn is_fallback(&self) -> bool {
        !self.is_live()
    }
}

/// Classified result of one execution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    RateLimited,
    NetworkError,
    OtherError,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::RateLimited => "rate_limited",
            AttemptOutcome::NetworkError => "network_error",
            AttemptOutcome::OtherError => "other_error",
        }
    }
}

/// One execution attempt, emitted as an event and never persisted
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub endpoint: String,
    pub attempt: u32,
    pub identity_id: String,
    pub signature_id: String,
    pub delay_ms: u64,
    pub outcome: AttemptOutcome,
    pub status: Option<u16>,
    pub latency_ms: u64,
}

/// Why a single attempt did not produce a payload
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AttemptError {
    #[error("Rate limited (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request failed: {0}")]
    Other(String),

    #[error("Attempt cancelled")]
    Cancelled,
}

impl AttemptError {
    /// Outcome class for health accounting. Cancellation is not an outcome.
    pub fn outcome(&self) -> Option<AttemptOutcome> {
        match self {
            AttemptError::RateLimited { .. } => Some(AttemptOutcome::RateLimited),
            AttemptError::Network(_) => Some(AttemptOutcome::NetworkError),
            AttemptError::Other(_) => Some(AttemptOutcome::OtherError),
            AttemptError::Cancelled => None,
        }
    }
}

/// Errors raised while building or configuring the orchestrator.
///
/// Request-time failures never surface as this type; see
/// [`crate::RequestOrchestrator::orchestrate`].
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid identity {id}: {reason}")]
    InvalidIdentity { id: String, reason: String },

    #[error("Signature pool needs at least {min} entries, got {actual}")]
    SignaturePoolTooSmall { min: usize, actual: usize },

    #[error("HTTP client error: {0}")]
    HttpClient(String),
}

impl From<config::ConfigError> for OrchestratorError {
    fn from(e: config::ConfigError) -> Self {
        OrchestratorError::Config(e.to_string())
    }
}

/// Result type for orchestrator construction
pub type Result<T> = std::result::Result<T, OrchestratorError>;

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
