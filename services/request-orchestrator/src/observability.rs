//! Observability: counters and the orchestrator event stream
//!
//! Callers never see failures, so operators watch these instead. An
//! `Exhausted` event means live data was replaced by a fallback.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};

use crate::types::{AttemptOutcome, AttemptRecord, PayloadSource};

const EVENT_CHANNEL_CAPACITY: usize = 256;
/// Observations kept per histogram
const HISTOGRAM_WINDOW: usize = 1024;

/// Metrics collector for orchestrator health
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<RwLock<MetricsInner>>,
}

struct MetricsInner {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    histograms: HashMap<String, Vec<f64>>,
    start_time: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MetricsInner {
                counters: HashMap::new(),
                gauges: HashMap::new(),
                histograms: HashMap::new(),
                start_time: Instant::now(),
            })),
        }
    }

    /// Increment a counter
    pub async fn increment(&self, name: &str, value: u64) {
        let mut inner = self.inner.write().await;
        let counter = inner.counters.entry(name.to_string()).or_insert(0);
        *counter += value;
    }

    /// Set a gauge value
    pub async fn gauge(&self, name: &str, value: f64) {
        let mut inner = self.inner.write().await;
        inner.gauges.insert(name.to_string(), value);
    }

    /// Record one observation, e.g. an attempt latency in milliseconds
    pub async fn observe(&self, name: &str, value: f64) {
        let mut inner = self.inner.write().await;
        let samples = inner.histograms.entry(name.to_string()).or_default();
        if samples.len() >= HISTOGRAM_WINDOW {
            samples.remove(0);
        }
        samples.push(value);
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.read().await;
        MetricsSnapshot {
            counters: inner.counters.clone(),
            gauges: inner.gauges.clone(),
            histograms: inner
                .histograms
                .iter()
                .filter_map(|(name, samples)| Some((name.clone(), HistogramSummary::from_samples(samples)?)))
                .collect(),
            uptime_secs: inner.start_time.elapsed().as_secs(),
        }
    }

    pub async fn get_counter(&self, name: &str) -> u64 {
        let inner = self.inner.read().await;
        inner.counters.get(name).copied().unwrap_or(0)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub histograms: HashMap<String, HistogramSummary>,
    pub uptime_secs: u64,
}

/// Percentiles over the most recent observations of one histogram
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub count: usize,
    pub p50: f64,
    pub p95: f64,
    pub max: f64,
}

impl HistogramSummary {
    fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        // Nearest-rank percentile
        let rank = |p: f64| {
            let idx = ((p * sorted.len() as f64).ceil() as usize).max(1) - 1;
            sorted[idx.min(sorted.len() - 1)]
        };
        Some(Self {
            count: sorted.len(),
            p50: rank(0.50),
            p95: rank(0.95),
            max: sorted[sorted.len() - 1],
        })
    }
}

/// Events published by the orchestrator and its maintenance loop
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    Attempt(AttemptRecord),
    /// Retry budget spent (or call cancelled); a fallback payload was served
    Exhausted {
        endpoint: String,
        attempts: u32,
        source: PayloadSource,
    },
    SignaturesRotated { generation: u64 },
    CooldownsReleased { count: usize },
}

/// Counters plus a broadcast channel of [`OrchestratorEvent`]s
#[derive(Clone)]
pub struct Observer {
    metrics: MetricsCollector,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl Observer {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            metrics: MetricsCollector::new(),
            events,
        }
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    /// Publish without blocking; having no subscribers is fine
    pub fn emit(&self, event: OrchestratorEvent) {
        let _ = self.events.send(event);
    }

    pub async fn attempt(&self, record: AttemptRecord) {
        self.metrics.increment(metrics::ATTEMPTS, 1).await;
        let counter = match record.outcome {
            AttemptOutcome::Success => metrics::LIVE_SUCCESS,
            AttemptOutcome::RateLimited => metrics::RATE_LIMITED,
            AttemptOutcome::NetworkError => metrics::NETWORK_ERRORS,
            AttemptOutcome::OtherError => metrics::OTHER_ERRORS,
        };
        self.metrics.increment(counter, 1).await;
        self.metrics
            .observe(metrics::ATTEMPT_LATENCY_MS, record.latency_ms as f64)
            .await;
        self.emit(OrchestratorEvent::Attempt(record));
    }

    pub async fn exhausted(&self, endpoint: &str, attempts: u32, source: &PayloadSource) {
        self.metrics.increment(metrics::EXHAUSTED, 1).await;
        let counter = match source {
            PayloadSource::Cached { .. } => metrics::FALLBACK_CACHED,
            PayloadSource::Synthetic { .. } => metrics::FALLBACK_SYNTHETIC,
            _ => metrics::FALLBACK_EMPTY,
        };
        self.metrics.increment(counter, 1).await;
        self.emit(OrchestratorEvent::Exhausted {
            endpoint: endpoint.to_string(),
            attempts,
            source: source.clone(),
        });
    }
}

impl Default for Observer {
    fn default() -> Self {
        Self::new()
    }
}

/// Predefined metric names
pub mod metrics {
    // Calls
    pub const REQUESTS: &str = "orchestrated_requests_total";
    pub const CANCELLED: &str = "orchestrated_cancelled_total";

    // Attempts
    pub const ATTEMPTS: &str = "attempts_total";
    pub const LIVE_SUCCESS: &str = "attempts_success_total";
    pub const RATE_LIMITED: &str = "attempts_rate_limited_total";
    pub const NETWORK_ERRORS: &str = "attempts_network_error_total";
    pub const OTHER_ERRORS: &str = "attempts_other_error_total";
    pub const BUDGET_ROTATIONS: &str = "budget_rotations_total";
    pub const ATTEMPT_LATENCY_MS: &str = "attempt_latency_ms";

    // Fallback
    pub const EXHAUSTED: &str = "exhausted_total";
    pub const FALLBACK_CACHED: &str = "fallback_cached_total";
    pub const FALLBACK_SYNTHETIC: &str = "fallback_synthetic_total";
    pub const FALLBACK_EMPTY: &str = "fallback_empty_total";

    // Maintenance
    pub const SIGNATURE_ROTATIONS: &str = "signature_rotations_total";
    pub const COOLDOWNS_RELEASED: &str = "cooldowns_released_total";
    pub const ACTIVE_IDENTITY_RATIO: &str = "active_identity_ratio";
}
