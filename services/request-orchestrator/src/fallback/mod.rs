//! Last-known-good cache and fallback synthesis
//!
//! The synthesizer is the terminal node of every retry chain. It never
//! fails: cached data first, then a synthetic payload shaped for the
//! endpoint's category, then an empty object.

pub mod shapes;

pub use shapes::EndpointCategory;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::types::{Payload, PayloadSource};

/// Last known good payload for one endpoint
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub data: serde_json::Value,
    pub stored_at: DateTime<Utc>,
}

/// One entry per distinct endpoint string, overwritten on every success
#[derive(Default)]
pub struct ResultCache {
    entries: RwLock<HashMap<String, CachedResult>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn store(&self, endpoint: &str, data: serde_json::Value) {
        let mut entries = self.entries.write().await;
        entries.insert(
            endpoint.to_string(),
            CachedResult {
                data,
                stored_at: Utc::now(),
            },
        );
    }

    pub async fn get(&self, endpoint: &str) -> Option<CachedResult> {
        self.entries.read().await.get(endpoint).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// Produces a substitute payload when live retrieval is exhausted
pub struct FallbackSynthesizer {
    cache: Arc<ResultCache>,
}

impl FallbackSynthesizer {
    pub fn new(cache: Arc<ResultCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Total: always returns a payload for `endpoint`
    pub async fn synthesize(&self, endpoint: &str, attempts: u32) -> Payload {
        let (data, source) = match self.cache.get(endpoint).await {
            Some(cached) => {
                debug!("Serving cached result for {}", endpoint);
                (
                    cached.data,
                    PayloadSource::Cached {
                        stored_at: cached.stored_at,
                    },
                )
            }
            None => {
                let category = EndpointCategory::from_endpoint(endpoint);
                match shapes::synthetic_payload(category, endpoint) {
                    Some(data) => {
                        debug!("Synthesizing {} payload for {}", category.as_str(), endpoint);
                        (
                            data,
                            PayloadSource::Synthetic {
                                category: category.as_str().to_string(),
                            },
                        )
                    }
                    None => (serde_json::json!({}), PayloadSource::Empty),
                }
            }
        };

        Payload {
            endpoint: endpoint.to_string(),
            data,
            source,
            attempts,
            retrieved_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn synthesizer() -> FallbackSynthesizer {
        FallbackSynthesizer::new(Arc::new(ResultCache::new()))
    }

    #[tokio::test]
    async fn test_cache_hit_wins_over_synthesis() {
        let synth = synthesizer();
        let live = json!({"bitcoin": {"usd": 61000.5}});
        synth.cache().store("/simple/price?ids=bitcoin", live.clone()).await;

        let payload = synth.synthesize("/simple/price?ids=bitcoin", 3).await;
        assert_eq!(payload.data, live);
        assert!(matches!(payload.source, PayloadSource::Cached { .. }));
        assert_eq!(payload.attempts, 3);
    }

    #[tokio::test]
    async fn test_cache_is_keyed_by_exact_endpoint() {
        let synth = synthesizer();
        synth.cache().store("/simple/price?ids=bitcoin", json!({"bitcoin": {"usd": 1.0}})).await;

        let payload = synth.synthesize("/simple/price?ids=ethereum", 1).await;
        assert!(matches!(payload.source, PayloadSource::Synthetic { .. }));
        assert!(payload.data.get("ethereum").is_some());
    }

    #[tokio::test]
    async fn test_cache_overwritten_on_store() {
        let cache = ResultCache::new();
        cache.store("/a", json!(1)).await;
        cache.store("/a", json!(2)).await;
        assert_eq!(cache.get("/a").await.unwrap().data, json!(2));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_endpoint_gets_empty_object() {
        let payload = synthesizer().synthesize("/v1/something/else", 3).await;
        assert_eq!(payload.source, PayloadSource::Empty);
        assert_eq!(payload.data, json!({}));
    }
}
