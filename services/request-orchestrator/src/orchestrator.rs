//! Per-call retry state machine
//!
//! ```text
//! SELECTING -> EXECUTING -> SUCCEEDED
//!                        -> RETRYING -> SELECTING
//!                        -> EXHAUSTED -> fallback payload
//! ```

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPlanner;
use crate::budget::{BudgetDecision, EndpointBudgets};
use crate::cancel::CancelToken;
use crate::config::OrchestratorConfig;
use crate::executor::{AttemptMeta, HttpTransport, RequestExecutor, Transport};
use crate::fallback::{FallbackSynthesizer, ResultCache};
use crate::identity::{CoolDownTrigger, Identity, IdentityPool};
use crate::maintenance::{MaintenanceHandle, MaintenanceLoop};
use crate::observability::{metrics, MetricsCollector, Observer, OrchestratorEvent};
use crate::signature::{Signature, SignatureGenerator};
use crate::types::{AttemptError, Payload, PayloadSource, RequestOptions, Result};

enum CallState {
    Selecting,
    Executing {
        identity: Identity,
        signature: Signature,
    },
    Retrying {
        error: AttemptError,
    },
    Succeeded {
        data: serde_json::Value,
        identity: String,
    },
    Exhausted {
        reason: ExhaustReason,
    },
}

#[derive(Debug, Clone, Copy)]
enum ExhaustReason {
    NoIdentity,
    RetriesSpent,
    Cancelled,
}

struct Inner {
    config: OrchestratorConfig,
    pool: Arc<IdentityPool>,
    signatures: Arc<SignatureGenerator>,
    backoff: BackoffPlanner,
    budgets: Arc<EndpointBudgets>,
    executor: RequestExecutor,
    fallback: FallbackSynthesizer,
    observer: Observer,
}

/// Entry point for outbound calls. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct RequestOrchestrator {
    inner: Arc<Inner>,
}

impl RequestOrchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            transport: None,
            seed: None,
        }
    }

    /// Orchestrator with the reqwest transport and OS entropy
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Fetch `endpoint`, retrying across identities.
    ///
    /// **This never fails.** When every attempt fails the payload comes from
    /// the fallback synthesizer: the last cached result for the endpoint, a
    /// synthetic payload for its category, or `{}`. Check
    /// [`Payload::source`] (or [`Payload::is_live`]) to tell live data from
    /// a substitute, and subscribe to [`OrchestratorEvent::Exhausted`] to
    /// observe fallbacks.
    pub async fn orchestrate(&self, endpoint: &str, options: RequestOptions) -> Payload {
        self.orchestrate_with_cancel(endpoint, options, &CancelToken::never())
            .await
    }

    /// Like [`orchestrate`](Self::orchestrate); a cancelled call stops
    /// retrying and resolves through the fallback synthesizer.
    pub async fn orchestrate_with_cancel(
        &self,
        endpoint: &str,
        options: RequestOptions,
        cancel: &CancelToken,
    ) -> Payload {
        let inner = &self.inner;
        inner.observer.metrics().increment(metrics::REQUESTS, 1).await;

        let max_attempts = inner.config.max_retries;
        let mut tried: HashSet<String> = HashSet::new();
        let mut attempts = 0u32;
        let mut skip_backoff = true;
        let mut state = CallState::Selecting;

        loop {
            state = match state {
                CallState::Selecting => {
                    if cancel.is_cancelled() {
                        CallState::Exhausted {
                            reason: ExhaustReason::Cancelled,
                        }
                    } else {
                        match inner.pool.select_identity(&tried).await {
                            Some(identity) => CallState::Executing {
                                identity,
                                signature: inner.signatures.pick_random(),
                            },
                            None => CallState::Exhausted {
                                reason: ExhaustReason::NoIdentity,
                            },
                        }
                    }
                }

                CallState::Executing { identity, signature } => {
                    attempts += 1;
                    tried.insert(identity.id.clone());

                    let delay = if skip_backoff {
                        Duration::ZERO
                    } else {
                        inner.backoff.compute_delay(attempts, &identity)
                    };

                    match self
                        .attempt(endpoint, &identity, &signature, &options, attempts, delay, cancel)
                        .await
                    {
                        Ok(data) => CallState::Succeeded {
                            data,
                            identity: identity.id,
                        },
                        Err(AttemptError::Cancelled) => CallState::Exhausted {
                            reason: ExhaustReason::Cancelled,
                        },
                        Err(error) if attempts >= max_attempts => {
                            debug!(endpoint, attempts, "last attempt failed: {}", error);
                            CallState::Exhausted {
                                reason: ExhaustReason::RetriesSpent,
                            }
                        }
                        Err(error) => {
                            // The identity just cooled down; move on without waiting
                            skip_backoff = matches!(error, AttemptError::RateLimited { .. });
                            CallState::Retrying { error }
                        }
                    }
                }

                CallState::Retrying { error } => {
                    debug!(
                        endpoint,
                        attempt = attempts,
                        of = max_attempts,
                        "retrying after {}",
                        error
                    );
                    CallState::Selecting
                }

                CallState::Succeeded { data, identity } => {
                    return Payload {
                        endpoint: endpoint.to_string(),
                        data,
                        source: PayloadSource::Live { identity },
                        attempts,
                        retrieved_at: Utc::now(),
                    };
                }

                CallState::Exhausted { reason } => {
                    return self.exhaust(endpoint, attempts, reason).await;
                }
            };
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        endpoint: &str,
        identity: &Identity,
        signature: &Signature,
        options: &RequestOptions,
        attempt: u32,
        delay: Duration,
        cancel: &CancelToken,
    ) -> std::result::Result<serde_json::Value, AttemptError> {
        if !delay.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.charge_budget(endpoint, identity).await;

        self.inner
            .executor
            .execute(
                endpoint,
                identity,
                signature,
                options,
                AttemptMeta { attempt, delay },
                cancel,
            )
            .await
    }

    /// Count the attempt against the endpoint budget; a used-up budget
    /// rotates the serving identity out.
    async fn charge_budget(&self, endpoint: &str, identity: &Identity) {
        let inner = &self.inner;
        if inner.budgets.consume(endpoint).await == BudgetDecision::Rotate {
            info!("Endpoint budget for {} used up, rotating {} out", endpoint, identity.id);
            inner
                .pool
                .cool_down(&identity.id, CoolDownTrigger::BudgetExhausted)
                .await;
            inner.observer.metrics().increment(metrics::BUDGET_ROTATIONS, 1).await;
        }
    }

    async fn exhaust(&self, endpoint: &str, attempts: u32, reason: ExhaustReason) -> Payload {
        let inner = &self.inner;
        let payload = inner.fallback.synthesize(endpoint, attempts).await;

        match reason {
            ExhaustReason::Cancelled => {
                inner.observer.metrics().increment(metrics::CANCELLED, 1).await;
                info!("Call to {} cancelled after {} attempts", endpoint, attempts);
            }
            ExhaustReason::NoIdentity => {
                warn!("No identity available for {} after {} attempts", endpoint, attempts);
            }
            ExhaustReason::RetriesSpent => {
                warn!("Retries exhausted for {} after {} attempts", endpoint, attempts);
            }
        }

        inner
            .observer
            .exhausted(endpoint, attempts, &payload.source)
            .await;
        payload
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &Arc<IdentityPool> {
        &self.inner.pool
    }

    pub fn signatures(&self) -> &Arc<SignatureGenerator> {
        &self.inner.signatures
    }

    pub fn budgets(&self) -> &Arc<EndpointBudgets> {
        &self.inner.budgets
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        self.inner.fallback.cache()
    }

    pub fn metrics(&self) -> &MetricsCollector {
        self.inner.observer.metrics()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.inner.observer.subscribe()
    }

    /// Maintenance over this orchestrator's pool, signatures and budgets
    pub fn maintenance(&self) -> MaintenanceLoop {
        MaintenanceLoop::new(
            self.inner.pool.clone(),
            self.inner.signatures.clone(),
            self.inner.budgets.clone(),
            self.inner.observer.clone(),
            self.inner.config.maintenance,
        )
    }

    /// Spawn the maintenance loop; stop it with [`MaintenanceHandle::shutdown`]
    pub fn start_maintenance(&self) -> MaintenanceHandle {
        self.maintenance().spawn()
    }
}

/// Assembles a [`RequestOrchestrator`]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    transport: Option<Arc<dyn Transport>>,
    seed: Option<u64>,
}

impl OrchestratorBuilder {
    /// Replace the reqwest transport
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Seed signature and jitter randomness for reproducible runs
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<RequestOrchestrator> {
        let config = self.config;
        config.validate()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&config.identities)?),
        };

        let (signatures, backoff) = match self.seed {
            Some(seed) => (
                SignatureGenerator::seeded(config.signatures.clone(), seed)?,
                BackoffPlanner::seeded(config.backoff, seed.wrapping_add(1)),
            ),
            None => (
                SignatureGenerator::new(config.signatures.clone())?,
                BackoffPlanner::new(config.backoff),
            ),
        };

        let pool = Arc::new(IdentityPool::new(
            &config.identities,
            config.health,
            config.cooldown,
        ));
        let budgets = Arc::new(EndpointBudgets::new(&config.budgets));
        let cache = Arc::new(ResultCache::new());
        let observer = Observer::new();

        let executor = RequestExecutor::new(
            pool.clone(),
            transport,
            cache.clone(),
            observer.clone(),
            config.upstream_base_url.as_deref(),
            config.request_timeout(),
        )?;

        info!(
            "Request orchestrator ready with {} identities, {} retries per call",
            config.identities.len(),
            config.max_retries
        );

        Ok(RequestOrchestrator {
            inner: Arc::new(Inner {
                pool,
                signatures: Arc::new(signatures),
                backoff,
                budgets,
                executor,
                fallback: FallbackSynthesizer::new(cache),
                observer,
                config,
            }),
        })
    }
}
