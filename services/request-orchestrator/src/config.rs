//! Orchestrator configuration
//!
//! Every knob has a documented default. Values load from an optional config
//! file layered with `ORCHESTRATOR__*` environment variables.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{OrchestratorError, Result};

/// Smallest signature pool the generator will accept
pub const MIN_SIGNATURE_POOL: usize = 5;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    /// Egress identities, created once at startup
    #[serde(default = "default_identities")]
    pub identities: Vec<IdentityConfig>,
    /// Base URL for endpoints given as relative paths
    #[serde(default)]
    pub upstream_base_url: Option<String>,
    /// Execution attempts per call before falling back
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-attempt timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub cooldown: CooldownConfig,
    #[serde(default)]
    pub signatures: SignatureConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub budgets: BudgetConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            identities: default_identities(),
            upstream_base_url: None,
            max_retries: default_max_retries(),
            request_timeout_ms: default_request_timeout_ms(),
            health: HealthConfig::default(),
            backoff: BackoffConfig::default(),
            cooldown: CooldownConfig::default(),
            signatures: SignatureConfig::default(),
            maintenance: MaintenanceConfig::default(),
            budgets: BudgetConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from `path` (optional file) and `ORCHESTRATOR__*` env overrides
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("ORCHESTRATOR")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: OrchestratorConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the orchestrator cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.identities.is_empty() {
            return Err(OrchestratorError::Config(
                "at least one identity is required".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for identity in &self.identities {
            if identity.id.trim().is_empty() {
                return Err(OrchestratorError::InvalidIdentity {
                    id: identity.id.clone(),
                    reason: "id must not be empty".to_string(),
                });
            }
            if !seen.insert(identity.id.as_str()) {
                return Err(OrchestratorError::InvalidIdentity {
                    id: identity.id.clone(),
                    reason: "duplicate id".to_string(),
                });
            }
        }

        if self.max_retries == 0 {
            return Err(OrchestratorError::Config(
                "max_retries must be at least 1".to_string(),
            ));
        }

        if self.signatures.pool_size < MIN_SIGNATURE_POOL {
            return Err(OrchestratorError::SignaturePoolTooSmall {
                min: MIN_SIGNATURE_POOL,
                actual: self.signatures.pool_size,
            });
        }

        let h = &self.health;
        if !(0.0..=1.0).contains(&h.min_success_rate)
            || !(0.0..=1.0).contains(&h.max_success_rate)
            || h.min_success_rate > h.max_success_rate
        {
            return Err(OrchestratorError::Config(format!(
                "invalid success rate bounds [{}, {}]",
                h.min_success_rate, h.max_success_rate
            )));
        }

        if self.cooldown.min_ms > self.cooldown.max_ms {
            return Err(OrchestratorError::Config(format!(
                "cool-down window min {}ms exceeds max {}ms",
                self.cooldown.min_ms, self.cooldown.max_ms
            )));
        }

        if self.maintenance.rotation_interval_ms == 0 || self.maintenance.sweep_interval_ms == 0 {
            return Err(OrchestratorError::Config(
                "maintenance intervals must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// One egress identity
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdentityConfig {
    pub id: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Route this identity's traffic through a proxy
    #[serde(default)]
    pub proxy_url: Option<String>,
    /// Bind outbound sockets to this local address
    #[serde(default)]
    pub local_address: Option<std::net::IpAddr>,
}

impl IdentityConfig {
    pub fn new(id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            region: region.into(),
            proxy_url: None,
            local_address: None,
        }
    }
}

/// Success-rate bookkeeping
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct HealthConfig {
    #[serde(default = "default_initial_success_rate")]
    pub initial_success_rate: f64,
    #[serde(default = "default_success_step")]
    pub success_step: f64,
    #[serde(default = "default_failure_step")]
    pub failure_step: f64,
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
    #[serde(default = "default_max_success_rate")]
    pub max_success_rate: f64,
    /// Idle time that earns the full recency bonus
    #[serde(default = "default_recency_window_ms")]
    pub recency_window_ms: u64,
    #[serde(default = "default_recency_cap")]
    pub recency_cap: f64,
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            initial_success_rate: default_initial_success_rate(),
            success_step: default_success_step(),
            failure_step: default_failure_step(),
            min_success_rate: default_min_success_rate(),
            max_success_rate: default_max_success_rate(),
            recency_window_ms: default_recency_window_ms(),
            recency_cap: default_recency_cap(),
            recency_weight: default_recency_weight(),
        }
    }
}

/// Inter-attempt delay plan
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct BackoffConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,
    /// Identities below this success rate get the penalty multiplier
    #[serde(default = "default_penalty_threshold")]
    pub penalty_threshold: f64,
    #[serde(default = "default_penalty_multiplier")]
    pub penalty_multiplier: f64,
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            growth_factor: default_growth_factor(),
            penalty_threshold: default_penalty_threshold(),
            penalty_multiplier: default_penalty_multiplier(),
            max_jitter_ms: default_max_jitter_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Cool-down durations per trigger, clamped into `[min_ms, max_ms]`
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct CooldownConfig {
    #[serde(default = "default_rate_limited_ms")]
    pub rate_limited_ms: u64,
    #[serde(default = "default_budget_exhausted_ms")]
    pub budget_exhausted_ms: u64,
    #[serde(default = "default_repeated_failures_ms")]
    pub repeated_failures_ms: u64,
    /// Consecutive failed attempts before an identity cools down
    #[serde(default = "default_failure_streak_threshold")]
    pub failure_streak_threshold: u32,
    #[serde(default = "default_cooldown_min_ms")]
    pub min_ms: u64,
    #[serde(default = "default_cooldown_max_ms")]
    pub max_ms: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            rate_limited_ms: default_rate_limited_ms(),
            budget_exhausted_ms: default_budget_exhausted_ms(),
            repeated_failures_ms: default_repeated_failures_ms(),
            failure_streak_threshold: default_failure_streak_threshold(),
            min_ms: default_cooldown_min_ms(),
            max_ms: default_cooldown_max_ms(),
        }
    }
}

/// Signature pool generation
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignatureConfig {
    #[serde(default = "default_signature_pool_size")]
    pub pool_size: usize,
    /// Values used for the `User-Agent` header
    #[serde(default = "default_client_identifiers")]
    pub client_identifiers: Vec<String>,
    #[serde(default = "default_origin_tags")]
    pub origin_tags: Vec<String>,
    #[serde(default = "default_accept_languages")]
    pub accept_languages: Vec<String>,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            pool_size: default_signature_pool_size(),
            client_identifiers: default_client_identifiers(),
            origin_tags: default_origin_tags(),
            accept_languages: default_accept_languages(),
        }
    }
}

/// Timer periods for the maintenance loop
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_rotation_interval_ms")]
    pub rotation_interval_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            rotation_interval_ms: default_rotation_interval_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

/// Per-endpoint request budgets
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BudgetConfig {
    #[serde(default = "default_budget_window_ms")]
    pub window_ms: u64,
    /// Budget for endpoints without an explicit profile
    #[serde(default = "default_endpoint_budget")]
    pub default_budget: u32,
    #[serde(default)]
    pub endpoints: Vec<EndpointProfileConfig>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            window_ms: default_budget_window_ms(),
            default_budget: default_endpoint_budget(),
            endpoints: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointProfileConfig {
    pub name: String,
    pub budget: u32,
    /// 0 is the highest priority
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Exempt from budget accounting
    #[serde(default)]
    pub bypass: bool,
}

fn default_identities() -> Vec<IdentityConfig> {
    vec![
        IdentityConfig::new("egress-1", "us-east"),
        IdentityConfig::new("egress-2", "eu-west"),
        IdentityConfig::new("egress-3", "ap-southeast"),
    ]
}
fn default_region() -> String { "default".to_string() }
fn default_max_retries() -> u32 { 3 }
fn default_request_timeout_ms() -> u64 { 20_000 }

fn default_initial_success_rate() -> f64 { 0.9 }
fn default_success_step() -> f64 { 0.02 }
fn default_failure_step() -> f64 { 0.05 }
fn default_min_success_rate() -> f64 { 0.10 }
fn default_max_success_rate() -> f64 { 0.99 }
fn default_recency_window_ms() -> u64 { 60_000 }
fn default_recency_cap() -> f64 { 1.0 }
fn default_recency_weight() -> f64 { 0.1 }

fn default_base_delay_ms() -> u64 { 800 }
fn default_growth_factor() -> f64 { 1.3 }
fn default_penalty_threshold() -> f64 { 0.8 }
fn default_penalty_multiplier() -> f64 { 1.5 }
fn default_max_jitter_ms() -> u64 { 500 }
fn default_max_delay_ms() -> u64 { 8_000 }

fn default_rate_limited_ms() -> u64 { 30_000 }
fn default_budget_exhausted_ms() -> u64 { 15_000 }
fn default_repeated_failures_ms() -> u64 { 60_000 }
fn default_failure_streak_threshold() -> u32 { 3 }
fn default_cooldown_min_ms() -> u64 { 15_000 }
fn default_cooldown_max_ms() -> u64 { 60_000 }

fn default_signature_pool_size() -> usize { 8 }
fn default_client_identifiers() -> Vec<String> {
    vec![
        "market-dashboard/1.4 (+request-orchestrator)".to_string(),
        "market-dashboard/1.4 (+request-orchestrator; batch)".to_string(),
        "portfolio-sync/0.9 (+request-orchestrator)".to_string(),
    ]
}
fn default_origin_tags() -> Vec<String> {
    vec!["dashboard".to_string(), "portfolio".to_string(), "intelligence".to_string()]
}
fn default_accept_languages() -> Vec<String> {
    vec!["en-US,en;q=0.9".to_string(), "en-GB,en;q=0.8".to_string()]
}

fn default_rotation_interval_ms() -> u64 { 30_000 }
fn default_sweep_interval_ms() -> u64 { 60_000 }

fn default_budget_window_ms() -> u64 { 60_000 }
fn default_endpoint_budget() -> u32 { 30 }
fn default_priority() -> u8 { 1 }
