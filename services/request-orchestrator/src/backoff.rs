//! Inter-attempt delay planning

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::BackoffConfig;
use crate::identity::Identity;

/// Computes how long to wait before an attempt on a given identity
pub struct BackoffPlanner {
    config: BackoffConfig,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl BackoffPlanner {
    pub fn new(config: BackoffConfig) -> Self {
        Self::with_rng(config, Box::new(StdRng::from_entropy()))
    }

    pub fn seeded(config: BackoffConfig, seed: u64) -> Self {
        Self::with_rng(config, Box::new(StdRng::seed_from_u64(seed)))
    }

    pub fn with_rng(config: BackoffConfig, rng: Box<dyn RngCore + Send>) -> Self {
        Self {
            config,
            rng: Mutex::new(rng),
        }
    }

    /// `base × penalty × growth^(attempt−1) + jitter`, capped at `max_delay_ms`.
    ///
    /// `attempt` is 1-based. Identities under the penalty threshold wait
    /// `penalty_multiplier` times longer.
    pub fn compute_delay(&self, attempt: u32, identity: &Identity) -> Duration {
        let jitter = if self.config.max_jitter_ms == 0 {
            0
        } else {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            rng.gen_range(0..=self.config.max_jitter_ms)
        };
        self.planned_delay(attempt, identity.success_rate(), jitter)
    }

    fn planned_delay(&self, attempt: u32, success_rate: f64, jitter_ms: u64) -> Duration {
        let c = &self.config;
        let penalty = if success_rate < c.penalty_threshold {
            c.penalty_multiplier
        } else {
            1.0
        };
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let scaled = c.base_delay_ms as f64 * penalty * c.growth_factor.powi(exponent);

        let total = (scaled + jitter_ms as f64).min(c.max_delay_ms as f64).max(0.0);
        Duration::from_millis(total as u64)
    }

    pub fn max_jitter(&self) -> Duration {
        Duration::from_millis(self.config.max_jitter_ms)
    }
}
