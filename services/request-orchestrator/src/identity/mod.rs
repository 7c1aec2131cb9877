//! Egress identities and their health

pub mod pool;

pub use pool::IdentityPool;

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{CooldownConfig, HealthConfig, IdentityConfig};
use crate::types::AttemptOutcome;

/// Lifecycle state of an identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityState {
    Active,
    Cooling,
    Blocked,
}

/// What put an identity into cool-down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoolDownTrigger {
    /// Upstream answered 429, optionally with `Retry-After` seconds
    RateLimited { retry_after: Option<u64> },
    /// The endpoint's request budget for the window was used up
    BudgetExhausted,
    /// Consecutive `other_error` attempts reached the streak threshold
    RepeatedFailures,
}

impl CoolDownTrigger {
    pub fn duration(&self, config: &CooldownConfig) -> Duration {
        let ms = match self {
            CoolDownTrigger::RateLimited { retry_after: Some(secs) } => secs.saturating_mul(1000),
            CoolDownTrigger::RateLimited { retry_after: None } => config.rate_limited_ms,
            CoolDownTrigger::BudgetExhausted => config.budget_exhausted_ms,
            CoolDownTrigger::RepeatedFailures => config.repeated_failures_ms,
        };
        Duration::from_millis(ms.clamp(config.min_ms, config.max_ms))
    }
}

/// One logical egress path
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: String,
    pub region: String,
    pub proxy_url: Option<String>,
    pub local_address: Option<std::net::IpAddr>,
    state: IdentityState,
    cooling_until: Option<Instant>,
    cooldown_trigger: Option<CoolDownTrigger>,
    last_used: Option<Instant>,
    request_count: u64,
    success_rate: f64,
    failure_streak: u32,
}

impl Identity {
    pub fn new(config: &IdentityConfig, initial_success_rate: f64) -> Self {
        Self {
            id: config.id.clone(),
            region: config.region.clone(),
            proxy_url: config.proxy_url.clone(),
            local_address: config.local_address,
            state: IdentityState::Active,
            cooling_until: None,
            cooldown_trigger: None,
            last_used: None,
            request_count: 0,
            success_rate: initial_success_rate,
            failure_streak: 0,
        }
    }

    /// State as of `now`, treating elapsed cool-downs as active
    pub fn state_at(&self, now: Instant) -> IdentityState {
        match (self.state, self.cooling_until) {
            (IdentityState::Cooling, Some(until)) if now >= until => IdentityState::Active,
            (state, _) => state,
        }
    }

    pub fn state(&self) -> IdentityState {
        self.state_at(Instant::now())
    }

    pub fn success_rate(&self) -> f64 {
        self.success_rate
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub fn last_used(&self) -> Option<Instant> {
        self.last_used
    }

    pub fn cooling_until(&self) -> Option<Instant> {
        self.cooling_until
    }

    pub fn failure_streak(&self) -> u32 {
        self.failure_streak
    }

    /// Time since last use, `None` if never used
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        self.last_used.map(|t| now.saturating_duration_since(t))
    }

    /// Selection score: success rate plus a bonus for resting
    pub(crate) fn score(&self, now: Instant, health: &HealthConfig) -> f64 {
        let window = health.recency_window_ms.max(1) as f64;
        let rested = match self.idle_for(now) {
            Some(idle) => (idle.as_millis() as f64 / window).min(health.recency_cap),
            None => health.recency_cap,
        };
        self.success_rate + rested * health.recency_weight
    }

    /// Apply one outcome; returns the new failure streak.
    ///
    /// Only `other_error` extends the streak. Network errors and rate limits
    /// lower the success rate but leave the streak as it was.
    pub(crate) fn record(&mut self, outcome: AttemptOutcome, now: Instant, health: &HealthConfig) -> u32 {
        self.last_used = Some(now);
        self.request_count += 1;

        match outcome {
            AttemptOutcome::Success => {
                self.success_rate += health.success_step;
                self.failure_streak = 0;
            }
            AttemptOutcome::OtherError => {
                self.success_rate -= health.failure_step;
                self.failure_streak += 1;
            }
            AttemptOutcome::NetworkError | AttemptOutcome::RateLimited => {
                self.success_rate -= health.failure_step;
            }
        }
        self.success_rate = self.success_rate.clamp(health.min_success_rate, health.max_success_rate);
        self.failure_streak
    }

    pub(crate) fn start_cooling(&mut self, until: Instant, trigger: CoolDownTrigger) {
        if self.state == IdentityState::Blocked {
            return;
        }
        // A longer running cool-down is never shortened
        let until = match self.cooling_until {
            Some(existing) if self.state == IdentityState::Cooling && existing > until => existing,
            _ => until,
        };
        self.state = IdentityState::Cooling;
        self.cooling_until = Some(until);
        self.cooldown_trigger = Some(trigger);
    }

    /// Move to active; returns true if the identity was cooling
    pub(crate) fn activate(&mut self) -> bool {
        if self.state != IdentityState::Cooling {
            return false;
        }
        self.state = IdentityState::Active;
        self.cooling_until = None;
        self.cooldown_trigger = None;
        true
    }

    pub(crate) fn set_blocked(&mut self, blocked: bool) {
        if blocked {
            self.state = IdentityState::Blocked;
            self.cooling_until = None;
            self.cooldown_trigger = None;
        } else if self.state == IdentityState::Blocked {
            self.state = IdentityState::Active;
        }
    }

    pub fn snapshot(&self, now: Instant) -> IdentitySnapshot {
        let state = self.state_at(now);
        IdentitySnapshot {
            id: self.id.clone(),
            region: self.region.clone(),
            state,
            success_rate: self.success_rate,
            request_count: self.request_count,
            failure_streak: self.failure_streak,
            idle_ms: self.idle_for(now).map(|d| d.as_millis() as u64),
            cooling_remaining_ms: match (state, self.cooling_until) {
                (IdentityState::Cooling, Some(until)) => {
                    Some(until.saturating_duration_since(now).as_millis() as u64)
                }
                _ => None,
            },
            cooldown_trigger: if state == IdentityState::Cooling {
                self.cooldown_trigger
            } else {
                None
            },
        }
    }
}

/// Serializable view of an identity for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct IdentitySnapshot {
    pub id: String,
    pub region: String,
    pub state: IdentityState,
    pub success_rate: f64,
    pub request_count: u64,
    pub failure_streak: u32,
    pub idle_ms: Option<u64>,
    pub cooling_remaining_ms: Option<u64>,
    pub cooldown_trigger: Option<CoolDownTrigger>,
}
