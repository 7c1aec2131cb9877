use std::collections::HashSet;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{CoolDownTrigger, Identity, IdentitySnapshot, IdentityState};
use crate::config::{CooldownConfig, HealthConfig, IdentityConfig};
use crate::types::AttemptOutcome;

/// Fixed set of egress identities with per-identity health.
///
/// Every mutation runs inside one write section, so concurrent callers never
/// observe a half-applied update.
pub struct IdentityPool {
    identities: RwLock<Vec<Identity>>,
    health: HealthConfig,
    cooldown: CooldownConfig,
}

impl IdentityPool {
    pub fn new(configs: &[IdentityConfig], health: HealthConfig, cooldown: CooldownConfig) -> Self {
        let initial = health
            .initial_success_rate
            .clamp(health.min_success_rate, health.max_success_rate);
        let identities = configs.iter().map(|c| Identity::new(c, initial)).collect();

        Self {
            identities: RwLock::new(identities),
            health,
            cooldown,
        }
    }

    pub async fn len(&self) -> usize {
        self.identities.read().await.len()
    }

    /// Pick the best identity not in `excluding`.
    ///
    /// Only active identities are candidates. When none is active, the
    /// non-excluded cooling identities are forced back to active and the
    /// selection runs once more. Blocked identities are never chosen.
    pub async fn select_identity(&self, excluding: &HashSet<String>) -> Option<Identity> {
        let mut identities = self.identities.write().await;
        let now = Instant::now();

        if let Some(best) = Self::best_active(&identities, excluding, now, &self.health) {
            return Some(identities[best].clone());
        }

        let mut forced = 0;
        for identity in identities.iter_mut() {
            if excluding.contains(&identity.id) {
                continue;
            }
            if identity.state_at(now) == IdentityState::Cooling && identity.activate() {
                forced += 1;
            }
        }

        if forced == 0 {
            return None;
        }
        warn!("No active identity available, force-reset {} cooling identities", forced);

        Self::best_active(&identities, excluding, now, &self.health).map(|i| identities[i].clone())
    }

    fn best_active(
        identities: &[Identity],
        excluding: &HashSet<String>,
        now: Instant,
        health: &HealthConfig,
    ) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (idx, identity) in identities.iter().enumerate() {
            if excluding.contains(&identity.id) || identity.state_at(now) != IdentityState::Active {
                continue;
            }
            let score = identity.score(now, health);
            // Strictly greater keeps configuration order on ties
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((idx, score));
            }
        }
        best.map(|(idx, _)| idx)
    }

    /// Record a success or an `other_error` against an identity.
    ///
    /// A streak of failures reaching the configured threshold starts a
    /// repeated-failure cool-down.
    pub async fn record_outcome(&self, id: &str, success: bool) {
        let outcome = if success {
            AttemptOutcome::Success
        } else {
            AttemptOutcome::OtherError
        };
        self.record(id, outcome, None).await;
    }

    /// Record a connect/reset/DNS failure. The identity loses health but is
    /// not cooled; the caller simply moves on to another one.
    pub async fn record_network_error(&self, id: &str) {
        self.record(id, AttemptOutcome::NetworkError, None).await;
    }

    /// Record a 429 and start the rate-limit cool-down in the same write
    /// section.
    pub async fn record_rate_limited(&self, id: &str, retry_after: Option<u64>) {
        let trigger = CoolDownTrigger::RateLimited { retry_after };
        self.record(id, AttemptOutcome::RateLimited, Some(trigger)).await;
    }

    async fn record(&self, id: &str, outcome: AttemptOutcome, trigger: Option<CoolDownTrigger>) {
        let mut identities = self.identities.write().await;
        let now = Instant::now();

        let Some(identity) = identities.iter_mut().find(|i| i.id == id) else {
            warn!("Outcome recorded for unknown identity {}", id);
            return;
        };

        let streak = identity.record(outcome, now, &self.health);
        debug!(
            identity = %id,
            outcome = outcome.as_str(),
            success_rate = identity.success_rate(),
            "identity outcome recorded"
        );

        if let Some(trigger) = trigger {
            let duration = trigger.duration(&self.cooldown);
            identity.start_cooling(now + duration, trigger);
            info!("Identity {} cooling for {:?} ({:?})", id, duration, trigger);
        }

        let threshold = self.cooldown.failure_streak_threshold;
        if outcome == AttemptOutcome::OtherError && threshold > 0 && streak >= threshold {
            let trigger = CoolDownTrigger::RepeatedFailures;
            identity.start_cooling(now + trigger.duration(&self.cooldown), trigger);
            warn!("Identity {} cooling after {} consecutive failures", id, streak);
        }
    }

    /// Suspend an identity from selection for the trigger's duration
    pub async fn cool_down(&self, id: &str, trigger: CoolDownTrigger) {
        let duration = trigger.duration(&self.cooldown);
        let mut identities = self.identities.write().await;

        if let Some(identity) = identities.iter_mut().find(|i| i.id == id) {
            identity.start_cooling(Instant::now() + duration, trigger);
            info!("Identity {} cooling for {:?} ({:?})", id, duration, trigger);
        }
    }

    /// Return every cooling identity whose window has elapsed to active
    pub async fn release_expired(&self) -> usize {
        let mut identities = self.identities.write().await;
        let now = Instant::now();

        let mut released = 0;
        for identity in identities.iter_mut() {
            let expired = identity.state == IdentityState::Cooling
                && identity.cooling_until.map_or(true, |until| now >= until);
            if expired && identity.activate() {
                released += 1;
            }
        }

        if released > 0 {
            debug!("Released {} identities from cool-down", released);
        }
        released
    }

    /// Take an identity out of rotation until `unblock`
    pub async fn block(&self, id: &str) -> bool {
        self.set_blocked(id, true).await
    }

    pub async fn unblock(&self, id: &str) -> bool {
        self.set_blocked(id, false).await
    }

    async fn set_blocked(&self, id: &str, blocked: bool) -> bool {
        let mut identities = self.identities.write().await;
        match identities.iter_mut().find(|i| i.id == id) {
            Some(identity) => {
                identity.set_blocked(blocked);
                info!("Identity {} {}", id, if blocked { "blocked" } else { "unblocked" });
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, id: &str) -> Option<Identity> {
        self.identities.read().await.iter().find(|i| i.id == id).cloned()
    }

    pub async fn state_of(&self, id: &str) -> Option<IdentityState> {
        let now = Instant::now();
        self.identities
            .read()
            .await
            .iter()
            .find(|i| i.id == id)
            .map(|i| i.state_at(now))
    }

    /// Share of identities currently selectable
    pub async fn active_ratio(&self) -> f64 {
        let identities = self.identities.read().await;
        if identities.is_empty() {
            return 0.0;
        }
        let now = Instant::now();
        let active = identities
            .iter()
            .filter(|i| i.state_at(now) == IdentityState::Active)
            .count();
        active as f64 / identities.len() as f64
    }

    pub async fn snapshot(&self) -> Vec<IdentitySnapshot> {
        let now = Instant::now();
        self.identities.read().await.iter().map(|i| i.snapshot(now)).collect()
    }
}
