//! Periodic maintenance: signature rotation and cool-down sweeps

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::budget::EndpointBudgets;
use crate::cancel::{CancelHandle, CancelToken};
use crate::config::MaintenanceConfig;
use crate::identity::IdentityPool;
use crate::observability::{metrics, Observer, OrchestratorEvent};
use crate::signature::SignatureGenerator;

/// Background task owning the two maintenance timers
pub struct MaintenanceLoop {
    pool: Arc<IdentityPool>,
    signatures: Arc<SignatureGenerator>,
    budgets: Arc<EndpointBudgets>,
    observer: Observer,
    config: MaintenanceConfig,
}

impl MaintenanceLoop {
    pub fn new(
        pool: Arc<IdentityPool>,
        signatures: Arc<SignatureGenerator>,
        budgets: Arc<EndpointBudgets>,
        observer: Observer,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            pool,
            signatures,
            budgets,
            observer,
            config,
        }
    }

    pub fn spawn(self) -> MaintenanceHandle {
        let (cancel, token) = CancelToken::new();
        let task = tokio::spawn(self.run(token));
        MaintenanceHandle { cancel, task }
    }

    async fn run(self, shutdown: CancelToken) {
        let rotation_every = Duration::from_millis(self.config.rotation_interval_ms);
        let sweep_every = Duration::from_millis(self.config.sweep_interval_ms);
        info!(
            "Maintenance loop started (rotation every {:?}, sweep every {:?})",
            rotation_every, sweep_every
        );

        // First ticks fire one period from now, not immediately
        let now = Instant::now();
        let mut rotation = interval_at(now + rotation_every, rotation_every);
        rotation.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = interval_at(now + sweep_every, sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Maintenance loop stopping");
                    break;
                }
                _ = rotation.tick() => {
                    self.rotate_signatures().await;
                }
                _ = sweep.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    /// Replace the whole signature pool
    pub async fn rotate_signatures(&self) {
        self.signatures.rotate();
        let generation = self.signatures.generation();
        self.observer.metrics().increment(metrics::SIGNATURE_ROTATIONS, 1).await;
        self.observer.emit(OrchestratorEvent::SignaturesRotated { generation });
    }

    /// Release expired cool-downs, then rescale endpoint budgets to the
    /// share of active identities. Returns the number released.
    pub async fn sweep(&self) -> usize {
        let released = self.pool.release_expired().await;
        let ratio = self.pool.active_ratio().await;
        self.budgets.recompute(ratio).await;

        let collector = self.observer.metrics();
        collector.gauge(metrics::ACTIVE_IDENTITY_RATIO, ratio).await;
        if released > 0 {
            collector.increment(metrics::COOLDOWNS_RELEASED, released as u64).await;
            self.observer.emit(OrchestratorEvent::CooldownsReleased { count: released });
        }
        debug!(released, active_ratio = ratio, "maintenance sweep");
        released
    }
}

/// Stops and joins the maintenance task
pub struct MaintenanceHandle {
    cancel: CancelHandle,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Maintenance task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BudgetConfig, CooldownConfig, EndpointProfileConfig, HealthConfig, IdentityConfig, SignatureConfig};
    use crate::identity::{CoolDownTrigger, IdentityState};

    fn maintenance() -> MaintenanceLoop {
        let pool = Arc::new(IdentityPool::new(
            &[IdentityConfig::new("a", "test"), IdentityConfig::new("b", "test")],
            HealthConfig::default(),
            CooldownConfig::default(),
        ));
        let signatures = Arc::new(SignatureGenerator::seeded(SignatureConfig::default(), 5).unwrap());
        let budgets = Arc::new(EndpointBudgets::new(&BudgetConfig {
            endpoints: vec![EndpointProfileConfig {
                name: "/bulk".to_string(),
                budget: 10,
                priority: 1,
                bypass: false,
            }],
            ..BudgetConfig::default()
        }));
        MaintenanceLoop::new(pool, signatures, budgets, Observer::new(), MaintenanceConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_releases_and_rescales() {
        let m = maintenance();
        m.pool.cool_down("a", CoolDownTrigger::BudgetExhausted).await;

        assert_eq!(m.sweep().await, 0);
        assert_eq!(m.budgets.get("/bulk").await.unwrap().effective_budget, 5);

        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(m.sweep().await, 1);
        assert_eq!(m.pool.state_of("a").await, Some(IdentityState::Active));
        assert_eq!(m.budgets.get("/bulk").await.unwrap().effective_budget, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_rotate_and_sweep_until_shutdown() {
        let m = maintenance();
        let signatures = m.signatures.clone();
        let pool = m.pool.clone();
        let observer = m.observer.clone();
        pool.cool_down("a", CoolDownTrigger::RateLimited { retry_after: None }).await;

        let handle = m.spawn();
        assert_eq!(signatures.generation(), 1);

        tokio::time::sleep(Duration::from_millis(30_100)).await;
        assert_eq!(signatures.generation(), 2);

        // Cool-down elapsed at 30s; the 60s sweep moves it back explicitly
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(signatures.generation(), 3);
        assert_eq!(observer.metrics().get_counter(metrics::COOLDOWNS_RELEASED).await, 1);

        handle.shutdown().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(signatures.generation(), 3);
    }
}
