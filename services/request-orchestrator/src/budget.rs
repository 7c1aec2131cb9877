//! Per-endpoint request budgets over a rolling window

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::config::BudgetConfig;

/// Budget state for one endpoint
#[derive(Debug, Clone)]
pub struct EndpointProfile {
    pub name: String,
    pub base_budget: u32,
    /// Budget after the last maintenance recompute
    pub effective_budget: u32,
    pub consumed: u32,
    pub window_start: Instant,
    pub priority: u8,
    pub bypass: bool,
}

impl EndpointProfile {
    fn new(name: &str, budget: u32, priority: u8, bypass: bool, now: Instant) -> Self {
        let budget = budget.max(1);
        Self {
            name: name.to_string(),
            base_budget: budget,
            effective_budget: budget,
            consumed: 0,
            window_start: now,
            priority,
            bypass,
        }
    }

    fn roll_window(&mut self, now: Instant, window: Duration) {
        if now.duration_since(self.window_start) >= window {
            self.consumed = 0;
            self.window_start = now;
        }
    }
}

/// Result of charging one request against an endpoint budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
    /// Budget not accounted for this endpoint
    Bypass,
    /// Request counted, budget still has room
    Within { remaining: u32 },
    /// Request counted and the budget is now used up. The window has
    /// already been restarted; the serving identity must be rotated out.
    Rotate,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    pub endpoint: String,
    pub base_budget: u32,
    pub effective_budget: u32,
    pub consumed: u32,
    pub priority: u8,
    pub bypass: bool,
}

/// Keyed map of endpoint profiles
pub struct EndpointBudgets {
    profiles: RwLock<HashMap<String, EndpointProfile>>,
    window: Duration,
    default_budget: u32,
}

impl EndpointBudgets {
    pub fn new(config: &BudgetConfig) -> Self {
        let now = Instant::now();
        let profiles = config
            .endpoints
            .iter()
            .map(|p| {
                (
                    p.name.clone(),
                    EndpointProfile::new(&p.name, p.budget, p.priority, p.bypass, now),
                )
            })
            .collect();

        Self {
            profiles: RwLock::new(profiles),
            window: Duration::from_millis(config.window_ms),
            default_budget: config.default_budget,
        }
    }

    /// Count one request against `endpoint`
    pub async fn consume(&self, endpoint: &str) -> BudgetDecision {
        let mut profiles = self.profiles.write().await;
        let now = Instant::now();
        let default_budget = self.default_budget;

        let profile = profiles
            .entry(endpoint.to_string())
            .or_insert_with(|| EndpointProfile::new(endpoint, default_budget, 1, false, now));

        if profile.bypass {
            return BudgetDecision::Bypass;
        }

        profile.roll_window(now, self.window);
        profile.consumed += 1;

        if profile.consumed >= profile.effective_budget {
            debug!(
                "Budget for {} used up ({}/{}), starting a new window",
                endpoint, profile.consumed, profile.effective_budget
            );
            // The caller that crosses the budget owns the rotation; everyone
            // after it counts against the fresh window
            profile.consumed = 0;
            profile.window_start = now;
            BudgetDecision::Rotate
        } else {
            BudgetDecision::Within {
                remaining: profile.effective_budget - profile.consumed,
            }
        }
    }

    /// Scale budgets to pool health: priority 0 keeps its base budget,
    /// everything else gets `max(1, round(base × active_ratio))`. Also
    /// resets windows that have elapsed.
    pub async fn recompute(&self, active_ratio: f64) {
        let mut profiles = self.profiles.write().await;
        let now = Instant::now();
        let ratio = active_ratio.clamp(0.0, 1.0);

        for profile in profiles.values_mut() {
            profile.roll_window(now, self.window);
            profile.effective_budget = if profile.priority == 0 {
                profile.base_budget
            } else {
                ((profile.base_budget as f64 * ratio).round() as u32).max(1)
            };
        }
    }

    pub async fn get(&self, endpoint: &str) -> Option<EndpointProfile> {
        self.profiles.read().await.get(endpoint).cloned()
    }

    pub async fn snapshot(&self) -> Vec<BudgetSnapshot> {
        let profiles = self.profiles.read().await;
        let mut out: Vec<_> = profiles
            .values()
            .map(|p| BudgetSnapshot {
                endpoint: p.name.clone(),
                base_budget: p.base_budget,
                effective_budget: p.effective_budget,
                consumed: p.consumed,
                priority: p.priority,
                bypass: p.bypass,
            })
            .collect();
        out.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::config::EndpointProfileConfig;

    fn budgets(endpoints: Vec<EndpointProfileConfig>) -> EndpointBudgets {
        EndpointBudgets::new(&BudgetConfig {
            window_ms: 60_000,
            default_budget: 3,
            endpoints,
        })
    }

    fn profile(name: &str, budget: u32, priority: u8, bypass: bool) -> EndpointProfileConfig {
        EndpointProfileConfig {
            name: name.to_string(),
            budget,
            priority,
            bypass,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_endpoint_gets_default_budget() {
        let budgets = budgets(vec![]);
        assert_eq!(budgets.consume("/x").await, BudgetDecision::Within { remaining: 2 });
        assert_eq!(budgets.consume("/x").await, BudgetDecision::Within { remaining: 1 });
        assert_eq!(budgets.consume("/x").await, BudgetDecision::Rotate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotate_restarts_window() {
        let budgets = budgets(vec![]);
        let mut rotations = 0;
        for _ in 0..10 {
            if budgets.consume("/x").await == BudgetDecision::Rotate {
                rotations += 1;
            }
            let p = budgets.get("/x").await.unwrap();
            assert!(p.consumed < p.effective_budget);
        }
        assert_eq!(rotations, 3);
        assert_eq!(budgets.get("/x").await.unwrap().consumed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_consumers_rotate_once_per_budget() {
        let budgets = Arc::new(budgets(vec![profile("/e", 5, 1, false)]));

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let budgets = budgets.clone();
                tokio::spawn(async move { budgets.consume("/e").await })
            })
            .collect();

        let mut rotations = 0;
        for task in tasks {
            if task.await.unwrap() == BudgetDecision::Rotate {
                rotations += 1;
            }
        }
        assert_eq!(rotations, 20);
        assert_eq!(budgets.get("/e").await.unwrap().consumed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_elapsed() {
        let budgets = budgets(vec![]);
        budgets.consume("/x").await;
        budgets.consume("/x").await;

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(budgets.consume("/x").await, BudgetDecision::Within { remaining: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_bypass_endpoint_not_accounted() {
        let budgets = budgets(vec![profile("/health", 1, 1, true)]);
        for _ in 0..5 {
            assert_eq!(budgets.consume("/health").await, BudgetDecision::Bypass);
        }
        assert_eq!(budgets.get("/health").await.unwrap().consumed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recompute_scales_non_priority_budgets() {
        let budgets = budgets(vec![profile("/critical", 10, 0, false), profile("/bulk", 10, 2, false)]);
        budgets.recompute(1.0 / 3.0).await;

        assert_eq!(budgets.get("/critical").await.unwrap().effective_budget, 10);
        assert_eq!(budgets.get("/bulk").await.unwrap().effective_budget, 3);

        budgets.recompute(0.0).await;
        assert_eq!(budgets.get("/bulk").await.unwrap().effective_budget, 1);

        budgets.recompute(1.0).await;
        assert_eq!(budgets.get("/bulk").await.unwrap().effective_budget, 10);
    }
}
