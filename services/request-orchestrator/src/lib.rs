//! Outbound request orchestration
//!
//! Spreads calls to rate-limited upstream APIs across a pool of egress
//! identities, tracks per-identity health, backs off adaptively and falls
//! back to cached or synthesized data when every identity is exhausted.
//!
//! [`RequestOrchestrator::orchestrate`] never returns an error; inspect
//! [`Payload::source`] to tell live data from a fallback.

pub mod backoff;
pub mod budget;
pub mod cancel;
pub mod config;
pub mod executor;
pub mod fallback;
pub mod identity;
pub mod maintenance;
pub mod observability;
pub mod orchestrator;
pub mod signature;
pub mod types;

pub use backoff::BackoffPlanner;
pub use budget::{BudgetDecision, EndpointBudgets};
pub use cancel::{CancelHandle, CancelToken};
pub use config::OrchestratorConfig;
pub use executor::{HttpTransport, OutboundRequest, RequestExecutor, Transport, TransportError, TransportResponse};
pub use fallback::{FallbackSynthesizer, ResultCache};
pub use identity::{CoolDownTrigger, Identity, IdentityPool, IdentityState};
pub use maintenance::{MaintenanceHandle, MaintenanceLoop};
pub use observability::{MetricsCollector, OrchestratorEvent};
pub use orchestrator::{OrchestratorBuilder, RequestOrchestrator};
pub use signature::{Signature, SignatureGenerator};
pub use types::*;
