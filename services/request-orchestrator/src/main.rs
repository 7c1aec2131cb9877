use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use request_orchestrator::{OrchestratorConfig, RequestOrchestrator};

/// Application state shared across handlers
pub struct AppState {
    pub orchestrator: RequestOrchestrator,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging; RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Request Orchestrator...");

    let config_path =
        std::env::var("ORCHESTRATOR_CONFIG").unwrap_or_else(|_| "orchestrator.toml".to_string());
    let config = OrchestratorConfig::load(&config_path)?;
    info!(
        "✓ Configuration loaded from {} ({} identities)",
        config_path,
        config.identities.len()
    );

    let orchestrator = RequestOrchestrator::new(config)?;
    let maintenance = orchestrator.start_maintenance();
    info!("✓ Maintenance loop started");

    let state = Arc::new(AppState { orchestrator });

    let app = Router::new()
        .route("/v1/requests", post(handlers::create_request))
        .route("/v1/requests/batch", post(handlers::create_requests_batch))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .layer(CorsLayer::new().allow_origin(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("🚀 Request Orchestrator listening on port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    maintenance.shutdown().await;
    info!("Request Orchestrator stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

mod handlers;
