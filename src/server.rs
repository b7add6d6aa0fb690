/// Server setup and initialization
///
/// Wires together all components: storage, node registry, Job Scheduler, activation,
/// execution and inbound email. Provides the application factory used by `main` and
/// by the integration tests.

use crate::{
    api::{create_execution_routes, create_flow_routes, create_webhook_routes, AppState},
    config::Config,
    database,
    runtime::NodeRegistry,
    scheduler::{HttpJobScheduler, JobScheduler, LocalJobScheduler},
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Build the router over already-constructed state
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check endpoint
        .route("/healthz", get(health_check))
        .merge(create_flow_routes())
        .merge(create_execution_routes())
        .merge(create_webhook_routes())
        .with_state(state)
}

/// Pick the Job Scheduler backend from configuration
async fn build_scheduler(config: &Config) -> Result<Arc<dyn JobScheduler>> {
    match (&config.scheduler.url, &config.scheduler.token) {
        (Some(url), Some(token)) => {
            tracing::info!("🌐 Using remote job scheduler at {}", url);
            Ok(Arc::new(HttpJobScheduler::new(url.clone(), token.clone())))
        }
        _ => {
            tracing::info!("⏰ Using in-process job scheduler");
            let scheduler = LocalJobScheduler::new()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to initialize job scheduler: {}", e))?;
            scheduler.start().await?;
            Ok(Arc::new(scheduler))
        }
    }
}

/// Create the main Axum application with all routes
pub async fn create_app(config: Config) -> Result<Router> {
    tracing::info!("📁 Opening flow store in {}", config.database.data_dir);
    let pool = database::connect(&config.database.data_dir).await?;

    let scheduler = build_scheduler(&config).await?;

    tracing::info!("🧩 Initializing node registry");
    let registry = Arc::new(NodeRegistry::with_builtin_nodes());
    tracing::debug!("Registered nodes: {:?}", registry.node_ids());

    let state = AppState::new(pool, Arc::new(config), scheduler, registry);

    tracing::info!("✅ Application initialized successfully");
    Ok(create_router(state))
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting flowkeeper server...");

    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);
    tracing::info!("Scheduler callbacks target {}", config.execution_url());

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}
