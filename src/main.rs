/// flowkeeper server entry point
///
/// Loads configuration from the environment and serves:
/// - Flow management and activation at /api/flows/*
/// - The scheduler execution callback at /api/executions
/// - The inbound email webhook at /api/webhooks/email
/// - Health check at /healthz

use flowkeeper::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
