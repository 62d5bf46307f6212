/// flowrun: workflow execution engine
///
/// Main entry point for the flowrun server. Registers the demo flows, then
/// starts the HTTP server and trigger scheduler.

use flowrun::{config::Config, demo::register_demo_flows, server::start_server, workflow::Registry};
use std::sync::Arc;

/// Application entry point
///
/// The server provides:
/// - Flow listing and manual runs at /api/flows/*
/// - Execution history at /api/executions/*
/// - Trigger management at /api/triggers/*
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration (defaults to 0.0.0.0:3004 and ./data)
    let config = Config::default();

    let registry = Arc::new(Registry::new());
    register_demo_flows(&registry)?;

    start_server(config, registry).await?;

    Ok(())
}
