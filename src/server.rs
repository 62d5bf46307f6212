/// Server setup and initialization
///
/// Wires together all components: SQLite stores, registry, engine, scheduler,
/// and HTTP routes. Provides the application factory for the Axum app.

use crate::{
    api::{create_api_routes, AppState},
    config::Config,
    history::SqliteHistoryStore,
    runtime::Engine,
    trigger::SqliteTriggerStore,
    workflow::Registry,
};
use anyhow::Result;
use axum::{routing::get, Router};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Open the database under the data directory and build the engine
///
/// The registry should already hold every task and flow; triggers loaded at
/// start-up may refer to them.
pub async fn create_engine(config: &Config, registry: Arc<Registry>) -> Result<Engine> {
    tracing::info!("📁 Ensuring data directory exists: {}", config.database.data_dir);
    std::fs::create_dir_all(&config.database.data_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create data directory: {}", e))?;

    let db_path = config.database.db_path();
    tracing::info!("🗄️ Opening database: {}", db_path.display());
    let options = SqliteConnectOptions::new()
        .filename(&db_path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open database {}: {}", db_path.display(), e))?;

    tracing::info!("📋 Initializing history and trigger tables");
    let history = SqliteHistoryStore::new(pool.clone());
    history.init_schema().await?;
    let triggers = SqliteTriggerStore::new(pool);
    triggers.init_schema().await?;

    tracing::info!("⚙️ Initializing engine with {} worker slot(s)", config.engine.max_workers);
    Ok(Engine::new(
        registry,
        Arc::new(history),
        Arc::new(triggers),
        &config.engine,
    ))
}

/// Create the main Axum application with all routes
pub fn create_app(engine: Engine) -> Router {
    Router::new()
        // Health check endpoint
        .route("/healthz", get(health_check))
        // Flow, execution and trigger API routes
        .merge(create_api_routes().with_state(AppState { engine }))
}

/// Start the HTTP server with the given configuration
///
/// Builds the engine over the registry, starts the trigger scheduler and
/// serves until Ctrl-C.
pub async fn start_server(config: Config, registry: Arc<Registry>) -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting flowrun server...");

    let engine = create_engine(&config, registry).await?;

    tracing::info!("🚀 Starting trigger scheduler");
    let scheduler = engine.start_scheduler().await?;

    let app = create_app(engine.clone());

    // Bind to the configured address
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    tracing::info!("Shutting down scheduler");
    engine.shutdown();
    scheduler.await?;

    Ok(())
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
