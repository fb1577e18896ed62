mod api;
mod config;
mod db;
mod error;
mod gateway;
mod services;
mod sfu;
mod state;
mod types;

use std::sync::Arc;
use std::time::Instant;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::gateway::GatewayState;
use crate::services::presence::PresenceStore;
use crate::sfu::SfuCoordinator;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load config
    let config = AppConfig::load()?;
    tracing::info!(name = %config.instance.name, "Starting Reson8 server");

    // Connect to database
    let db = db::create_pool(&config.database.url, config.database.max_connections).await?;
    tracing::info!("Database connected and migrations applied");

    // Ensure the server row (and, opt-in, the default template) exists
    let server = db::seed::run(&db, &config.instance).await?;
    tracing::info!(server_id = %server.id, "Serving {}", server.name);

    // Connect to Redis
    let redis_client = redis::Client::open(config.redis.url.as_str())?;
    let redis = redis::aio::ConnectionManager::new(redis_client).await?;
    tracing::info!("Redis connected");

    // Spin up the SFU worker pool
    let sfu = SfuCoordinator::new(&config.sfu).await?;

    // Build application state
    let state = AppState {
        db: db.clone(),
        presence: PresenceStore::new(redis),
        config: Arc::new(config.clone()),
        gateway: Arc::new(GatewayState::new()),
        sfu: Arc::new(sfu),
        started_at: Instant::now(),
    };

    // Build router
    let app = api::router()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    // SFU and transport are down by now; the stores go last
    db.close().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Wait for an interrupt, then close the SFU before letting the transport
/// drain; the stores are closed by main once serving stops.
async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutting down...");
    state.sfu.close();
}
