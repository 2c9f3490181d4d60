//! Main Entrypoint for the Realtime Relay Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging.
//! 3. Constructing the Axum router and applying middleware.
//! 4. Binding the gated listener and serving until shutdown.

use anyhow::Context;
use interview_relay::{
    config::{API_KEY_VARS, Config},
    listener::GatedListener,
    router::create_router,
    state::AppState,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded.");

    if config.api_key.is_none() {
        warn!(
            vars = ?API_KEY_VARS,
            "No provider API key is set. Realtime sessions will fail until one is configured."
        );
    }

    let bind_address = config.bind_address;
    let handshake_timeout = config.handshake_timeout;
    info!(
        environment = ?config.environment,
        upstream = %config.upstream_url,
        upstream_debug = config.upstream_debug,
        "Service configured."
    );

    let app_state = Arc::new(AppState {
        config: Arc::new(config),
    });

    // --- 3. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 4. Start Server ---
    let listener = GatedListener::bind(bind_address, handshake_timeout)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    info!(%bind_address, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server has shut down.");
    Ok(())
}
