//! Tactics Game Server - authoritative session server for turn-based
//! tactical multiplayer combat
//!
//! This is the main entry point for the server. It handles:
//! - WebSocket connections for real-time session sync
//! - Turn-ordered combat sessions with per-turn deadlines
//! - HTTP endpoints for lobby browsing, session and bot administration
//! - Autonomous bot participants that play through the same APIs

mod app;
mod bots;
mod cache;
mod config;
mod game;
mod http;
mod session;
mod store;
mod sync;
mod util;
mod ws;

#[cfg(test)]
mod testutil;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::AppState;
use crate::config::Config;
use crate::http::build_router;
use crate::store::bots::BotKind;
use crate::util::time::init_server_time;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    init_tracing(&config.log_level);

    // Initialize server time tracking
    init_server_time();

    info!("Starting Tactics Game Server");
    info!("Server address: {}", config.server_addr);

    // Create application state
    let state = AppState::new(config.clone());

    // Startup recovery: connection maps and bot tasks are in-process
    // only, so durable flags left over from a previous process are stale.
    if let Err(e) = state.session_store.reset_connected_flags().await {
        warn!(error = %e, "Connected-flag reset failed");
    }
    state.bots.recover().await;

    // Spawn the socket liveness probe
    let heartbeat = state.connections.clone();
    let interval = Duration::from_secs(state.config.heartbeat_interval_secs);
    let timeout = Duration::from_secs(state.config.heartbeat_timeout_secs);
    tokio::spawn(async move {
        heartbeat.run_heartbeat(interval, timeout).await;
    });

    // Keep at least one host bot tending the public lobby pool
    if state.config.bot_min_public_lobbies > 0 {
        if let Err(e) = state.bots.start_bot(BotKind::Host).await {
            warn!(error = %e, "Initial host bot failed to start");
        }
    }

    // Build router
    let router = build_router(state);

    // Start server
    let addr: SocketAddr = config.server_addr;
    let listener = TcpListener::bind(addr).await?;

    info!("Server listening on {}", addr);
    info!("Health check: http://{}/health", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        }
    }
}
