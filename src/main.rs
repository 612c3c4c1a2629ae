//! Room Engine Server - Authoritative per-room simulation server
//!
//! This is the main entry point for the server. It handles:
//! - WebSocket connections for real-time play
//! - Per-room tick loops running sandboxed game logic
//! - Admin publishing of room logic with hot reload
//! - Room persistence and hibernation (Supabase or in-memory)

mod ai;
mod app;
mod config;
mod game;
mod http;
mod rooms;
mod script;
mod store;
mod util;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::ai::{AiClient, DisabledAi, GeminiClient};
use crate::app::AppState;
use crate::config::Config;
use crate::http::build_router;
use crate::store::{MemoryStore, RoomStore, SupabaseClient, SupabaseStore};
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

    info!("Starting Room Engine Server");
    info!("Server address: {}", config.server_addr);
    info!(
        tick_rate = config.engine.tick_rate,
        hibernate_grace_secs = config.engine.hibernate_grace.as_secs(),
        "Engine configured"
    );

    let store: Arc<dyn RoomStore> = match (&config.supabase_url, &config.supabase_service_role_key) {
        (Some(url), Some(key)) => {
            info!("Persisting rooms to Supabase");
            Arc::new(SupabaseStore::new(SupabaseClient::new(url.as_str(), key.as_str())))
        }
        _ => {
            warn!("SUPABASE_URL not set, rooms are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let ai: Arc<dyn AiClient> = match &config.gemini_api_key {
        Some(key) => Arc::new(GeminiClient::new(key.as_str())),
        None => {
            info!("GEMINI_API_KEY not set, AI requests will fail over to fallback text");
            Arc::new(DisabledAi)
        }
    };

    // Create application state
    let state = AppState::new(config.clone(), store, ai);
    let manager = state.manager.clone();

    // Build router
    let router = build_router(state);

    // Start server
    let addr: SocketAddr = config.server_addr;
    let listener = TcpListener::bind(addr).await?;

    info!("Server listening on {}", addr);
    info!("Health check: http://{}/health", addr);
    info!("WebSocket endpoint: ws://{}/ws?client=<name>", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Persist every resident room before exiting
    manager.shutdown().await;

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
