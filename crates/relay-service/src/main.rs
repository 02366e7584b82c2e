//! Room Relay
//!
//! Per-room WebSocket message relay.
//!
//! # Servers
//!
//! The relay runs two servers:
//! - WebSocket server for clients (default: 0.0.0.0:8080)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Initialize actor system (`RoomDirectoryHandle`)
//! 4. Start health HTTP server (liveness, readiness, metrics)
//! 5. Start WebSocket server, then mark ready
//! 6. Wait for shutdown signal
//!
//! # Shutdown
//!
//! Readiness drops first, then every room closes its connections with code
//! 1001, then both servers stop.

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use relay_service::config::Config;
use relay_service::observability::{health_router, init_metrics_recorder, HealthState};
use relay_service::routes::{build_routes, AppState};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long rooms get to close their connections on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Room Relay");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        relay_id = %config.relay_id,
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        allowed_origins = config.allowed_origins.len(),
        max_messages_per_second = config.max_messages_per_second,
        max_connections_per_room = config.max_connections_per_room,
        default_room = %config.default_room,
        max_message_bytes = config.max_message_bytes,
        room_idle_seconds = config.room_idle_timeout.as_secs(),
        max_rooms = config.max_rooms,
        "Configuration loaded successfully"
    );

    // This must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    info!("Initializing actor system...");
    let bind_address = config.bind_address.clone();
    let health_bind_address = config.health_bind_address.clone();
    let state = AppState::new(config);
    info!("Actor system initialized");

    // Cancelled with the directory, so both servers stop once rooms are closed
    let shutdown_token = state.directory.child_token();

    // Start health HTTP server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );

    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Start WebSocket server
    let relay_addr: SocketAddr = bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %bind_address, "Invalid bind address");
        format!("Invalid bind address: {e}")
    })?;

    let relay_listener = tokio::net::TcpListener::bind(relay_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %relay_addr, "Failed to bind WebSocket server");
            format!("Failed to bind WebSocket server to {relay_addr}: {e}")
        })?;

    let app = build_routes(Arc::clone(&state));
    let relay_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %relay_addr, "WebSocket server starting");
        let server = axum::serve(relay_listener, app).with_graceful_shutdown(async move {
            relay_shutdown_token.cancelled().await;
            info!("WebSocket server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "WebSocket server failed");
        }
    });

    health_state.set_ready();
    info!("Room Relay running - press Ctrl+C to shutdown");

    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so k8s stops sending traffic
    health_state.set_not_ready();

    // Closes every connection with 1001, then cancels the directory token
    if let Err(e) = state.directory.shutdown(SHUTDOWN_DEADLINE).await {
        warn!(error = %e, "Actor system shutdown error");
    }
    shutdown_token.cancel();

    // Give the servers time to finish in-flight responses
    tokio::time::sleep(Duration::from_secs(1)).await;

    info!("Room Relay shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
