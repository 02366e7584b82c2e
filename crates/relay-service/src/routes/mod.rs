//! HTTP routes for the relay service.
//!
//! Defines the Axum router and application state.

use crate::actors::{ActorMetrics, RoomDirectoryHandle};
use crate::config::Config;
use crate::handlers;
use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Service configuration.
    pub config: Config,

    /// Room directory actor.
    pub directory: RoomDirectoryHandle,

    /// Shared actor metrics.
    pub metrics: Arc<ActorMetrics>,
}

impl AppState {
    /// Spawn a room directory for `config` and wrap it in shared state.
    #[must_use]
    pub fn new(config: Config) -> Arc<Self> {
        let metrics = ActorMetrics::new();
        let directory = RoomDirectoryHandle::new(
            config.relay_id.clone(),
            config.directory_config(),
            Arc::clone(&metrics),
        );

        Arc::new(Self {
            config,
            directory,
            metrics,
        })
    }
}

/// Build the application routes.
///
/// Creates an Axum router with:
/// - `/ws` - Join the default room
/// - `/ws/{room}` - Join a named room
/// - TraceLayer for request logging
///
/// No request timeout: upgraded sockets outlive the request.
pub fn build_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(handlers::connect_default))
        .route("/ws/:room", get(handlers::connect_room))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
