//! Test server harness for E2E testing
//!
//! Provides `TestRelayServer` for spawning real relay instances in tests.

use relay_service::config::Config;
use relay_service::routes::{self, AppState};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Test harness for spawning the relay's WebSocket server in E2E tests.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_welcome_e2e() -> Result<(), anyhow::Error> {
///     let server = TestRelayServer::spawn().await?;
///     let mut client = TestClient::connect(&server.ws_url(None)).await?;
///
///     let welcome = client.next_message().await?;
///     assert!(matches!(welcome, ServerMessage::Welcome { .. }));
///     Ok(())
/// }
/// ```
pub struct TestRelayServer {
    addr: SocketAddr,
    state: Arc<AppState>,
    _handle: JoinHandle<()>,
}

impl TestRelayServer {
    /// Spawn a relay with default configuration.
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with(&[]).await
    }

    /// Spawn a relay with the given `RELAY_*` overrides.
    ///
    /// The server will:
    /// - Bind to a random available port (127.0.0.1:0)
    /// - Start the WebSocket server in the background
    pub async fn spawn_with(overrides: &[(&str, &str)]) -> Result<Self, anyhow::Error> {
        let mut vars = HashMap::from([
            ("RELAY_BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
            ("RELAY_ID".to_string(), "relay-test".to_string()),
        ]);
        for (name, value) in overrides {
            vars.insert((*name).to_string(), (*value).to_string());
        }

        let config = Config::from_vars(&vars)
            .map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))?;

        let state = AppState::new(config);

        // Build routes using the relay's real route builder
        let app = routes::build_routes(Arc::clone(&state));

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            state,
            _handle: handle,
        })
    }

    /// WebSocket URL for a room; `None` targets the default room.
    pub fn ws_url(&self, room: Option<&str>) -> String {
        match room {
            Some(room) => format!("ws://{}/ws/{}", self.addr, room),
            None => format!("ws://{}/ws", self.addr),
        }
    }

    /// Get the base HTTP URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shared state, for inspecting the room directory.
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn config(&self) -> &Config {
        &self.state.config
    }
}

impl Drop for TestRelayServer {
    fn drop(&mut self) {
        // Stop accepting, then close every room and its sockets
        self._handle.abort();
        self.state.directory.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_spawns_successfully() -> Result<(), anyhow::Error> {
        let server = TestRelayServer::spawn().await?;

        assert!(server.url().starts_with("http://127.0.0.1:"));
        assert!(server.addr().ip().is_loopback());
        assert!(server.addr().port() > 0);
        assert_eq!(server.ws_url(None), format!("ws://{}/ws", server.addr()));
        assert_eq!(
            server.ws_url(Some("room-1")),
            format!("ws://{}/ws/room-1", server.addr())
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_overrides_reach_config() -> Result<(), anyhow::Error> {
        let server = TestRelayServer::spawn_with(&[
            ("RELAY_MAX_CONNECTIONS_PER_ROOM", "2"),
            ("RELAY_DEFAULT_ROOM", "main"),
        ])
        .await?;

        assert_eq!(server.config().max_connections_per_room, 2);
        assert_eq!(server.config().default_room, "main");

        let status = server.state().directory.get_status().await?;
        assert_eq!(status.room_count, 0);

        Ok(())
    }
}
