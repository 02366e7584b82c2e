//! # Relay Test Utilities
//!
//! Shared test utilities for the Room Relay service.
//!
//! ## Modules
//!
//! - `fixtures` - Test connection pairs, frame builders and room policies
//! - `server_harness` - `TestRelayServer`, a real relay bound to a random port
//! - `ws_client` - `TestClient`, a WebSocket client that decodes relay frames
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relay_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<(), anyhow::Error> {
//!     let server = TestRelayServer::spawn().await?;
//!
//!     let mut alice = TestClient::connect(&server.ws_url(Some("room-1"))).await?;
//!     let welcome = alice.next_message().await?;
//!
//!     // Run your test...
//!     Ok(())
//! }
//! ```

pub mod fixtures;
pub mod server_harness;
pub mod ws_client;

// Re-export commonly used items
pub use fixtures::*;
pub use server_harness::TestRelayServer;
pub use ws_client::{ClientOptions, TestClient};
