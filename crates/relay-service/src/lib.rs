//! Room Relay Service Library
//!
//! A per-room WebSocket relay: clients join a named room and every payload
//! one client sends is forwarded verbatim to every other client in that
//! room. The relay never interprets or stores application payloads; it
//! manages membership, connection lifecycle and fairness.
//!
//! # Architecture
//!
//! ```text
//! RoomDirectoryActor (singleton per relay instance)
//! └── RoomActor (one per named room)
//!     ├── owns a RoomSession (registry, rate limiters, broadcast)
//!     └── serves N ConnectionActors (one per WebSocket)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Directory, room and connection actors
//! - [`session`] - Room session: admission, dispatch, broadcast, hibernation
//! - [`handlers`] - WebSocket entry point
//! - [`routes`] - Router and shared application state
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with HTTP status mapping
//! - [`observability`] - Health endpoints and Prometheus metrics

#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

pub mod actors;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod observability;
pub mod routes;
pub mod session;
