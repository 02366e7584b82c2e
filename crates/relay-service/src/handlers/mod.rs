//! HTTP request handlers for the relay service.

pub mod ws;

pub use ws::{connect_default, connect_room, ConnectParams};
