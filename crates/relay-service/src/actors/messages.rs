//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via `tokio::sync::mpsc`.
//! Request-reply uses `tokio::sync::oneshot`.

use crate::errors::RelayError;

use super::connection::ConnectionHandle;
use super::room::RoomActorHandle;

use common::types::{ConnectionId, PeerId};
use relay_protocol::WireFrame;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Messages sent to `RoomDirectoryActor`.
#[derive(Debug)]
pub enum DirectoryMessage {
    /// Get the room with this name, creating it on first access.
    Resolve {
        room: String,
        respond_to: oneshot::Sender<Result<RoomActorHandle, RelayError>>,
    },

    /// Get information about an existing room.
    GetRoom {
        room: String,
        respond_to: oneshot::Sender<Result<RoomInfo, RelayError>>,
    },

    /// Stop and forget a room.
    RemoveRoom {
        room: String,
        respond_to: oneshot::Sender<Result<(), RelayError>>,
    },

    /// Get directory status (for health checks).
    GetStatus {
        respond_to: oneshot::Sender<DirectoryStatus>,
    },

    /// Stop accepting new rooms and shut everything down.
    Shutdown {
        /// How long to wait for rooms to close their connections.
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), RelayError>>,
    },
}

/// Messages sent to `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    /// Admit a connection before its upgrade completes.
    Admit {
        handle: ConnectionHandle,
        /// `Origin` header, if present.
        origin: Option<String>,
        respond_to: oneshot::Sender<Result<PeerId, RelayError>>,
    },

    /// A data frame from a member.
    Inbound {
        connection_id: ConnectionId,
        frame: WireFrame,
        received_at: Instant,
    },

    /// A member's socket has closed.
    Disconnect { connection_id: ConnectionId },

    /// Get current room state (for debugging/health).
    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },

    /// Stop the room if it has no members when this is handled.
    RetireIfEmpty,
}

/// Snapshot of one room.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: String,
    /// Members in join order.
    pub peers: Vec<PeerId>,
    pub connection_count: usize,
    pub is_hibernated: bool,
    /// Times this room has hibernated since creation.
    pub hibernations: u64,
}

/// Directory view of one room.
#[derive(Debug, Clone)]
pub struct RoomInfo {
    pub room: String,
    pub connection_count: usize,
    /// Unix timestamp (seconds).
    pub created_at: i64,
    pub is_hibernated: bool,
}

/// Directory status.
#[derive(Debug, Clone, Copy)]
pub struct DirectoryStatus {
    pub room_count: usize,
    pub connection_count: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}
