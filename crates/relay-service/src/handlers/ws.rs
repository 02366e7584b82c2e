//! WebSocket entry point.
//!
//! - `GET /ws` - Join the configured default room
//! - `GET /ws/{room}` - Join the named room
//!
//! Admission runs before the upgrade completes, so a refused connection gets
//! a plain HTTP response with a JSON error body and never reaches a socket:
//!
//! - 400 Bad Request: invalid room name or `format` query value
//! - 403 Forbidden: `Origin` not in the allow-list
//! - 503 Service Unavailable: room full, room limit reached, or draining

use crate::actors::{ConnectionActor, ConnectionHandle, RoomActorHandle, OUTBOUND_CHANNEL_BUFFER};
use crate::errors::RelayError;
use crate::observability::metrics;
use crate::routes::AppState;
use crate::session::is_valid_room_name;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::header::ORIGIN;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use common::types::{ConnectionId, PeerId};
use relay_protocol::WireFormat;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Outbound encoding: `msgpack` (default) or `json`.
    pub format: Option<String>,
}

/// Handler for `GET /ws` (default room).
pub async fn connect_default(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let room = state.config.default_room.clone();
    connect(state, room, params, &headers, ws).await
}

/// Handler for `GET /ws/{room}`.
pub async fn connect_room(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    connect(state, room, params, &headers, ws).await
}

#[instrument(skip_all, name = "relay.ws.connect", fields(room = %room))]
async fn connect(
    state: Arc<AppState>,
    room: String,
    params: ConnectParams,
    headers: &HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !is_valid_room_name(&room) {
        metrics::record_admission_rejected("invalid_room");
        return RelayError::InvalidRoomName(room).into_response();
    }

    let format = match params.format.as_deref().map(str::parse::<WireFormat>) {
        None => WireFormat::default(),
        Some(Ok(format)) => format,
        Some(Err(_)) => {
            metrics::record_admission_rejected("invalid_format");
            return RelayError::InvalidFormat(params.format.unwrap_or_default()).into_response();
        }
    };

    // Not a WebSocket request; let axum describe what was missing.
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let origin = headers
        .get(ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let connection_id = ConnectionId::new();
    let (handle, outbound) = ConnectionHandle::new(connection_id, format, OUTBOUND_CHANNEL_BUFFER);
    let mailbox = handle.mailbox();

    let (room_handle, peer_id) = match admit(&state, &room, handle, origin).await {
        Ok(admitted) => admitted,
        Err(e) => return e.into_response(),
    };

    info!(
        target: "relay.ws",
        room = %room,
        connection_id = %connection_id,
        peer_id = %peer_id,
        format = %format,
        "Connection admitted, upgrading"
    );

    let actor = ConnectionActor::new(
        connection_id,
        peer_id,
        room_handle.clone(),
        outbound,
        mailbox,
        room_handle.child_token(),
        Arc::clone(&state.metrics),
    );

    ws.max_message_size(state.config.max_message_bytes)
        .on_failed_upgrade({
            let room_handle = room_handle.clone();
            move |e: axum::Error| {
                debug!(
                    target: "relay.ws",
                    connection_id = %connection_id,
                    error = %e,
                    "WebSocket upgrade failed after admission"
                );
                tokio::spawn(async move {
                    let _ = room_handle.disconnect(connection_id).await;
                });
            }
        })
        .on_upgrade(move |socket| actor.run(socket))
}

/// Resolve the room and admit the connection.
///
/// A room that stops between resolve and admit is resolved once more; the
/// directory replaces stopped rooms.
async fn admit(
    state: &AppState,
    room: &str,
    handle: ConnectionHandle,
    origin: Option<String>,
) -> Result<(RoomActorHandle, PeerId), RelayError> {
    let mut retried = false;

    loop {
        let room_handle = match state.directory.resolve(room.to_string()).await {
            Ok(room_handle) => room_handle,
            Err(e) => {
                record_rejection(&e);
                return Err(e);
            }
        };

        match room_handle.admit(handle.clone(), origin.clone()).await {
            Ok(peer_id) => return Ok((room_handle, peer_id)),
            Err(RelayError::RoomClosed(_)) if !retried => {
                debug!(target: "relay.ws", room = %room, "Room closed during admission, retrying");
                retried = true;
            }
            Err(e) => {
                // Origin and capacity refusals are counted by the room itself.
                if matches!(e, RelayError::RoomClosed(_)) {
                    record_rejection(&e);
                }
                return Err(e);
            }
        }
    }
}

fn record_rejection(error: &RelayError) {
    let reason = match error {
        RelayError::DirectoryFull => "directory_full",
        RelayError::Draining => "draining",
        RelayError::RoomClosed(_) => "room_closed",
        _ => "internal",
    };
    metrics::record_admission_rejected(reason);
}

