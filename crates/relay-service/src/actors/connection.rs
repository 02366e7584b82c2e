//! `ConnectionActor` - per-WebSocket connection actor.
//!
//! Each `ConnectionActor`:
//! - Owns exactly one upgraded WebSocket
//! - Forwards inbound data frames to its `RoomActor`
//! - Writes frames queued by the room through its `ConnectionHandle`
//!
//! # Lifecycle
//!
//! 1. The connection is admitted by the room before the upgrade completes;
//!    its `welcome` is already queued when the actor starts
//! 2. Runs until the peer closes, the room asks for a close, or the room is
//!    cancelled (close code 1001)
//! 3. On exit, reports the disconnect to the room

use crate::errors::RelayError;
use crate::observability::metrics;

use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::RoomActorHandle;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use common::types::{ConnectionId, PeerId};
use futures::{SinkExt, StreamExt};
use relay_protocol::codec::{self, WireFormat, WireFrame};
use relay_protocol::{ServerMessage, CLOSE_GOING_AWAY};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Default buffer size for a connection's outbound queue.
pub const OUTBOUND_CHANNEL_BUFFER: usize = 256;

/// Work queued for a connection's socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Data frame to write.
    Frame(WireFrame),
    /// Close the socket with the given code.
    Close { code: u16, reason: String },
}

/// Handle to a connection's outbound queue.
///
/// Held by the room session once the connection is admitted. All sends are
/// non-blocking: a full or closed queue is reported as an error and the
/// frame is dropped.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    connection_id: ConnectionId,
    format: WireFormat,
    sender: mpsc::Sender<Outbound>,
    /// Outbound queue monitor, shared with the `ConnectionActor`.
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its outbound queue.
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        format: WireFormat,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let mailbox = Arc::new(MailboxMonitor::new(
            ActorType::Connection,
            connection_id.to_string(),
        ));
        (
            Self {
                connection_id,
                format,
                sender,
                mailbox,
            },
            receiver,
        )
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Outbound encoding chosen at upgrade.
    #[must_use]
    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Encode and queue a message.
    pub fn send(&self, message: &ServerMessage) -> Result<(), RelayError> {
        let frame = codec::encode(message, self.format)?;
        self.send_frame(frame)
    }

    /// Queue an already encoded frame.
    pub fn send_frame(&self, frame: WireFrame) -> Result<(), RelayError> {
        self.push(Outbound::Frame(frame))
    }

    /// Ask the writer to close the socket.
    pub fn close(&self, code: u16, reason: &str) -> Result<(), RelayError> {
        self.push(Outbound::Close {
            code,
            reason: reason.to_string(),
        })
    }

    /// Outbound queue monitor.
    #[must_use]
    pub fn mailbox(&self) -> Arc<MailboxMonitor> {
        Arc::clone(&self.mailbox)
    }

    fn push(&self, item: Outbound) -> Result<(), RelayError> {
        self.mailbox.record_enqueue();
        self.sender.try_send(item).map_err(|e| {
            self.mailbox.record_enqueue_failed();
            map_try_send(e)
        })
    }

    /// Whether the writer side has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

fn map_try_send(e: TrySendError<Outbound>) -> RelayError {
    match e {
        TrySendError::Full(_) => RelayError::SendQueueFull,
        TrySendError::Closed(_) => RelayError::ConnectionClosed,
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    /// Connection ID.
    connection_id: ConnectionId,
    /// Identity assigned by the room at admission.
    peer_id: PeerId,
    /// Room this connection belongs to.
    room: RoomActorHandle,
    /// Frames queued by the room.
    outbound: mpsc::Receiver<Outbound>,
    /// Cancellation token (child of the room's token).
    cancel_token: CancellationToken,
    /// Shared metrics.
    metrics: Arc<ActorMetrics>,
    /// Outbound queue monitor, shared with the handle.
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActor {
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        peer_id: PeerId,
        room: RoomActorHandle,
        outbound: mpsc::Receiver<Outbound>,
        mailbox: Arc<MailboxMonitor>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        Self {
            connection_id,
            peer_id,
            room,
            outbound,
            cancel_token,
            metrics,
            mailbox,
        }
    }

    /// Drive the socket until either side closes.
    #[instrument(
        skip_all,
        name = "relay.actor.connection",
        fields(
            connection_id = %self.connection_id,
            peer_id = %self.peer_id,
            room = %self.room.room()
        )
    )]
    pub async fn run(mut self, socket: WebSocket) {
        self.metrics.connection_created();
        metrics::set_connections_active(self.metrics.connection_count());

        debug!(
            target: "relay.actor.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );

        let (mut sink, mut stream) = socket.split();

        let close = loop {
            tokio::select! {
                // Handle cancellation
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "relay.actor.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
                    break Some((CLOSE_GOING_AWAY, "server shutting down".to_string()));
                }

                // Frames queued by the room
                outbound = self.outbound.recv() => {
                    match outbound {
                        Some(Outbound::Frame(frame)) => {
                            self.mailbox.record_dequeue();
                            if let Err(e) = sink.send(into_message(frame)).await {
                                debug!(
                                    target: "relay.actor.connection",
                                    connection_id = %self.connection_id,
                                    error = %e,
                                    "Socket write failed"
                                );
                                break None;
                            }
                        }
                        Some(Outbound::Close { code, reason }) => {
                            self.mailbox.record_dequeue();
                            break Some((code, reason));
                        }
                        None => {
                            break Some((CLOSE_GOING_AWAY, "room closed".to_string()));
                        }
                    }
                }

                // Frames from the client
                inbound = stream.next() => {
                    let frame = match inbound {
                        Some(Ok(Message::Text(text))) => WireFrame::Text(text),
                        Some(Ok(Message::Binary(bytes))) => WireFrame::Binary(Bytes::from(bytes)),
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                        Some(Ok(Message::Close(frame))) => {
                            debug!(
                                target: "relay.actor.connection",
                                connection_id = %self.connection_id,
                                code = frame.as_ref().map(|f| f.code),
                                "Client closed connection"
                            );
                            break None;
                        }
                        Some(Err(e)) => {
                            debug!(
                                target: "relay.actor.connection",
                                connection_id = %self.connection_id,
                                error = %e,
                                "Socket read failed"
                            );
                            break None;
                        }
                        None => break None,
                    };

                    if self
                        .room
                        .inbound(self.connection_id, frame, Instant::now())
                        .await
                        .is_err()
                    {
                        break Some((CLOSE_GOING_AWAY, "room closed".to_string()));
                    }
                }
            }
        };

        if let Some((code, reason)) = close {
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
        }
        let _ = sink.close().await;

        if let Err(e) = self.room.disconnect(self.connection_id).await {
            debug!(
                target: "relay.actor.connection",
                connection_id = %self.connection_id,
                error = %e,
                "Room already gone on disconnect"
            );
        }

        self.metrics.connection_closed();
        metrics::set_connections_active(self.metrics.connection_count());

        info!(
            target: "relay.actor.connection",
            connection_id = %self.connection_id,
            peer_id = %self.peer_id,
            frames_written = self.mailbox.messages_processed(),
            "ConnectionActor stopped"
        );
    }
}

fn into_message(frame: WireFrame) -> Message {
    match frame {
        WireFrame::Binary(bytes) => Message::Binary(bytes.to_vec()),
        WireFrame::Text(text) => Message::Text(text),
    }
}
