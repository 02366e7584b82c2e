//! `RoomActor` - per-room actor that owns one `RoomSession`.
//!
//! Each `RoomActor`:
//! - Serializes admission, inbound frames and disconnects for its room
//! - Hibernates its session after a period without activity
//! - Restores the session transparently on the next message
//!
//! # Hibernation
//!
//! A hibernated room keeps only the live connection handles and one
//! encoded attachment per connection. Restoring rebuilds identities and
//! mappings from the attachments; rate limiter history is not retained.
//!
//! # Retirement
//!
//! The directory never cancels an empty room from outside. It queues
//! `RetireIfEmpty` and the room cancels itself only if it is still empty
//! when the request is handled. Admissions queued behind it are refused
//! with `RoomClosed` so the caller resolves a fresh room.

use crate::errors::RelayError;
use crate::observability::metrics;
use crate::session::{
    ConnectionAttachment, HibernatedConnection, InboundOutcome, RoomPolicy, RoomSession,
};

use super::connection::ConnectionHandle;
use super::messages::{RoomMessage, RoomState};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::types::{ConnectionId, PeerId};
use relay_protocol::{WireFrame, CLOSE_GOING_AWAY};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// How often an active room checks whether it has gone idle.
pub const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to a `RoomActor`.
#[derive(Clone, Debug)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room: String,
    /// Connection count, updated by the actor after every change.
    occupancy: Arc<AtomicUsize>,
    mailbox: Arc<MailboxMonitor>,
}

impl RoomActorHandle {
    #[must_use]
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Current number of members, without a mailbox round trip.
    #[must_use]
    pub fn occupancy(&self) -> usize {
        self.occupancy.load(Ordering::Relaxed)
    }

    /// Mailbox monitor shared with the actor.
    #[must_use]
    pub fn mailbox(&self) -> &MailboxMonitor {
        &self.mailbox
    }

    /// Admit a connection.
    ///
    /// The connection's `welcome` is queued on its handle before this returns.
    /// A room that has been cancelled answers `RoomClosed`.
    pub async fn admit(
        &self,
        handle: ConnectionHandle,
        origin: Option<String>,
    ) -> Result<PeerId, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::Admit {
            handle,
            origin,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|_| RelayError::RoomClosed(self.room.clone()))?
    }

    /// Forward a data frame from a member.
    pub async fn inbound(
        &self,
        connection_id: ConnectionId,
        frame: WireFrame,
        received_at: Instant,
    ) -> Result<(), RelayError> {
        self.send(RoomMessage::Inbound {
            connection_id,
            frame,
            received_at,
        })
        .await
    }

    /// Report that a member's socket has closed.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> Result<(), RelayError> {
        self.send(RoomMessage::Disconnect { connection_id }).await
    }

    /// Get current room state. Does not wake a hibernated room.
    pub async fn get_state(&self) -> Result<RoomState, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::GetState { respond_to: tx }).await?;

        rx.await
            .map_err(|_| RelayError::RoomClosed(self.room.clone()))
    }

    /// Ask the room to stop if it still has no members when it gets to the
    /// request. Never waits; returns whether the request was queued.
    pub fn retire_if_empty(&self) -> bool {
        self.mailbox.record_enqueue();
        if self.sender.try_send(RoomMessage::RetireIfEmpty).is_ok() {
            true
        } else {
            self.mailbox.record_enqueue_failed();
            false
        }
    }

    async fn send(&self, message: RoomMessage) -> Result<(), RelayError> {
        self.mailbox.record_enqueue();
        self.sender.send(message).await.map_err(|_| {
            self.mailbox.record_enqueue_failed();
            RelayError::RoomClosed(self.room.clone())
        })
    }

    /// Cancel the room and every connection in it.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Token for a connection actor in this room.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room: String,
    receiver: mpsc::Receiver<RoomMessage>,
    cancel_token: CancellationToken,
    policy: RoomPolicy,
    /// Live session; `None` while hibernated.
    session: Option<RoomSession>,
    /// Connections held while hibernated.
    hibernated: Vec<HibernatedConnection>,
    idle_timeout: Duration,
    last_activity: Instant,
    hibernations: u64,
    occupancy: Arc<AtomicUsize>,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl RoomActor {
    /// Spawn a new room actor.
    #[must_use]
    pub fn spawn(
        room: String,
        policy: RoomPolicy,
        idle_timeout: Duration,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (actor, handle) = Self::new(room, policy, idle_timeout, cancel_token, metrics);
        let task_handle = tokio::spawn(actor.run());
        (handle, task_handle)
    }

    fn new(
        room: String,
        policy: RoomPolicy,
        idle_timeout: Duration,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (Self, RoomActorHandle) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        let occupancy = Arc::new(AtomicUsize::new(0));
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Room, &room));

        let actor = Self {
            room: room.clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            session: Some(RoomSession::new(room.clone(), policy.clone())),
            policy,
            hibernated: Vec::new(),
            idle_timeout,
            last_activity: Instant::now(),
            hibernations: 0,
            occupancy: Arc::clone(&occupancy),
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room,
            occupancy,
            mailbox,
        };

        (actor, handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "relay.actor.room", fields(room = %self.room))]
    async fn run(mut self) {
        debug!(
            target: "relay.actor.room",
            room = %self.room,
            "RoomActor started"
        );

        let mut idle_check = tokio::time::interval(IDLE_CHECK_INTERVAL);
        idle_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // Handle cancellation
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "relay.actor.room",
                        room = %self.room,
                        "RoomActor received cancellation signal"
                    );
                    self.close_connections();
                    break;
                }

                _ = idle_check.tick() => {
                    self.check_idle();
                }

                // Handle messages
                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_dequeue();
                            self.handle_message(message);
                            self.metrics.record_message_processed();
                        }
                        None => {
                            debug!(
                                target: "relay.actor.room",
                                room = %self.room,
                                "RoomActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "relay.actor.room",
            room = %self.room,
            connections = self.connection_count(),
            hibernations = self.hibernations,
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Admit {
                handle,
                origin,
                respond_to,
            } => {
                if self.cancel_token.is_cancelled() {
                    debug!(
                        target: "relay.actor.room",
                        room = %self.room,
                        connection_id = %handle.connection_id(),
                        "Refusing admission to a closing room"
                    );
                    let _ = respond_to.send(Err(RelayError::RoomClosed(self.room.clone())));
                    return;
                }

                self.last_activity = Instant::now();
                let connection_id = handle.connection_id();
                let result = self.active_session().admit(handle, origin.as_deref());

                match &result {
                    Ok(peer_id) => {
                        info!(
                            target: "relay.actor.room",
                            room = %self.room,
                            connection_id = %connection_id,
                            peer_id = %peer_id,
                            connections = self.connection_count(),
                            "Connection admitted"
                        );
                    }
                    Err(e) => {
                        debug!(
                            target: "relay.actor.room",
                            room = %self.room,
                            connection_id = %connection_id,
                            reason = e.reason(),
                            "Admission refused"
                        );
                        metrics::record_admission_rejected(e.reason());
                    }
                }

                self.update_occupancy();
                let _ = respond_to.send(result.map_err(RelayError::from));
            }

            RoomMessage::Inbound {
                connection_id,
                frame,
                received_at,
            } => {
                self.last_activity = Instant::now();
                let outcome = self
                    .active_session()
                    .on_message(connection_id, &frame, received_at);
                if outcome == InboundOutcome::ProtocolMismatch {
                    self.update_occupancy();
                }
                record_outcome(outcome, received_at);
            }

            RoomMessage::Disconnect { connection_id } => {
                self.last_activity = Instant::now();
                if let Some(peer_id) = self.active_session().on_disconnect(connection_id) {
                    info!(
                        target: "relay.actor.room",
                        room = %self.room,
                        connection_id = %connection_id,
                        peer_id = %peer_id,
                        connections = self.connection_count(),
                        "Connection left"
                    );
                }
                self.update_occupancy();
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.get_state());
            }

            RoomMessage::RetireIfEmpty => {
                if self.connection_count() == 0 {
                    debug!(
                        target: "relay.actor.room",
                        room = %self.room,
                        "Retiring empty room"
                    );
                    self.cancel_token.cancel();
                }
            }
        }
    }

    /// The live session, restoring it from hibernation if needed.
    fn active_session(&mut self) -> &mut RoomSession {
        if self.session.is_none() {
            let connections = std::mem::take(&mut self.hibernated);
            debug!(
                target: "relay.actor.room",
                room = %self.room,
                connections = connections.len(),
                "Restoring hibernated room"
            );
            self.session = Some(RoomSession::restore(
                self.room.clone(),
                self.policy.clone(),
                connections,
            ));
        }

        self.session
            .get_or_insert_with(|| RoomSession::new(self.room.clone(), self.policy.clone()))
    }

    /// Hibernate the session once the room has been idle long enough.
    fn check_idle(&mut self) {
        if self.last_activity.elapsed() < self.idle_timeout {
            return;
        }
        let Some(session) = self.session.take() else {
            return;
        };

        self.hibernated = session.hibernate();
        self.hibernations += 1;
        self.update_occupancy();
        metrics::record_room_hibernation();

        debug!(
            target: "relay.actor.room",
            room = %self.room,
            connections = self.hibernated.len(),
            "Room hibernated"
        );
    }

    fn close_connections(&self) {
        match &self.session {
            Some(session) => session.close_all(CLOSE_GOING_AWAY, "server shutting down"),
            None => {
                for connection in &self.hibernated {
                    let _ = connection
                        .handle
                        .close(CLOSE_GOING_AWAY, "server shutting down");
                }
            }
        }
    }

    fn connection_count(&self) -> usize {
        self.session
            .as_ref()
            .map_or(self.hibernated.len(), RoomSession::len)
    }

    fn update_occupancy(&self) {
        self.occupancy
            .store(self.connection_count(), Ordering::Relaxed);
    }

    fn get_state(&self) -> RoomState {
        let peers = match &self.session {
            Some(session) => session.peer_ids(),
            None => self
                .hibernated
                .iter()
                .filter_map(|connection| {
                    ConnectionAttachment::decode(&connection.attachment)
                        .ok()
                        .map(|attachment| attachment.peer_id)
                })
                .collect(),
        };

        RoomState {
            room: self.room.clone(),
            connection_count: self.connection_count(),
            peers,
            is_hibernated: self.session.is_none(),
            hibernations: self.hibernations,
        }
    }
}

fn record_outcome(outcome: InboundOutcome, received_at: Instant) {
    match outcome {
        InboundOutcome::Relayed { .. } => metrics::record_message_relayed(),
        InboundOutcome::RateLimited => metrics::record_message_rejected("rate_limited"),
        InboundOutcome::Invalid => metrics::record_message_rejected("invalid_message"),
        InboundOutcome::ProtocolMismatch => metrics::record_message_rejected("bad_protocol"),
        InboundOutcome::UnknownConnection => {
            metrics::record_message_rejected("unknown_connection");
        }
        InboundOutcome::Hello | InboundOutcome::Pong => {}
    }
    metrics::record_message_latency(outcome.message_type(), received_at.elapsed());
}
