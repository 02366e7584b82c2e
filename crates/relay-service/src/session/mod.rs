//! Room session manager.
//!
//! A `RoomSession` owns the membership state of one room: it admits
//! connections, assigns identities, answers control messages and relays
//! everything else to the other members. It is plain synchronous state;
//! the owning `RoomActor` serializes every call through its mailbox.
//!
//! Hibernation reduces a session to its live connection handles plus one
//! self-describing attachment per connection. Restoring rebuilds the
//! registry from those attachments with empty rate limiters.

pub mod rate_limiter;
pub mod registry;

pub use rate_limiter::{RateLimiter, RATE_LIMIT_WINDOW};
pub use registry::{ConnectionEntry, ConnectionRegistry, RegistryError};

use crate::actors::connection::ConnectionHandle;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use common::types::{ConnectionId, PeerId};
use relay_protocol::codec::{self, WireFormat, WireFrame};
use relay_protocol::message::is_supported_version;
use relay_protocol::{ClientMessage, ErrorCode, ServerMessage, CLOSE_BAD_PROTOCOL, CLOSE_GOING_AWAY};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Maximum room name length.
pub const MAX_ROOM_NAME_LEN: usize = 64;

/// Room names are 1-64 characters of `[A-Za-z0-9_-]`.
#[must_use]
pub fn is_valid_room_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_ROOM_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Admission and fairness limits applied to every room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomPolicy {
    /// Maximum concurrent connections per room.
    pub max_connections: usize,
    /// Inbound messages accepted per connection per second.
    pub max_messages_per_second: usize,
    /// Allowed `Origin` values; empty allows every origin.
    pub allowed_origins: HashSet<String>,
}

impl RoomPolicy {
    /// Whether a connection presenting `origin` may join.
    ///
    /// A missing or empty origin is always allowed.
    #[must_use]
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        match origin {
            None | Some("") => true,
            Some(origin) => self.allowed_origins.contains(origin),
        }
    }
}

/// Why a connection was refused.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Origin not allowed")]
    OriginRejected,

    #[error("Room is full")]
    RoomFull,

    #[error("Connection already admitted")]
    AlreadyAdmitted,
}

impl AdmissionError {
    /// Metrics label.
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            AdmissionError::OriginRejected => "origin_rejected",
            AdmissionError::RoomFull => "room_full",
            AdmissionError::AlreadyAdmitted => "already_admitted",
        }
    }
}

/// Self-describing per-connection state that survives hibernation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAttachment {
    pub peer_id: PeerId,
    pub joined_at: DateTime<Utc>,
}

impl ConnectionAttachment {
    /// Serialize as a named-field MessagePack map.
    pub fn encode(&self) -> Result<Bytes, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self).map(Bytes::from)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// A live connection held by a hibernated room.
#[derive(Debug, Clone)]
pub struct HibernatedConnection {
    pub handle: ConnectionHandle,
    /// Encoded [`ConnectionAttachment`].
    pub attachment: Bytes,
}

/// What happened to one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Connection is not registered; frame dropped.
    UnknownConnection,
    /// Sender exceeded its rate; `RATE_LIMITED` sent.
    RateLimited,
    /// Payload undecodable or not an object/array; `INVALID_MESSAGE` sent.
    Invalid,
    /// `hello` consumed without a reply.
    Hello,
    /// `hello` with an unsupported version; `BAD_PROTOCOL` sent and close queued.
    ProtocolMismatch,
    /// `pong` sent to the sender.
    Pong,
    /// Relayed to this many members.
    Relayed { recipients: usize },
}

impl InboundOutcome {
    /// Label for `relay_message_latency_seconds`.
    #[must_use]
    pub const fn message_type(self) -> &'static str {
        match self {
            InboundOutcome::UnknownConnection => "unknown",
            InboundOutcome::RateLimited => "rate_limited",
            InboundOutcome::Invalid => "invalid",
            InboundOutcome::Hello | InboundOutcome::ProtocolMismatch => "hello",
            InboundOutcome::Pong => "ping",
            InboundOutcome::Relayed { .. } => "relay",
        }
    }
}

/// Membership and relay state for one room.
#[derive(Debug)]
pub struct RoomSession {
    room: String,
    policy: RoomPolicy,
    registry: ConnectionRegistry,
}

impl RoomSession {
    #[must_use]
    pub fn new(room: impl Into<String>, policy: RoomPolicy) -> Self {
        Self {
            room: room.into(),
            policy,
            registry: ConnectionRegistry::new(),
        }
    }

    /// Rebuild a session from hibernated connections.
    ///
    /// Identities and join times come from the attachments; every rate
    /// limiter starts empty. Connections whose attachment cannot be read are
    /// closed.
    #[must_use]
    pub fn restore(
        room: impl Into<String>,
        policy: RoomPolicy,
        connections: Vec<HibernatedConnection>,
    ) -> Self {
        let mut session = Self::new(room, policy);

        for HibernatedConnection { handle, attachment } in connections {
            let attachment = match ConnectionAttachment::decode(&attachment) {
                Ok(attachment) => attachment,
                Err(e) => {
                    warn!(
                        target: "relay.session",
                        room = %session.room,
                        connection_id = %handle.connection_id(),
                        error = %e,
                        "Unreadable attachment, closing connection"
                    );
                    let _ = handle.close(CLOSE_GOING_AWAY, "session lost");
                    continue;
                }
            };

            let entry = ConnectionEntry::new(
                attachment.peer_id,
                handle,
                RateLimiter::new(session.policy.max_messages_per_second),
                attachment.joined_at,
            );
            if let Err(e) = session.registry.register(entry) {
                warn!(
                    target: "relay.session",
                    room = %session.room,
                    error = %e,
                    "Skipping duplicate connection during restore"
                );
            }
        }

        session
    }

    /// Reduce the session to its live handles and their attachments.
    #[must_use]
    pub fn hibernate(mut self) -> Vec<HibernatedConnection> {
        let room = self.room;
        self.registry
            .drain()
            .into_iter()
            .filter_map(|entry| {
                let attachment = ConnectionAttachment {
                    peer_id: entry.peer_id,
                    joined_at: entry.joined_at,
                };
                match attachment.encode() {
                    Ok(attachment) => Some(HibernatedConnection {
                        handle: entry.handle,
                        attachment,
                    }),
                    Err(e) => {
                        warn!(
                            target: "relay.session",
                            room = %room,
                            peer_id = %entry.peer_id,
                            error = %e,
                            "Failed to encode attachment, closing connection"
                        );
                        let _ = entry.handle.close(CLOSE_GOING_AWAY, "session lost");
                        None
                    }
                }
            })
            .collect()
    }

    #[must_use]
    pub fn room(&self) -> &str {
        &self.room
    }

    #[must_use]
    pub fn policy(&self) -> &RoomPolicy {
        &self.policy
    }

    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Current members in join order.
    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.registry.peer_ids()
    }

    /// Admit a connection.
    ///
    /// On success the new member receives `welcome` listing the members that
    /// were already present, and each of those receives `peer_joined`.
    ///
    /// # Errors
    ///
    /// `OriginRejected` or `RoomFull`, in that order of precedence. A
    /// refused admission leaves the session untouched.
    pub fn admit(
        &mut self,
        handle: ConnectionHandle,
        origin: Option<&str>,
    ) -> Result<PeerId, AdmissionError> {
        if !self.policy.origin_allowed(origin) {
            return Err(AdmissionError::OriginRejected);
        }
        if self.registry.len() >= self.policy.max_connections {
            return Err(AdmissionError::RoomFull);
        }

        let peer_id = self.fresh_peer_id();
        let existing_peers = self.registry.peer_ids();

        let entry = ConnectionEntry::new(
            peer_id,
            handle,
            RateLimiter::new(self.policy.max_messages_per_second),
            Utc::now(),
        );
        self.registry
            .register(entry)
            .map_err(|_| AdmissionError::AlreadyAdmitted)?;

        debug!(
            target: "relay.session",
            room = %self.room,
            peer_id = %peer_id,
            existing_peers = existing_peers.len(),
            "Connection admitted"
        );

        self.send_to(peer_id, &ServerMessage::welcome(peer_id, existing_peers));
        self.broadcast(Some(peer_id), &ServerMessage::PeerJoined { peer_id });

        Ok(peer_id)
    }

    /// Handle one inbound frame from a member.
    pub fn on_message(
        &mut self,
        connection_id: ConnectionId,
        frame: &WireFrame,
        now: Instant,
    ) -> InboundOutcome {
        let Some(entry) = self.registry.get_mut(connection_id) else {
            debug!(
                target: "relay.session",
                room = %self.room,
                connection_id = %connection_id,
                "Dropping frame from unknown connection"
            );
            return InboundOutcome::UnknownConnection;
        };

        let peer_id = entry.peer_id;
        if !entry.rate_limiter.allow(now) {
            self.send_to(peer_id, &ServerMessage::error(ErrorCode::RateLimited));
            return InboundOutcome::RateLimited;
        }

        let message = match codec::decode_client_message(frame) {
            Ok(message) => message,
            Err(e) => {
                debug!(
                    target: "relay.session",
                    room = %self.room,
                    peer_id = %peer_id,
                    frame_len = frame.len(),
                    error = %e,
                    "Rejecting invalid message"
                );
                self.send_to(peer_id, &ServerMessage::error(ErrorCode::InvalidMessage));
                return InboundOutcome::Invalid;
            }
        };

        match message {
            ClientMessage::Hello {
                protocol_version: Some(version),
            } if !is_supported_version(version) => {
                debug!(
                    target: "relay.session",
                    room = %self.room,
                    peer_id = %peer_id,
                    version = version,
                    "Unsupported protocol version"
                );
                self.send_to(peer_id, &ServerMessage::error(ErrorCode::BadProtocol));
                self.expel(connection_id);
                InboundOutcome::ProtocolMismatch
            }
            ClientMessage::Hello { .. } => InboundOutcome::Hello,
            ClientMessage::Ping { nonce } => {
                self.send_to(
                    peer_id,
                    &ServerMessage::Pong {
                        nonce,
                        server_time: Utc::now().timestamp_millis(),
                    },
                );
                InboundOutcome::Pong
            }
            ClientMessage::Opaque(data) => {
                let recipients =
                    self.broadcast(Some(peer_id), &ServerMessage::Relay { from: peer_id, data });
                InboundOutcome::Relayed { recipients }
            }
        }
    }

    /// Remove a member and tell the others. Repeated calls are no-ops.
    pub fn on_disconnect(&mut self, connection_id: ConnectionId) -> Option<PeerId> {
        let entry = self.registry.unregister(connection_id)?;
        let peer_id = entry.peer_id;

        debug!(
            target: "relay.session",
            room = %self.room,
            peer_id = %peer_id,
            remaining = self.registry.len(),
            "Connection left"
        );

        self.broadcast(None, &ServerMessage::PeerLeft { peer_id });
        Some(peer_id)
    }

    /// Remove a member that broke the protocol and close its socket.
    ///
    /// Frames it already queued are dropped as coming from an unknown
    /// connection. If the close cannot be queued, dropping the entry's
    /// handle still ends the writer once the queue drains.
    fn expel(&mut self, connection_id: ConnectionId) {
        let Some(entry) = self.registry.unregister(connection_id) else {
            return;
        };
        let peer_id = entry.peer_id;

        if let Err(e) = entry
            .handle
            .close(CLOSE_BAD_PROTOCOL, ErrorCode::BadProtocol.default_message())
        {
            warn!(
                target: "relay.session",
                room = %self.room,
                peer_id = %peer_id,
                error = %e,
                "Failed to queue protocol close"
            );
        }
        drop(entry);

        self.broadcast(None, &ServerMessage::PeerLeft { peer_id });
    }

    /// Send to every member except `exclude`.
    ///
    /// The message is encoded at most once per wire format. Per-recipient
    /// failures are logged and skipped. Returns the number of successful
    /// sends.
    pub fn broadcast(&self, exclude: Option<PeerId>, message: &ServerMessage) -> usize {
        let mut encoded: HashMap<WireFormat, WireFrame> = HashMap::with_capacity(2);
        let mut delivered = 0;

        for entry in self.registry.all() {
            if Some(entry.peer_id) == exclude {
                continue;
            }

            let format = entry.handle.format();
            let frame = if let Some(frame) = encoded.get(&format) {
                frame.clone()
            } else {
                match codec::encode(message, format) {
                    Ok(frame) => encoded.entry(format).or_insert(frame).clone(),
                    Err(e) => {
                        warn!(
                            target: "relay.session",
                            room = %self.room,
                            message_type = message.kind(),
                            error = %e,
                            "Failed to encode broadcast"
                        );
                        continue;
                    }
                }
            };

            match entry.handle.send_frame(frame) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(
                        target: "relay.session",
                        room = %self.room,
                        peer_id = %entry.peer_id,
                        message_type = message.kind(),
                        error = %e,
                        "Broadcast send failed"
                    );
                }
            }
        }

        delivered
    }

    /// Ask every member's writer to close.
    pub fn close_all(&self, code: u16, reason: &str) {
        for entry in self.registry.all() {
            let _ = entry.handle.close(code, reason);
        }
    }

    fn send_to(&self, peer_id: PeerId, message: &ServerMessage) {
        let Some(entry) = self.registry.get(peer_id) else {
            return;
        };
        if let Err(e) = entry.handle.send(message) {
            debug!(
                target: "relay.session",
                room = %self.room,
                peer_id = %peer_id,
                message_type = message.kind(),
                error = %e,
                "Send failed"
            );
        }
    }

    fn fresh_peer_id(&self) -> PeerId {
        loop {
            let candidate = PeerId::new();
            if !self.registry.contains_peer(candidate) {
                return candidate;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::connection::Outbound;
    use relay_protocol::codec::decode_server_message;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn policy(max_connections: usize, max_messages_per_second: usize) -> RoomPolicy {
        RoomPolicy {
            max_connections,
            max_messages_per_second,
            allowed_origins: HashSet::new(),
        }
    }

    fn connection(format: WireFormat) -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
        ConnectionHandle::new(ConnectionId::new(), format, 64)
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    fn messages(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ServerMessage> {
        drain(rx)
            .into_iter()
            .filter_map(|item| match item {
                Outbound::Frame(frame) => Some(decode_server_message(&frame).unwrap()),
                Outbound::Close { .. } => None,
            })
            .collect()
    }

    fn text(value: &Value) -> WireFrame {
        WireFrame::Text(value.to_string())
    }

    fn as_payload(value: &Value) -> rmpv::Value {
        serde_json::from_value(value.clone()).unwrap()
    }

    struct Member {
        peer_id: PeerId,
        connection_id: ConnectionId,
        rx: mpsc::Receiver<Outbound>,
    }

    fn join(session: &mut RoomSession) -> Member {
        let (handle, rx) = connection(WireFormat::Json);
        let connection_id = handle.connection_id();
        let peer_id = session.admit(handle, None).unwrap();
        Member {
            peer_id,
            connection_id,
            rx,
        }
    }

    #[test]
    fn test_room_name_validation() {
        assert!(is_valid_room_name("lobby"));
        assert!(is_valid_room_name("Room_1-a"));
        assert!(is_valid_room_name(&"a".repeat(64)));
        assert!(!is_valid_room_name(""));
        assert!(!is_valid_room_name(&"a".repeat(65)));
        assert!(!is_valid_room_name("has space"));
        assert!(!is_valid_room_name("../etc"));
    }

    #[test]
    fn test_origin_policy() {
        let mut policy = policy(4, 10);
        assert!(policy.origin_allowed(Some("https://anything.example")));

        policy
            .allowed_origins
            .insert("https://game.example".to_string());
        assert!(policy.origin_allowed(Some("https://game.example")));
        assert!(!policy.origin_allowed(Some("https://evil.example")));
        assert!(policy.origin_allowed(None));
        assert!(policy.origin_allowed(Some("")));
    }

    #[test]
    fn test_admit_sends_welcome_and_peer_joined() {
        let mut session = RoomSession::new("lobby", policy(8, 10));
        let mut a = join(&mut session);
        let mut b = join(&mut session);

        let welcome_a = messages(&mut a.rx);
        assert_eq!(
            welcome_a.first(),
            Some(&ServerMessage::welcome(a.peer_id, vec![]))
        );
        assert_eq!(
            welcome_a.get(1),
            Some(&ServerMessage::PeerJoined { peer_id: b.peer_id })
        );
        assert_eq!(welcome_a.len(), 2);

        let welcome_b = messages(&mut b.rx);
        assert_eq!(
            welcome_b,
            vec![ServerMessage::welcome(b.peer_id, vec![a.peer_id])]
        );

        let mut c = join(&mut session);
        let welcome_c = messages(&mut c.rx);
        let Some(ServerMessage::Welcome { peers, player_id, .. }) = welcome_c.first() else {
            unreachable!("first message must be welcome");
        };
        assert_eq!(*player_id, c.peer_id);
        assert_eq!(peers, &vec![a.peer_id, b.peer_id]);
        assert!(!peers.contains(&c.peer_id));

        // Exactly one peer_joined to each existing member
        assert_eq!(
            messages(&mut a.rx),
            vec![ServerMessage::PeerJoined { peer_id: c.peer_id }]
        );
        assert_eq!(
            messages(&mut b.rx),
            vec![ServerMessage::PeerJoined { peer_id: c.peer_id }]
        );
        assert!(session.registry().is_consistent());
    }

    #[test]
    fn test_admit_at_capacity_fails_without_mutation() {
        let mut session = RoomSession::new("small", policy(2, 10));
        let mut a = join(&mut session);
        let mut b = join(&mut session);
        drain(&mut a.rx);
        drain(&mut b.rx);

        let (handle, mut rx) = connection(WireFormat::Json);
        assert_eq!(session.admit(handle, None), Err(AdmissionError::RoomFull));

        assert_eq!(session.len(), 2);
        assert_eq!(session.peer_ids(), vec![a.peer_id, b.peer_id]);
        assert!(drain(&mut rx).is_empty());
        assert!(drain(&mut a.rx).is_empty());
        assert!(drain(&mut b.rx).is_empty());
        assert!(session.registry().is_consistent());
    }

    #[test]
    fn test_admit_rejects_unlisted_origin() {
        let mut policy = policy(2, 10);
        policy
            .allowed_origins
            .insert("https://game.example".to_string());
        let mut session = RoomSession::new("lobby", policy);

        let (handle, mut rx) = connection(WireFormat::Json);
        assert_eq!(
            session.admit(handle, Some("https://evil.example")),
            Err(AdmissionError::OriginRejected)
        );
        assert!(session.is_empty());
        assert!(drain(&mut rx).is_empty());

        let (handle, _rx) = connection(WireFormat::Json);
        assert!(session.admit(handle, Some("https://game.example")).is_ok());
    }

    #[test]
    fn test_origin_rejection_precedes_capacity() {
        let mut policy = policy(0, 10);
        policy
            .allowed_origins
            .insert("https://game.example".to_string());
        let mut session = RoomSession::new("lobby", policy);

        let (handle, _rx) = connection(WireFormat::Json);
        assert_eq!(
            session.admit(handle, Some("https://evil.example")),
            Err(AdmissionError::OriginRejected)
        );
    }

    #[test]
    fn test_opaque_message_relayed_to_others_only() {
        let mut session = RoomSession::new("lobby", policy(8, 10));
        let mut a = join(&mut session);
        let mut b = join(&mut session);
        let mut c = join(&mut session);
        for member in [&mut a, &mut b, &mut c] {
            drain(&mut member.rx);
        }

        let payload = json!({"type": "move", "x": 1});
        let outcome = session.on_message(a.connection_id, &text(&payload), Instant::now());
        assert_eq!(outcome, InboundOutcome::Relayed { recipients: 2 });

        let expected = ServerMessage::Relay {
            from: a.peer_id,
            data: as_payload(&payload),
        };
        assert_eq!(messages(&mut b.rx), vec![expected.clone()]);
        assert_eq!(messages(&mut c.rx), vec![expected]);
        assert!(drain(&mut a.rx).is_empty());
    }

    #[test]
    fn test_ping_answers_sender_only() {
        let mut session = RoomSession::new("lobby", policy(8, 10));
        let mut a = join(&mut session);
        let mut b = join(&mut session);
        drain(&mut a.rx);
        drain(&mut b.rx);

        let outcome = session.on_message(
            a.connection_id,
            &text(&json!({"type": "ping", "nonce": "abc"})),
            Instant::now(),
        );
        assert_eq!(outcome, InboundOutcome::Pong);

        let replies = messages(&mut a.rx);
        assert_eq!(replies.len(), 1);
        assert!(matches!(
            replies.first(),
            Some(ServerMessage::Pong { nonce, server_time }) if nonce == "abc" && *server_time > 0
        ));
        assert!(drain(&mut b.rx).is_empty());
    }

    #[test]
    fn test_mismatched_hello_errors_then_closes() {
        let mut session = RoomSession::new("lobby", policy(8, 10));
        let mut a = join(&mut session);
        let mut b = join(&mut session);
        drain(&mut a.rx);
        drain(&mut b.rx);

        let outcome = session.on_message(
            a.connection_id,
            &text(&json!({"type": "hello", "protocolVersion": 99})),
            Instant::now(),
        );
        assert_eq!(outcome, InboundOutcome::ProtocolMismatch);

        let sent = drain(&mut a.rx);
        assert_eq!(sent.len(), 2);
        let Some(Outbound::Frame(frame)) = sent.first() else {
            unreachable!("expected error frame first");
        };
        assert_eq!(
            decode_server_message(frame).unwrap(),
            ServerMessage::error(ErrorCode::BadProtocol)
        );
        assert!(matches!(
            sent.get(1),
            Some(Outbound::Close { code, .. }) if *code == CLOSE_BAD_PROTOCOL
        ));

        // Removed at once; the others only learn that it left
        assert_eq!(
            messages(&mut b.rx),
            vec![ServerMessage::PeerLeft { peer_id: a.peer_id }]
        );
        assert_eq!(session.registry().lookup(a.connection_id), None);
        assert_eq!(session.peer_ids(), vec![b.peer_id]);
        assert!(session.registry().is_consistent());
    }

    #[test]
    fn test_frames_after_bad_protocol_are_not_relayed() {
        let mut session = RoomSession::new("lobby", policy(8, 10));
        let mut a = join(&mut session);
        let mut b = join(&mut session);
        drain(&mut a.rx);
        drain(&mut b.rx);

        let now = Instant::now();
        session.on_message(
            a.connection_id,
            &text(&json!({"type": "hello", "protocolVersion": 2})),
            now,
        );
        drain(&mut b.rx);

        // Already queued behind the hello
        assert_eq!(
            session.on_message(a.connection_id, &text(&json!({"type": "move"})), now),
            InboundOutcome::UnknownConnection
        );
        assert!(drain(&mut b.rx).is_empty());

        // The writer's own disconnect report is a no-op
        assert_eq!(session.on_disconnect(a.connection_id), None);
        assert!(drain(&mut b.rx).is_empty());
    }

    #[test]
    fn test_bad_protocol_with_full_queue_still_expels() {
        let mut session = RoomSession::new("lobby", policy(8, 10));
        let (handle, mut a_rx) = ConnectionHandle::new(ConnectionId::new(), WireFormat::Json, 1);
        let a_connection = handle.connection_id();
        session.admit(handle, None).unwrap();
        let mut b = join(&mut session);
        drain(&mut b.rx);

        // Queue holds only the welcome; error and close are both refused
        let outcome = session.on_message(
            a_connection,
            &text(&json!({"type": "hello", "protocolVersion": 3})),
            Instant::now(),
        );
        assert_eq!(outcome, InboundOutcome::ProtocolMismatch);
        assert_eq!(session.registry().lookup(a_connection), None);
        assert_eq!(messages(&mut b.rx).len(), 1);

        // With every handle dropped the writer sees the queue end
        assert!(matches!(a_rx.try_recv(), Ok(Outbound::Frame(_))));
        assert!(matches!(
            a_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_matching_or_versionless_hello_is_silent() {
        let mut session = RoomSession::new("lobby", policy(8, 10));
        let mut a = join(&mut session);
        let mut b = join(&mut session);
        drain(&mut a.rx);
        drain(&mut b.rx);

        for hello in [
            json!({"type": "hello", "protocolVersion": 1}),
            json!({"type": "hello"}),
            json!({"type": "hello", "protocolVersion": "2"}),
        ] {
            let outcome = session.on_message(a.connection_id, &text(&hello), Instant::now());
            assert_eq!(outcome, InboundOutcome::Hello);
        }

        assert!(drain(&mut a.rx).is_empty());
        assert!(drain(&mut b.rx).is_empty());
    }

    #[test]
    fn test_invalid_message_keeps_connection() {
        let mut session = RoomSession::new("lobby", policy(8, 10));
        let mut a = join(&mut session);
        let mut b = join(&mut session);
        drain(&mut a.rx);
        drain(&mut b.rx);

        for frame in [
            WireFrame::Text("not json".to_string()),
            WireFrame::Text("42".to_string()),
            WireFrame::Binary(Bytes::from_static(&[0xc1])),
        ] {
            let outcome = session.on_message(a.connection_id, &frame, Instant::now());
            assert_eq!(outcome, InboundOutcome::Invalid);
        }

        let replies = messages(&mut a.rx);
        assert_eq!(
            replies,
            vec![ServerMessage::error(ErrorCode::InvalidMessage); 3]
        );
        assert_eq!(session.registry().lookup(a.connection_id), Some(a.peer_id));
        assert!(drain(&mut b.rx).is_empty());
    }

    #[test]
    fn test_rate_limited_messages_are_not_relayed() {
        let mut session = RoomSession::new("lobby", policy(8, 2));
        let mut a = join(&mut session);
        let mut b = join(&mut session);
        drain(&mut a.rx);
        drain(&mut b.rx);

        let now = Instant::now();
        let frame = text(&json!([1, 2, 3]));
        assert!(matches!(
            session.on_message(a.connection_id, &frame, now),
            InboundOutcome::Relayed { .. }
        ));
        assert!(matches!(
            session.on_message(a.connection_id, &frame, now + Duration::from_millis(10)),
            InboundOutcome::Relayed { .. }
        ));
        assert_eq!(
            session.on_message(a.connection_id, &frame, now + Duration::from_millis(20)),
            InboundOutcome::RateLimited
        );

        assert_eq!(
            messages(&mut a.rx),
            vec![ServerMessage::error(ErrorCode::RateLimited)]
        );
        assert_eq!(messages(&mut b.rx).len(), 2);

        // Window slides past the first accepted message
        assert!(matches!(
            session.on_message(a.connection_id, &frame, now + Duration::from_millis(1001)),
            InboundOutcome::Relayed { .. }
        ));
    }

    #[test]
    fn test_unknown_connection_is_dropped() {
        let mut session = RoomSession::new("lobby", policy(8, 10));
        let mut a = join(&mut session);
        drain(&mut a.rx);

        let outcome = session.on_message(
            ConnectionId::new(),
            &text(&json!({"type": "move"})),
            Instant::now(),
        );
        assert_eq!(outcome, InboundOutcome::UnknownConnection);
        assert!(drain(&mut a.rx).is_empty());
    }

    #[test]
    fn test_double_disconnect_sends_one_peer_left() {
        let mut session = RoomSession::new("lobby", policy(8, 10));
        let mut a = join(&mut session);
        let b = join(&mut session);
        drain(&mut a.rx);

        assert_eq!(session.on_disconnect(b.connection_id), Some(b.peer_id));
        assert_eq!(session.on_disconnect(b.connection_id), None);

        assert_eq!(
            messages(&mut a.rx),
            vec![ServerMessage::PeerLeft { peer_id: b.peer_id }]
        );
        assert!(session.registry().is_consistent());
    }

    #[test]
    fn test_departed_member_is_not_broadcast_target() {
        let mut session = RoomSession::new("lobby", policy(8, 10));
        let mut a = join(&mut session);
        let mut b = join(&mut session);
        let c = join(&mut session);

        session.on_disconnect(b.connection_id);
        drain(&mut a.rx);
        drain(&mut b.rx);

        session.on_message(
            c.connection_id,
            &text(&json!({"type": "move"})),
            Instant::now(),
        );
        session.broadcast(None, &ServerMessage::PeerLeft { peer_id: c.peer_id });

        assert!(drain(&mut b.rx).is_empty());
        assert_eq!(messages(&mut a.rx).len(), 2);
    }

    #[test]
    fn test_broadcast_swallows_failed_sends() {
        let mut session = RoomSession::new("lobby", policy(8, 10));
        let mut a = join(&mut session);
        let b = join(&mut session);
        let c = join(&mut session);
        drain(&mut a.rx);
        drop(b.rx);

        let delivered = session.broadcast(
            Some(c.peer_id),
            &ServerMessage::PeerJoined { peer_id: c.peer_id },
        );
        assert_eq!(delivered, 1);
        assert_eq!(messages(&mut a.rx).len(), 1);
    }

    #[test]
    fn test_broadcast_encodes_per_connection_format() {
        let mut session = RoomSession::new("lobby", policy(8, 10));
        let (json_handle, mut json_rx) = connection(WireFormat::Json);
        let (packed_handle, mut packed_rx) = connection(WireFormat::MsgPack);
        session.admit(json_handle, None).unwrap();
        session.admit(packed_handle, None).unwrap();
        drain(&mut json_rx);
        drain(&mut packed_rx);

        let msg = ServerMessage::PeerLeft {
            peer_id: PeerId::new(),
        };
        assert_eq!(session.broadcast(None, &msg), 2);

        assert!(matches!(
            drain(&mut json_rx).first(),
            Some(Outbound::Frame(WireFrame::Text(_)))
        ));
        assert!(matches!(
            drain(&mut packed_rx).first(),
            Some(Outbound::Frame(WireFrame::Binary(_)))
        ));
    }

    #[test]
    fn test_msgpack_only_payload_is_relayed_unchanged() {
        let mut session = RoomSession::new("lobby", policy(8, 10));
        let (packed_handle, mut packed_rx) = connection(WireFormat::MsgPack);
        let (json_handle, mut json_rx) = connection(WireFormat::Json);
        let sender = join(&mut session);
        session.admit(packed_handle, None).unwrap();
        session.admit(json_handle, None).unwrap();
        drain(&mut packed_rx);
        drain(&mut json_rx);

        let data = rmpv::Value::Map(vec![
            (rmpv::Value::from("type"), rmpv::Value::from("state")),
            (rmpv::Value::from("blob"), rmpv::Value::Binary(vec![1, 2, 3])),
            (rmpv::Value::from(7), rmpv::Value::F32(0.25)),
        ]);
        let mut bytes = Vec::new();
        rmpv::encode::write_value(&mut bytes, &data).unwrap();

        let outcome = session.on_message(
            sender.connection_id,
            &WireFrame::Binary(Bytes::from(bytes)),
            Instant::now(),
        );
        assert_eq!(outcome, InboundOutcome::Relayed { recipients: 2 });

        let Some(Outbound::Frame(WireFrame::Binary(envelope))) = drain(&mut packed_rx).pop() else {
            unreachable!("expected a binary relay");
        };
        let envelope = rmpv::decode::read_value(&mut &envelope[..]).unwrap();
        let relayed = envelope
            .as_map()
            .unwrap()
            .iter()
            .find(|(key, _)| key.as_str() == Some("data"))
            .map(|(_, value)| value.clone());
        assert_eq!(relayed, Some(data));

        // JSON members get the nearest rendering
        let Some(Outbound::Frame(WireFrame::Text(text))) = drain(&mut json_rx).pop() else {
            unreachable!("expected a text relay");
        };
        let rendered: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            rendered["data"],
            json!({"type": "state", "blob": [1, 2, 3], "7": 0.25})
        );
    }

    #[test]
    fn test_hibernate_and_restore_preserves_membership() {
        let mut session = RoomSession::new("lobby", policy(8, 1));
        let mut a = join(&mut session);
        let mut b = join(&mut session);
        drain(&mut a.rx);
        drain(&mut b.rx);

        // Exhaust a's limiter before hibernating
        let now = Instant::now();
        let frame = text(&json!({"type": "move"}));
        session.on_message(a.connection_id, &frame, now);
        assert_eq!(
            session.on_message(a.connection_id, &frame, now),
            InboundOutcome::RateLimited
        );
        drain(&mut a.rx);
        drain(&mut b.rx);

        let peers = session.peer_ids();
        let hibernated = session.hibernate();
        assert_eq!(hibernated.len(), 2);

        let mut restored = RoomSession::restore("lobby", policy(8, 1), hibernated);
        assert_eq!(restored.peer_ids(), peers);
        assert_eq!(restored.registry().lookup(a.connection_id), Some(a.peer_id));
        assert_eq!(restored.registry().lookup(b.connection_id), Some(b.peer_id));
        assert!(restored.registry().is_consistent());
        assert!(restored
            .registry()
            .all()
            .all(|entry| entry.rate_limiter.in_window() == 0));

        // Fresh limiter admits immediately, at the same instant
        assert_eq!(
            restored.on_message(a.connection_id, &frame, now),
            InboundOutcome::Relayed { recipients: 1 }
        );
        assert_eq!(messages(&mut b.rx).len(), 1);
    }

    #[test]
    fn test_restore_closes_unreadable_attachment() {
        let (handle, mut rx) = connection(WireFormat::Json);
        let restored = RoomSession::restore(
            "lobby",
            policy(8, 10),
            vec![HibernatedConnection {
                handle,
                attachment: Bytes::from_static(&[0xc1]),
            }],
        );

        assert!(restored.is_empty());
        assert!(matches!(
            drain(&mut rx).first(),
            Some(Outbound::Close { code, .. }) if *code == CLOSE_GOING_AWAY
        ));
    }

    #[test]
    fn test_attachment_is_self_describing() {
        let attachment = ConnectionAttachment {
            peer_id: PeerId::new(),
            joined_at: Utc::now(),
        };
        let bytes = attachment.encode().unwrap();

        let value: Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(value["peerId"], json!(attachment.peer_id.to_string()));
        assert_eq!(ConnectionAttachment::decode(&bytes).unwrap(), attachment);
    }

    #[test]
    fn test_registry_consistent_after_mixed_sequence() {
        let mut session = RoomSession::new("lobby", policy(4, 10));
        let mut members = Vec::new();

        for round in 0..20 {
            if round % 3 == 2 && !members.is_empty() {
                let member: Member = members.remove(0);
                session.on_disconnect(member.connection_id);
            } else {
                let (handle, rx) = connection(WireFormat::MsgPack);
                let connection_id = handle.connection_id();
                match session.admit(handle, None) {
                    Ok(peer_id) => members.push(Member {
                        peer_id,
                        connection_id,
                        rx,
                    }),
                    Err(e) => assert_eq!(e, AdmissionError::RoomFull),
                }
            }
            assert!(session.registry().is_consistent());
            assert_eq!(session.len(), members.len());
            assert!(session.len() <= 4);
        }

        let expected: Vec<PeerId> = members.iter().map(|m| m.peer_id).collect();
        assert_eq!(session.peer_ids(), expected);
    }
}
