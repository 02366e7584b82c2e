//! Message types exchanged between clients and the relay.

use crate::codec::CodecError;
use crate::PROTOCOL_VERSION;
use common::types::PeerId;
use rmpv::Value;
use serde::{Deserialize, Serialize};

/// Error codes carried by `error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Sender exceeded its per-second message budget
    RateLimited,
    /// Room is at capacity
    RoomFull,
    /// Payload could not be decoded or is not an object/array
    InvalidMessage,
    /// Client announced an unsupported protocol version
    BadProtocol,
}

impl ErrorCode {
    /// Wire representation, also used as a metrics label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::RoomFull => "ROOM_FULL",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::BadProtocol => "BAD_PROTOCOL",
        }
    }

    /// Human readable text sent alongside the code.
    #[must_use]
    pub const fn default_message(self) -> &'static str {
        match self {
            ErrorCode::RateLimited => "Too many messages; slow down",
            ErrorCode::RoomFull => "Room is full",
            ErrorCode::InvalidMessage => "Message must be an object or array",
            ErrorCode::BadProtocol => "Unsupported protocol version",
        }
    }
}

/// Messages sent from the relay to a client.
///
/// Serialized as a map with a `type` discriminator and camelCase fields:
/// `{"type":"peer_joined","peerId":"..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// First message on every admitted connection.
    Welcome {
        protocol_version: u32,
        player_id: PeerId,
        /// Members present before this connection joined, in join order.
        peers: Vec<PeerId>,
    },
    PeerJoined {
        peer_id: PeerId,
    },
    PeerLeft {
        peer_id: PeerId,
    },
    /// Opaque client payload forwarded to the rest of the room.
    ///
    /// Kept as a MessagePack value so `bin`, `ext`, `f32` and non-string
    /// map keys reach MessagePack recipients unchanged.
    Relay {
        from: PeerId,
        data: Value,
    },
    Pong {
        nonce: String,
        /// Milliseconds since the Unix epoch.
        server_time: i64,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl ServerMessage {
    /// `welcome` for a newly admitted peer.
    #[must_use]
    pub fn welcome(player_id: PeerId, peers: Vec<PeerId>) -> Self {
        ServerMessage::Welcome {
            protocol_version: PROTOCOL_VERSION,
            player_id,
            peers,
        }
    }

    /// `error` with the code's default message.
    #[must_use]
    pub fn error(code: ErrorCode) -> Self {
        ServerMessage::Error {
            code,
            message: code.default_message().to_string(),
        }
    }

    /// Value of the `type` field, used for logging and metrics labels.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Welcome { .. } => "welcome",
            ServerMessage::PeerJoined { .. } => "peer_joined",
            ServerMessage::PeerLeft { .. } => "peer_left",
            ServerMessage::Relay { .. } => "relay",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::Error { .. } => "error",
        }
    }
}

/// A decoded client payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `{"type":"hello"}`; the version is `None` when absent or non-numeric.
    Hello { protocol_version: Option<f64> },
    /// `{"type":"ping","nonce":"..."}` with a string nonce.
    Ping { nonce: String },
    /// Anything else, relayed unchanged.
    Opaque(Value),
}

enum Kind {
    Hello(Option<f64>),
    Ping(String),
    Opaque,
}

impl ClientMessage {
    /// Classify a decoded payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::NotAnObject`] for scalars and `null`; only
    /// objects and arrays are accepted.
    pub fn from_value(value: Value) -> Result<Self, CodecError> {
        let kind = match &value {
            Value::Map(entries) => match field(entries, "type").and_then(Value::as_str) {
                Some("hello") => Kind::Hello(field(entries, "protocolVersion").and_then(as_number)),
                Some("ping") => match field(entries, "nonce").and_then(Value::as_str) {
                    Some(nonce) => Kind::Ping(nonce.to_string()),
                    None => Kind::Opaque,
                },
                _ => Kind::Opaque,
            },
            Value::Array(_) => Kind::Opaque,
            _ => return Err(CodecError::NotAnObject),
        };

        Ok(match kind {
            Kind::Hello(protocol_version) => ClientMessage::Hello { protocol_version },
            Kind::Ping(nonce) => ClientMessage::Ping { nonce },
            Kind::Opaque => ClientMessage::Opaque(value),
        })
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Hello { .. } => "hello",
            ClientMessage::Ping { .. } => "ping",
            ClientMessage::Opaque(_) => "relay",
        }
    }
}

/// Value under a string key; other keys are never control fields.
fn field<'a>(entries: &'a [(Value, Value)], name: &str) -> Option<&'a Value> {
    entries
        .iter()
        .find(|(key, _)| key.as_str() == Some(name))
        .map(|(_, value)| value)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(n) => n.as_f64(),
        Value::F32(n) => Some(f64::from(*n)),
        Value::F64(n) => Some(*n),
        _ => None,
    }
}

/// Whether a version announced in `hello` matches this server.
#[must_use]
pub fn is_supported_version(version: f64) -> bool {
    (version - f64::from(PROTOCOL_VERSION)).abs() < f64::EPSILON
}
