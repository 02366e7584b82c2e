//! Codec for encoding and decoding relay messages.
//!
//! MessagePack is the primary format and is always written with named
//! fields so the output is self-describing. JSON is accepted everywhere as a
//! fallback and can be chosen as a connection's outbound format.
//!
//! Client payloads decode into `rmpv::Value`, which keeps every MessagePack
//! type. JSON recipients get the nearest JSON rendering: `bin` becomes an
//! array of bytes and integer keys become strings.

use crate::message::{ClientMessage, ServerMessage};
use bytes::Bytes;
use rmpv::Value;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Binary frame was neither valid MessagePack nor JSON
    #[error("Malformed binary payload: {0}")]
    MalformedBinary(String),

    /// Text frame was not valid JSON
    #[error("Malformed JSON payload: {0}")]
    MalformedJson(String),

    /// Decoded value is a scalar or null
    #[error("Payload is not an object or array")]
    NotAnObject,

    /// Serialization failed
    #[error("Encoding failed: {0}")]
    Encode(String),

    /// Unknown `format` query value
    #[error("Unknown wire format: {0}")]
    UnknownFormat(String),
}

/// Outbound encoding chosen by a connection at upgrade time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WireFormat {
    /// MessagePack in binary frames
    #[default]
    MsgPack,
    /// JSON in text frames
    Json,
}

impl WireFormat {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            WireFormat::MsgPack => "msgpack",
            WireFormat::Json => "json",
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WireFormat {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "msgpack" | "messagepack" | "binary" => Ok(WireFormat::MsgPack),
            "json" | "text" => Ok(WireFormat::Json),
            _ => Err(CodecError::UnknownFormat(s.to_string())),
        }
    }
}

/// A single WebSocket data frame, independent of the socket library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Binary(Bytes),
    Text(String),
}

impl WireFrame {
    /// Payload size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            WireFrame::Binary(bytes) => bytes.len(),
            WireFrame::Text(text) => text.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode a message in the given format.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized
pub fn encode<T: Serialize + ?Sized>(message: &T, format: WireFormat) -> Result<WireFrame, CodecError> {
    match format {
        WireFormat::MsgPack => rmp_serde::to_vec_named(message)
            .map(|bytes| WireFrame::Binary(Bytes::from(bytes)))
            .map_err(|e| CodecError::Encode(e.to_string())),
        WireFormat::Json => serde_json::to_string(message)
            .map(WireFrame::Text)
            .map_err(|e| CodecError::Encode(e.to_string())),
    }
}

/// Decode a frame into a generic value.
///
/// Text frames are JSON. Binary frames are MessagePack, falling back to
/// JSON bytes. A leading `{` or `[` is a positive fixint in MessagePack, so
/// such payloads are tried as JSON first.
///
/// # Errors
///
/// Returns an error if no format accepts the payload
pub fn decode_value(frame: &WireFrame) -> Result<Value, CodecError> {
    match frame {
        WireFrame::Text(text) => {
            serde_json::from_str(text).map_err(|e| CodecError::MalformedJson(e.to_string()))
        }
        WireFrame::Binary(bytes) => {
            let looks_like_json = bytes
                .iter()
                .find(|b| !b.is_ascii_whitespace())
                .is_some_and(|b| *b == b'{' || *b == b'[');

            if looks_like_json {
                if let Ok(value) = serde_json::from_slice(bytes) {
                    return Ok(value);
                }
            }

            let mut reader: &[u8] = bytes;
            match rmpv::decode::read_value(&mut reader) {
                Ok(value) => Ok(value),
                Err(msgpack_err) => serde_json::from_slice(bytes)
                    .map_err(|_| CodecError::MalformedBinary(msgpack_err.to_string())),
            }
        }
    }
}

/// Decode and classify a client frame.
///
/// # Errors
///
/// Returns an error if the payload is malformed or not an object/array
pub fn decode_client_message(frame: &WireFrame) -> Result<ClientMessage, CodecError> {
    ClientMessage::from_value(decode_value(frame)?)
}

/// Decode a server message, for clients of the relay.
///
/// # Errors
///
/// Returns an error if the payload is malformed or not a known message
pub fn decode_server_message(frame: &WireFrame) -> Result<ServerMessage, CodecError> {
    match frame {
        WireFrame::Text(text) => {
            serde_json::from_str(text).map_err(|e| CodecError::MalformedJson(e.to_string()))
        }
        WireFrame::Binary(bytes) => {
            rmp_serde::from_slice(bytes).map_err(|e| CodecError::MalformedBinary(e.to_string()))
        }
    }
}
