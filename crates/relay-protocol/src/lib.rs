//! Wire protocol for the room relay.
//!
//! Server messages are self-describing maps carried as MessagePack binary
//! frames by default, with JSON text frames as the compatibility format.
//! Client payloads are decoded into a generic value and classified into the
//! few control messages the server understands; everything else is relayed
//! untouched.

#![warn(clippy::pedantic)]

pub mod codec;
pub mod message;

pub use codec::{CodecError, WireFormat, WireFrame};
pub use message::{ClientMessage, ErrorCode, ServerMessage};

/// Protocol version announced in `welcome` and checked against `hello`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Close code sent after a `BAD_PROTOCOL` error.
pub const CLOSE_BAD_PROTOCOL: u16 = 4002;

/// Close code sent when the relay or the room is shutting down.
pub const CLOSE_GOING_AWAY: u16 = 1001;
