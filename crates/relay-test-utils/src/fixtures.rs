//! Pre-configured test data for session and actor tests.
//!
//! Provides:
//! - `TestConnection`: a `ConnectionHandle` plus the receiving end of its queue
//! - Frame builders for JSON and MessagePack client payloads
//! - `payload` for comparing relayed data against JSON literals
//! - Room policies with small limits

use common::types::ConnectionId;
use relay_protocol::codec::{decode_server_message, WireFormat, WireFrame};
use relay_protocol::ServerMessage;
use relay_service::actors::{ConnectionHandle, Outbound};
use relay_service::session::RoomPolicy;
use serde_json::Value;
use std::collections::HashSet;
use tokio::sync::mpsc;

/// Outbound queue capacity used by test connections.
pub const TEST_CONNECTION_BUFFER: usize = 64;

/// Room policy with the given limits and no origin allow-list.
#[must_use]
pub fn test_policy(max_connections: usize, max_messages_per_second: usize) -> RoomPolicy {
    RoomPolicy {
        max_connections,
        max_messages_per_second,
        allowed_origins: HashSet::new(),
    }
}

/// Room policy that only admits the listed origins.
#[must_use]
pub fn policy_with_origins(origins: &[&str]) -> RoomPolicy {
    RoomPolicy {
        allowed_origins: origins.iter().map(|origin| (*origin).to_string()).collect(),
        ..test_policy(8, 30)
    }
}

/// JSON text frame, as a browser client would send.
#[must_use]
pub fn json_frame(value: &Value) -> WireFrame {
    WireFrame::Text(value.to_string())
}

/// MessagePack binary frame with named fields.
#[must_use]
pub fn msgpack_frame(value: &Value) -> WireFrame {
    let bytes = rmp_serde::to_vec_named(value).expect("value should encode as msgpack");
    WireFrame::Binary(bytes.into())
}

/// Raw MessagePack frame for values JSON cannot express (`bin`, `ext`,
/// non-string keys).
#[must_use]
pub fn raw_msgpack_frame(value: &rmpv::Value) -> WireFrame {
    let mut bytes = Vec::new();
    rmpv::encode::write_value(&mut bytes, value).expect("writing to a Vec cannot fail");
    WireFrame::Binary(bytes.into())
}

/// The relayed form of a JSON value, as carried in `ServerMessage::Relay`.
#[must_use]
pub fn payload(value: &Value) -> rmpv::Value {
    serde_json::from_value(value.clone()).expect("JSON converts to a MessagePack value")
}

/// A connection handle with its outbound queue, standing in for a socket.
pub struct TestConnection {
    pub handle: ConnectionHandle,
    pub outbound: mpsc::Receiver<Outbound>,
}

impl TestConnection {
    /// Create a connection that receives MessagePack frames.
    #[must_use]
    pub fn new() -> Self {
        Self::with_format(WireFormat::MsgPack)
    }

    #[must_use]
    pub fn with_format(format: WireFormat) -> Self {
        let (handle, outbound) =
            ConnectionHandle::new(ConnectionId::new(), format, TEST_CONNECTION_BUFFER);
        Self { handle, outbound }
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.handle.connection_id()
    }

    /// Everything queued so far, without waiting.
    pub fn drain(&mut self) -> Vec<Outbound> {
        let mut queued = Vec::new();
        while let Ok(item) = self.outbound.try_recv() {
            queued.push(item);
        }
        queued
    }

    /// Decoded server messages queued so far; close requests are skipped.
    pub fn messages(&mut self) -> Vec<ServerMessage> {
        self.drain()
            .into_iter()
            .filter_map(|item| match item {
                Outbound::Frame(frame) => {
                    Some(decode_server_message(&frame).expect("server frame should decode"))
                }
                Outbound::Close { .. } => None,
            })
            .collect()
    }

    /// Wait for the next decoded server message.
    ///
    /// # Panics
    ///
    /// Panics if the queue closes or a close request arrives first.
    pub async fn next_message(&mut self) -> ServerMessage {
        match self.outbound.recv().await {
            Some(Outbound::Frame(frame)) => {
                decode_server_message(&frame).expect("server frame should decode")
            }
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    /// Close code of the first close request queued so far, if any.
    pub fn close_code(&mut self) -> Option<u16> {
        self.drain().into_iter().find_map(|item| match item {
            Outbound::Close { code, .. } => Some(code),
            Outbound::Frame(_) => None,
        })
    }
}

impl Default for TestConnection {
    fn default() -> Self {
        Self::new()
    }
}
