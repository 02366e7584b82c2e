//! Relay service error types.
//!
//! All errors map to HTTP status codes via the `IntoResponse` impl; only
//! admission-time errors are ever returned to a client this way; everything
//! after the upgrade is reported in-band. Client-facing messages are generic.

use crate::session::AdmissionError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use relay_protocol::CodecError;
use serde::Serialize;
use thiserror::Error;

/// Relay service error type.
///
/// Maps to HTTP status codes:
/// - OriginRejected: 403 Forbidden
/// - RoomFull, DirectoryFull, Draining, RoomClosed: 503 Service Unavailable
/// - InvalidRoomName, InvalidFormat: 400 Bad Request
/// - RoomNotFound: 404 Not Found
/// - AlreadyAdmitted: 409 Conflict
/// - everything else: 500 Internal Server Error
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Origin not allowed")]
    OriginRejected,

    #[error("Room is full")]
    RoomFull,

    #[error("Connection already admitted")]
    AlreadyAdmitted,

    #[error("Invalid room name: {0}")]
    InvalidRoomName(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Room limit reached")]
    DirectoryFull,

    #[error("Relay is shutting down")]
    Draining,

    #[error("Room closed: {0}")]
    RoomClosed(String),

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send queue full")]
    SendQueueFull,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::OriginRejected => StatusCode::FORBIDDEN,
            RelayError::RoomFull
            | RelayError::DirectoryFull
            | RelayError::Draining
            | RelayError::RoomClosed(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::InvalidRoomName(_) | RelayError::InvalidFormat(_) => {
                StatusCode::BAD_REQUEST
            }
            RelayError::RoomNotFound(_) => StatusCode::NOT_FOUND,
            RelayError::AlreadyAdmitted => StatusCode::CONFLICT,
            RelayError::ConnectionClosed
            | RelayError::SendQueueFull
            | RelayError::Codec(_)
            | RelayError::Config(_)
            | RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code for the JSON body.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            RelayError::OriginRejected => "ORIGIN_REJECTED",
            RelayError::RoomFull => "ROOM_FULL",
            RelayError::AlreadyAdmitted => "CONFLICT",
            RelayError::InvalidRoomName(_) => "INVALID_ROOM",
            RelayError::InvalidFormat(_) => "INVALID_FORMAT",
            RelayError::DirectoryFull | RelayError::Draining | RelayError::RoomClosed(_) => {
                "SERVICE_UNAVAILABLE"
            }
            RelayError::RoomNotFound(_) => "NOT_FOUND",
            RelayError::ConnectionClosed
            | RelayError::SendQueueFull
            | RelayError::Codec(_)
            | RelayError::Config(_)
            | RelayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to show a client.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            RelayError::OriginRejected => "Origin not allowed".to_string(),
            RelayError::RoomFull => "Room is full".to_string(),
            RelayError::AlreadyAdmitted => "Connection already admitted".to_string(),
            RelayError::InvalidRoomName(_) => {
                "Room names are 1-64 characters of letters, digits, '_' or '-'".to_string()
            }
            RelayError::InvalidFormat(format) => format!("Unknown format: {format}"),
            RelayError::DirectoryFull | RelayError::Draining | RelayError::RoomClosed(_) => {
                "Service temporarily unavailable".to_string()
            }
            RelayError::RoomNotFound(room) => format!("Room not found: {room}"),
            RelayError::ConnectionClosed
            | RelayError::SendQueueFull
            | RelayError::Codec(_)
            | RelayError::Config(_)
            | RelayError::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}

impl From<AdmissionError> for RelayError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::OriginRejected => RelayError::OriginRejected,
            AdmissionError::RoomFull => RelayError::RoomFull,
            AdmissionError::AlreadyAdmitted => RelayError::AlreadyAdmitted,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            // Log actual error server-side, return generic message to client
            tracing::error!(target: "relay.errors", error = %self, "Request failed");
        } else if status == StatusCode::SERVICE_UNAVAILABLE {
            tracing::warn!(target: "relay.errors", error = %self, "Service unavailable");
        }

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message: self.client_message(),
            },
        };

        (status, Json(error_response)).into_response()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;

    async fn read_body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_admission_errors_convert() {
        assert!(matches!(
            RelayError::from(AdmissionError::OriginRejected),
            RelayError::OriginRejected
        ));
        assert!(matches!(
            RelayError::from(AdmissionError::RoomFull),
            RelayError::RoomFull
        ));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(RelayError::OriginRejected.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            RelayError::RoomFull.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            RelayError::InvalidRoomName("a b".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RelayError::RoomNotFound("x".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RelayError::Codec(CodecError::NotAnObject).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_origin_rejected_response() {
        let response = RelayError::OriginRejected.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = read_body_json(response.into_body()).await;
        assert_eq!(body["error"]["code"], "ORIGIN_REJECTED");
        assert_eq!(body["error"]["message"], "Origin not allowed");
    }

    #[tokio::test]
    async fn test_room_full_response() {
        let response = RelayError::RoomFull.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = read_body_json(response.into_body()).await;
        assert_eq!(body["error"]["code"], "ROOM_FULL");
    }

    #[tokio::test]
    async fn test_internal_error_hides_details() {
        let response = RelayError::Internal("mailbox exploded".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = read_body_json(response.into_body()).await;
        assert_eq!(body["error"]["code"], "INTERNAL_ERROR");
        assert_eq!(body["error"]["message"], "An internal error occurred");
    }
}
