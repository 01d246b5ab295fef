//! Error handling for the real-time messaging client.

use std::time::Duration;

use thiserror::Error;

/// The main result type used throughout the client.
pub type RtmResult<T> = Result<T, RtmError>;

/// Error type for all client operations.
///
/// Transport failures (`WebSocket`, `Decode`) are absorbed by the session
/// pumps and turned into reconnects. Only `Reply`, `RequestTimeout`,
/// `ConnectionClosed` and `CapacityExceeded` reach callers of the send API.
#[derive(Error, Debug)]
pub enum RtmError {
    /// HTTP errors raised by the handshake call.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// WebSocket read/write errors
    #[error("WebSocket error: {message}")]
    WebSocket { message: String },

    /// A frame could not be decoded into an event or reply.
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The handshake was rejected or the session did not open with `hello`.
    #[error("Handshake failed: {message}")]
    Handshake { message: String },

    /// The server speaks a protocol revision this client was not built against.
    #[error("Version mismatch on {marker}: expected {expected}, got {actual}")]
    VersionMismatch {
        marker: &'static str,
        expected: String,
        actual: String,
    },

    /// The peer rejected a request.
    #[error("Request rejected: code={code}, message={message}")]
    Reply { code: i64, message: String },

    /// No correlated reply arrived before the deadline. The outcome is unknown.
    #[error("Request {request_id} timed out after {duration:?}")]
    RequestTimeout {
        duration: Duration,
        request_id: String,
    },

    /// The session has been shut down.
    #[error("Connection closed{}", reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    ConnectionClosed { reason: Option<String> },

    /// Too many requests are waiting for replies.
    #[error("Capacity exceeded: {message}")]
    CapacityExceeded { message: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl From<tokio_tungstenite::tungstenite::Error> for RtmError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket {
            message: e.to_string(),
        }
    }
}

impl RtmError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a WebSocket error.
    pub fn websocket(message: impl Into<String>) -> Self {
        Self::WebSocket {
            message: message.into(),
        }
    }

    /// Create a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create a handshake error.
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Create a reply error from a protocol error object.
    pub fn reply(code: i64, message: impl Into<String>) -> Self {
        Self::Reply {
            code,
            message: message.into(),
        }
    }

    /// Create a request timeout error.
    pub fn request_timeout(duration: Duration, request_id: impl Into<String>) -> Self {
        Self::RequestTimeout {
            duration,
            request_id: request_id.into(),
        }
    }

    /// Create a connection closed error.
    pub fn connection_closed(reason: Option<String>) -> Self {
        Self::ConnectionClosed { reason }
    }

    /// Create a capacity exceeded error.
    pub fn capacity_exceeded(message: impl Into<String>) -> Self {
        Self::CapacityExceeded {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether retrying the handshake cannot succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Handshake { .. } | Self::VersionMismatch { .. })
    }

    /// Whether this is a timeout (as opposed to a rejection).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. })
    }
}
