//! Error types for the session layer.
//!
//! `SessionError` is what the public surface returns. Only two failures are
//! meant to reach application code in normal operation:
//!
//! - `SubscribeAckTimeout` from an ack-verified subscribe
//! - `ConnectionInfo` from an explicit `connect()`
//!
//! Everything the reconnection engine runs into in the background (connect
//! timeouts, endpoint lookups that fail, refused connections) is logged and
//! retried; it never surfaces as an error to a caller.
//!
//! `ConnectionInfoError` is kept separate so callers of the connection-info
//! collaborator can tell a malformed endpoint apart from a failed request.

use std::time::Duration;

use thiserror::Error;

/// Failures of the "fetch connection info" collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionInfoError {
    /// The authenticated request itself failed (transport error, non-2xx).
    #[error("Connection info request failed: {0}")]
    Request(String),

    /// The lookup did not complete in time.
    #[error("Connection info request timed out after {0:?}")]
    Timeout(Duration),

    /// The response did not carry the expected field.
    #[error("Connection info response is missing field '{0}'")]
    MissingField(&'static str),

    /// The endpoint URL does not look like `wss://<host>/mqtt...`.
    #[error("Malformed websocket endpoint URL: {0}")]
    MalformedUrl(String),
}

/// The unified error type for session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session endpoint could not be resolved.
    #[error("Connection info error: {0}")]
    ConnectionInfo(#[from] ConnectionInfoError),

    /// No SUBACK arrived for the topic within the allotted time.
    #[error("Subscription ACK timeout for '{topic}' after {timeout:?}")]
    SubscribeAckTimeout { topic: String, timeout: Duration },

    /// The transport refused to send the SUBSCRIBE at all.
    #[error("Subscription to '{topic}' could not be sent: {reason}")]
    SubscribeRejected { topic: String, reason: String },

    /// The broker did not confirm the connection in time.
    #[error("No connect acknowledgment within {0:?}")]
    ConnectTimeout(Duration),

    /// An operation that needs a live link was called without one.
    #[error("Not connected")]
    NotConnected,

    /// The MQTT client could not be built (TLS material, options).
    #[error("Client setup error: {0}")]
    ClientSetup(String),

    /// The MQTT client failed to queue a request.
    #[error("Client transfer error: {0}")]
    ClientTransfer(#[from] rumqttc::ClientError),

    /// Configuration failed validation.
    #[error("Configuration error: {0}")]
    ConfigError(#[from] validator::ValidationErrors),

    /// File I/O, typically loading TLS material.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The session was shut down while the operation was waiting.
    #[error("Session is shutting down")]
    Cancelled,
}

impl SessionError {
    /// Short, stable label used to suppress repeated log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::ConnectionInfo(ConnectionInfoError::Timeout(_)) => "connection_info_timeout",
            SessionError::ConnectionInfo(_) => "connection_info",
            SessionError::SubscribeAckTimeout { .. } => "subscribe_ack_timeout",
            SessionError::SubscribeRejected { .. } => "subscribe_rejected",
            SessionError::ConnectTimeout(_) => "connect_timeout",
            SessionError::NotConnected => "not_connected",
            SessionError::ClientSetup(_) => "client_setup",
            SessionError::ClientTransfer(_) => "client_transfer",
            SessionError::ConfigError(_) => "config",
            SessionError::Io(_) => "io",
            SessionError::Cancelled => "cancelled",
        }
    }
}
