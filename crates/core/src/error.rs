// Error types for the relay and its collaborators

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur while relaying change notifications
///
/// Every variant is scoped to a single connection. Nothing here is fatal
/// to the process.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    /// Write or read failure on the connection transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// Event could not be serialized or the notification was malformed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Change source refused the subscription
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Peer went away; expected end of a connection
    #[error("Client disconnected")]
    ClientDisconnected,
}

impl RelayError {
    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        RelayError::Transport(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        RelayError::Serialization(msg.into())
    }

    /// Create an upstream-unavailable error
    pub fn upstream(msg: impl Into<String>) -> Self {
        RelayError::UpstreamUnavailable(msg.into())
    }

    /// Whether the stream may continue after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RelayError::Serialization(_))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}

/// Failure to decode an event payload into a typed entity
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Event type carries no payload
    #[error("event of type '{0}' has no payload")]
    MissingPayload(&'static str),

    /// Payload exists but does not have the expected shape
    #[error("payload shape mismatch: {0}")]
    Shape(#[from] serde_json::Error),
}
