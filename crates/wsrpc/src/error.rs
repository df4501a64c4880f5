//! Error types for the RPC layer.

use thiserror::Error;
use tokio_tungstenite::tungstenite;
use wsrpc_wire::WireError;

/// Errors surfaced to callers, handlers and connection observers.
///
/// Cloneable so a single fatal error can be recorded as a connection's
/// [`CloseReason`] and also handed to whoever asks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// Dial failure, socket I/O failure, or unexpected peer disconnect.
    #[error("Connection error: {0}")]
    Connection(String),
    /// Handshake failed: bad signature, key not allowed, wrong server key.
    #[error("Authentication failed: {0}")]
    Authentication(String),
    /// Write deadline exceeded or keepalive pong missed.
    #[error("Timeout: {0}")]
    Timeout(String),
    /// Malformed frame, oversized message, or text message.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// The call's own deadline elapsed before a response arrived.
    #[error("Deadline exceeded")]
    DeadlineExceeded,
    /// The caller cancelled the call.
    #[error("Call cancelled")]
    Cancelled,
    /// The remote handler returned an error (or was not found, or panicked).
    #[error("Handler error: {0}")]
    Handler(String),
    /// The connection closed while the call was pending, or before it started.
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Registration error: {0}")]
    Registration(String),
    /// Local payload encode/decode failure.
    #[error("Codec error: {0}")]
    Codec(String),
    /// No live connection to the peer named in the call context.
    #[error("No connection: {0}")]
    NoConnection(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RpcError {
    /// Whether this error belongs to a single call rather than the connection.
    #[cfg(test)]
    pub(crate) fn is_call_local(&self) -> bool {
        matches!(
            self,
            Self::DeadlineExceeded | Self::Cancelled | Self::Handler(_) | Self::Codec(_)
        )
    }
}

impl From<WireError> for RpcError {
    fn from(err: WireError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<tungstenite::Error> for RpcError {
    fn from(err: tungstenite::Error) -> Self {
        use tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::ConnectionClosed,
            WsError::Capacity(e) => Self::Protocol(e.to_string()),
            WsError::Protocol(e) => Self::Protocol(e.to_string()),
            WsError::Io(e) => Self::Connection(e.to_string()),
            other => Self::Connection(other.to_string()),
        }
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        Self::Connection(err.to_string())
    }
}

/// Why a connection ended. Recorded once, by whoever closed it first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this side (`close()`, server stop, or replaced by a newer connection).
    Local,
    /// The peer closed the WebSocket.
    Peer,
    /// A fatal error tore the connection down.
    Error(RpcError),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => f.write_str("closed locally"),
            Self::Peer => f.write_str("closed by peer"),
            Self::Error(e) => write!(f, "{e}"),
        }
    }
}

pub type RpcResult<T> = Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_error_is_protocol() {
        let err: RpcError = WireError::UnknownKind(9).into();
        assert!(matches!(err, RpcError::Protocol(msg) if msg.contains("0x09")));
    }

    #[test]
    fn test_tungstenite_mapping() {
        let closed: RpcError = tungstenite::Error::ConnectionClosed.into();
        assert_eq!(closed, RpcError::ConnectionClosed);

        let io: RpcError = tungstenite::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ))
        .into();
        assert!(matches!(io, RpcError::Connection(_)));

        let big: RpcError = tungstenite::Error::Capacity(
            tungstenite::error::CapacityError::MessageTooLong {
                size: 10,
                max_size: 5,
            },
        )
        .into();
        assert!(matches!(big, RpcError::Protocol(_)));
    }

    #[test]
    fn test_call_local_errors() {
        assert!(RpcError::DeadlineExceeded.is_call_local());
        assert!(RpcError::Handler("boom".into()).is_call_local());
        assert!(!RpcError::ConnectionClosed.is_call_local());
        assert!(!RpcError::Timeout("pong".into()).is_call_local());
    }

    #[test]
    fn test_close_reason_display() {
        assert_eq!(CloseReason::Peer.to_string(), "closed by peer");
        let reason = CloseReason::Error(RpcError::Protocol("bad frame".into()));
        assert_eq!(reason.to_string(), "Protocol error: bad frame");
    }
}
