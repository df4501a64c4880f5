//! Client and server options.

use std::collections::HashSet;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use wsrpc_wire::PeerIdentity;

/// Default deadline for a single socket write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default largest inbound message, in bytes.
pub const DEFAULT_READ_LIMIT: usize = 100_000_000;
/// Default window for a pong to arrive before the connection is dead.
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(20);
/// Default bound on the whole authentication exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default depth of the per-connection outbound queue.
pub const DEFAULT_WRITE_QUEUE: usize = 256;

/// Keepalive timing. Pings go out every 90% of `pong_wait` so a healthy
/// peer's pong always lands inside the read window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub pong_wait: Duration,
}

impl KeepaliveConfig {
    pub fn new(pong_wait: Duration) -> Self {
        Self { pong_wait }
    }

    pub fn ping_period(&self) -> Duration {
        self.pong_wait * 9 / 10
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            pong_wait: DEFAULT_PONG_WAIT,
        }
    }
}

/// A client's own key plus the server key it pins.
#[derive(Clone)]
pub struct ClientCredentials {
    pub signing_key: SigningKey,
    pub server_public_key: PeerIdentity,
}

impl ClientCredentials {
    pub fn new(signing_key: SigningKey, server_public_key: PeerIdentity) -> Self {
        Self {
            signing_key,
            server_public_key,
        }
    }
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("public_key", &PeerIdentity::from(&self.signing_key))
            .field("server_public_key", &self.server_public_key)
            .finish_non_exhaustive()
    }
}

/// A server's own key plus the client keys it admits.
#[derive(Clone)]
pub struct ServerCredentials {
    pub signing_key: SigningKey,
    pub allowed_clients: HashSet<PeerIdentity>,
}

impl ServerCredentials {
    pub fn new(
        signing_key: SigningKey,
        allowed_clients: impl IntoIterator<Item = PeerIdentity>,
    ) -> Self {
        Self {
            signing_key,
            allowed_clients: allowed_clients.into_iter().collect(),
        }
    }
}

impl std::fmt::Debug for ServerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCredentials")
            .field("public_key", &PeerIdentity::from(&self.signing_key))
            .field("allowed_clients", &self.allowed_clients.len())
            .finish_non_exhaustive()
    }
}

/// Options for [`Client::dial`](crate::Client::dial).
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub write_timeout: Duration,
    pub read_limit: usize,
    pub keepalive: KeepaliveConfig,
    pub handshake_timeout: Duration,
    pub write_queue: usize,
    pub credentials: ClientCredentials,
    /// Parent span for everything the client logs.
    pub span: tracing::Span,
}

impl ClientOptions {
    pub fn new(credentials: ClientCredentials) -> Self {
        Self {
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            read_limit: DEFAULT_READ_LIMIT,
            keepalive: KeepaliveConfig::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            write_queue: DEFAULT_WRITE_QUEUE,
            credentials,
            span: tracing::info_span!("wsrpc.client"),
        }
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_read_limit(mut self, limit: usize) -> Self {
        self.read_limit = limit;
        self
    }

    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub(crate) fn transport(&self) -> TransportConfig {
        TransportConfig {
            write_timeout: self.write_timeout,
            keepalive: self.keepalive,
            write_queue: self.write_queue,
        }
    }

    pub(crate) fn websocket(&self) -> WebSocketConfig {
        websocket_config(self.read_limit)
    }
}

/// Options for [`Server::new`](crate::Server::new).
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub write_timeout: Duration,
    pub read_limit: usize,
    pub keepalive: KeepaliveConfig,
    pub handshake_timeout: Duration,
    pub write_queue: usize,
    pub credentials: ServerCredentials,
    /// Parent span for everything the server logs.
    pub span: tracing::Span,
}

impl ServerOptions {
    pub fn new(credentials: ServerCredentials) -> Self {
        Self {
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            read_limit: DEFAULT_READ_LIMIT,
            keepalive: KeepaliveConfig::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            write_queue: DEFAULT_WRITE_QUEUE,
            credentials,
            span: tracing::info_span!("wsrpc.server"),
        }
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_read_limit(mut self, limit: usize) -> Self {
        self.read_limit = limit;
        self
    }

    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub(crate) fn transport(&self) -> TransportConfig {
        TransportConfig {
            write_timeout: self.write_timeout,
            keepalive: self.keepalive,
            write_queue: self.write_queue,
        }
    }

    pub(crate) fn websocket(&self) -> WebSocketConfig {
        websocket_config(self.read_limit)
    }
}

/// The slice of the options a running connection needs.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TransportConfig {
    pub write_timeout: Duration,
    pub keepalive: KeepaliveConfig,
    pub write_queue: usize,
}

fn websocket_config(read_limit: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(read_limit);
    config.max_frame_size = Some(read_limit);
    config
}
