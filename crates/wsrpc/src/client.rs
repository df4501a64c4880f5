//! Dialing side of a connection.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_tungstenite::connect_async_with_config;
use tracing::{field, info, warn, Instrument};
use url::Url;
use wsrpc_wire::PeerIdentity;

use crate::auth;
use crate::config::ClientOptions;
use crate::context::CallContext;
use crate::dispatch::{Dispatcher, ServiceDesc, ServiceRegistrar};
use crate::error::{CloseReason, RpcError};
use crate::invoker::{self, Invoker};
use crate::transport::{ConnState, Connection, StateCell};

struct ClientInner {
    conn: Connection,
    dispatcher: Arc<Dispatcher>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.conn.close();
    }
}

/// An authenticated connection to one server.
///
/// Clones share the connection; it closes when the last clone is dropped
/// or on [`Client::close`]. There is no reconnect: dial again.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("conn", &self.inner.conn)
            .finish()
    }
}

impl Client {
    /// Connect to `addr` (`host:port` or a `ws://`/`wss://` URL), authenticate,
    /// and start the connection's pumps.
    pub async fn dial(addr: &str, options: ClientOptions) -> Result<Self, RpcError> {
        let url = ws_url(addr)?;
        let span = tracing::info_span!(
            parent: &options.span,
            "conn",
            url = %url,
            peer = field::Empty
        );
        Self::connect(url, options, span.clone()).instrument(span).await
    }

    async fn connect(url: Url, options: ClientOptions, span: tracing::Span) -> Result<Self, RpcError> {
        let state = StateCell::new();
        let upgrade = tokio::time::timeout(
            options.handshake_timeout,
            connect_async_with_config(url.as_str(), Some(options.websocket()), true),
        )
        .await
        .map_err(|_| RpcError::Connection(format!("dial {url}: timed out")))?;
        let (mut ws, _response) =
            upgrade.map_err(|e| RpcError::Connection(format!("dial {url}: {e}")))?;
        state.advance(ConnState::Authenticating);

        let creds = &options.credentials;
        let handshake = tokio::time::timeout(
            options.handshake_timeout,
            auth::client_handshake(&mut ws, &creds.signing_key, &creds.server_public_key),
        )
        .await
        .unwrap_or_else(|_| {
            Err(RpcError::Authentication(format!(
                "handshake timed out after {:?}",
                options.handshake_timeout
            )))
        });
        let peer = match handshake {
            Ok(peer) => peer,
            Err(e) => {
                warn!(error = %e, "Handshake with {} failed", url);
                state.advance(ConnState::Closing);
                let _ = tokio::time::timeout(options.write_timeout, ws.close(None)).await;
                state.advance(ConnState::Closed);
                return Err(e);
            }
        };
        span.record("peer", field::display(peer));

        let dispatcher = Arc::new(Dispatcher::new());
        let conn = Connection::spawn(
            ws,
            peer,
            state,
            Arc::clone(&dispatcher),
            options.transport(),
            span,
        );
        info!("Connected to {}", url);
        Ok(Self {
            inner: Arc::new(ClientInner { conn, dispatcher }),
        })
    }

    /// The server's verified identity.
    pub fn peer(&self) -> PeerIdentity {
        self.inner.conn.peer()
    }

    pub fn state(&self) -> ConnState {
        self.inner.conn.state()
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.conn
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.conn.pending_calls()
    }

    pub fn close(&self) {
        self.inner.conn.close();
    }

    /// Resolves once the connection is fully closed.
    pub async fn closed(&self) -> CloseReason {
        self.inner.conn.closed().await
    }

    pub async fn invoke_raw(
        &self,
        ctx: &CallContext,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError> {
        self.inner.conn.invoke_raw(ctx, method, payload).await
    }

    pub async fn invoke<Req, Resp>(
        &self,
        ctx: &CallContext,
        method: &str,
        request: &Req,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + Sync + ?Sized,
        Resp: DeserializeOwned,
    {
        invoker::invoke(self, ctx, method, request).await
    }
}

/// Services registered on a client answer calls the server makes back.
impl ServiceRegistrar for Client {
    fn register_service<S>(&self, desc: &ServiceDesc<S>, service: Arc<S>) -> Result<(), RpcError>
    where
        S: ?Sized + Send + Sync + 'static,
    {
        self.inner.dispatcher.register(desc, service)
    }
}

#[async_trait]
impl Invoker for Client {
    async fn invoke_raw(
        &self,
        ctx: &CallContext,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError> {
        self.inner.conn.invoke_raw(ctx, method, payload).await
    }
}

fn ws_url(addr: &str) -> Result<Url, RpcError> {
    let raw = if addr.contains("://") {
        addr.to_string()
    } else {
        format!("ws://{addr}/")
    };
    let url = Url::parse(&raw)
        .map_err(|e| RpcError::Config(format!("invalid address {addr:?}: {e}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(RpcError::Config(format!(
            "unsupported scheme {other:?} in {addr:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_port_becomes_ws_url() {
        let url = ws_url("127.0.0.1:9000").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:9000/");
    }

    #[test]
    fn test_full_url_kept() {
        let url = ws_url("wss://rpc.example.com/v1").unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/v1");
    }

    #[test]
    fn test_bad_addresses() {
        assert!(matches!(ws_url("http://x:1"), Err(RpcError::Config(_))));
        assert!(matches!(ws_url("ws://"), Err(RpcError::Config(_))));
    }

    #[tokio::test]
    async fn test_dial_refused_is_connection_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let key = wsrpc_wire::generate_signing_key();
        let server = PeerIdentity::from(&wsrpc_wire::generate_signing_key());
        let opts = ClientOptions::new(crate::config::ClientCredentials::new(key, server));
        let err = Client::dial(&addr.to_string(), opts).await.unwrap_err();
        assert!(matches!(err, RpcError::Connection(_)));
    }
}
