//! Accepting side: listener loop, allow-list, and the live connection table.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::accept_async_with_config;
use tracing::{debug, error, field, info, warn, Instrument, Span};
use wsrpc_wire::PeerIdentity;

use crate::auth;
use crate::config::ServerOptions;
use crate::context::CallContext;
use crate::dispatch::{Dispatcher, ServiceDesc, ServiceRegistrar};
use crate::error::RpcError;
use crate::invoker::{self, Invoker};
use crate::transport::{wait_shutdown, ConnState, Connection, StateCell};

struct ServerInner {
    options: ServerOptions,
    public_key: PeerIdentity,
    allowed: RwLock<HashSet<PeerIdentity>>,
    dispatcher: Arc<Dispatcher>,
    /// At most one live connection per client key.
    connections: DashMap<PeerIdentity, Connection>,
    shutdown: watch::Sender<bool>,
}

/// An RPC server. Clones share the same listener state and connections.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("public_key", &self.inner.public_key)
            .field("connections", &self.inner.connections.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        let public_key = PeerIdentity::from(&options.credentials.signing_key);
        let allowed = options.credentials.allowed_clients.clone();
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ServerInner {
                options,
                public_key,
                allowed: RwLock::new(allowed),
                dispatcher: Arc::new(Dispatcher::new()),
                connections: DashMap::new(),
                shutdown,
            }),
        }
    }

    /// This server's identity, as clients pin it.
    pub fn public_key(&self) -> PeerIdentity {
        self.inner.public_key
    }

    /// Accept connections until [`Server::stop`] is called.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RpcError> {
        let span = self.inner.options.span.clone();
        let local = listener.local_addr()?;
        info!(parent: &span, "Listening on {}", local);

        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = wait_shutdown(&mut shutdown) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(parent: &span, "Accepted connection from {}", addr);
                        let inner = Arc::clone(&self.inner);
                        let conn_span = tracing::info_span!(
                            parent: &span,
                            "conn",
                            remote = %addr,
                            peer = field::Empty
                        );
                        tokio::spawn(
                            async move {
                                if let Err(e) = inner.handle_inbound(stream, addr).await {
                                    debug!("Inbound connection from {} ended: {}", addr, e);
                                }
                            }
                            .instrument(conn_span),
                        );
                    }
                    Err(e) => {
                        error!(parent: &span, "Accept error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }
        info!(parent: &span, "Stopped accepting on {}", local);
        Ok(())
    }

    /// Stop accepting and close every connection. In-flight calls on both
    /// sides fail with `ConnectionClosed`; later invokes fail immediately.
    pub fn stop(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        let live: Vec<Connection> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        info!(parent: &self.inner.options.span, connections = live.len(), "Server stopping");
        for conn in live {
            conn.close();
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Identities of currently connected clients.
    pub fn connected_peers(&self) -> Vec<PeerIdentity> {
        self.inner
            .connections
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn connection(&self, peer: &PeerIdentity) -> Option<Connection> {
        self.inner
            .connections
            .get(peer)
            .map(|entry| entry.value().clone())
    }

    /// Replace the allow-list. Connected clients no longer on it are closed.
    pub fn update_allowed_clients(&self, clients: impl IntoIterator<Item = PeerIdentity>) {
        let allowed: HashSet<PeerIdentity> = clients.into_iter().collect();
        let revoked: Vec<Connection> = self
            .inner
            .connections
            .iter()
            .filter(|entry| !allowed.contains(entry.key()))
            .map(|entry| entry.value().clone())
            .collect();
        *self.inner.allowed.write().unwrap_or_else(|e| e.into_inner()) = allowed;
        for conn in revoked {
            info!(parent: &self.inner.options.span, peer = %conn.peer(), "Client key revoked");
            conn.close();
        }
    }

    /// Call a service registered on the client named by `ctx.peer()`.
    pub async fn invoke_raw(
        &self,
        ctx: &CallContext,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError> {
        let conn = self.route(ctx)?;
        conn.invoke_raw(ctx, method, payload).await
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

    fn route(&self, ctx: &CallContext) -> Result<Connection, RpcError> {
        if self.is_stopped() {
            return Err(RpcError::ConnectionClosed);
        }
        let peer = ctx
            .peer()
            .ok_or_else(|| RpcError::NoConnection("call context names no peer".to_string()))?;
        self.connection(&peer)
            .filter(|conn| !conn.is_closed())
            .ok_or_else(|| RpcError::NoConnection(peer.to_string()))
    }
}

impl ServerInner {
    fn is_allowed(&self, key: &PeerIdentity) -> bool {
        self.allowed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Upgrade, authenticate, then hold the connection in the table until it closes.
    async fn handle_inbound(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<(), RpcError> {
        let _ = stream.set_nodelay(true);
        let state = StateCell::new();
        let upgrade = tokio::time::timeout(
            self.options.handshake_timeout,
            accept_async_with_config(stream, Some(self.options.websocket())),
        )
        .await
        .map_err(|_| RpcError::Connection(format!("upgrade from {addr}: timed out")))?;
        let mut ws =
            upgrade.map_err(|e| RpcError::Connection(format!("upgrade from {addr}: {e}")))?;
        state.advance(ConnState::Authenticating);

        let handshake = tokio::time::timeout(
            self.options.handshake_timeout,
            auth::server_handshake(&mut ws, &self.options.credentials.signing_key, |key| {
                self.is_allowed(key)
            }),
        )
        .await
        .unwrap_or_else(|_| {
            Err(RpcError::Authentication(format!(
                "handshake timed out after {:?}",
                self.options.handshake_timeout
            )))
        });
        let peer = match handshake {
            Ok(peer) => peer,
            Err(e) => {
                warn!(error = %e, "Handshake from {} failed", addr);
                state.advance(ConnState::Closing);
                let _ = tokio::time::timeout(self.options.write_timeout, ws.close(None)).await;
                state.advance(ConnState::Closed);
                return Err(e);
            }
        };
        Span::current().record("peer", field::display(peer));

        if self.is_stopped() {
            let _ = tokio::time::timeout(self.options.write_timeout, ws.close(None)).await;
            return Err(RpcError::ConnectionClosed);
        }

        let conn = Connection::spawn(
            ws,
            peer,
            state,
            Arc::clone(&self.dispatcher),
            self.options.transport(),
            Span::current(),
        );
        if let Some(previous) = self.connections.insert(peer, conn.clone()) {
            info!("Client {} reconnected; closing previous connection", peer);
            previous.close();
        }
        // stop() or an allow-list update may have swept the table before this insert.
        if self.is_stopped() || !self.is_allowed(&peer) {
            conn.close();
        }
        info!("Client {} connected from {}", peer, addr);

        let reason = conn.closed().await;
        self.connections
            .remove_if(&peer, |_, current| current.ptr_eq(&conn));
        info!("Client {} disconnected: {}", peer, reason);
        Ok(())
    }
}

impl ServiceRegistrar for Server {
    fn register_service<S>(&self, desc: &ServiceDesc<S>, service: Arc<S>) -> Result<(), RpcError>
    where
        S: ?Sized + Send + Sync + 'static,
    {
        self.inner.dispatcher.register(desc, service)
    }
}

#[async_trait]
impl Invoker for Server {
    async fn invoke_raw(
        &self,
        ctx: &CallContext,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError> {
        Server::invoke_raw(self, ctx, method, payload).await
    }
}
