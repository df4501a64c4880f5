//! One authenticated WebSocket connection and its read/write pumps.
//!
//! After the handshake the socket is split: the read pump owns the stream
//! half, the write pump owns the sink half and is the only task that writes.
//! Everything else talks to the write pump through a bounded queue. Pongs
//! bypass that queue: the read pump raises a flag the write pump checks
//! before anything else, and keepalive pings go ahead of queued data. A
//! supervisor task joins both pumps and marks the connection `Closed`.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn, Instrument, Span};
use wsrpc_wire::{Frame, PeerIdentity, MAX_METHOD_LEN};

use crate::calls::{CallTable, PendingGuard};
use crate::config::TransportConfig;
use crate::context::CallContext;
use crate::dispatch::Dispatcher;
use crate::error::{CloseReason, RpcError};
use crate::invoker::Invoker;

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnState {
    Connecting,
    Authenticating,
    Established,
    Closing,
    Closed,
}

/// Forward-only state holder shared by the dialer/acceptor and the connection.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<ConnState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnState::Connecting);
        Self { tx }
    }

    /// Move to `next` if it is later than the current state.
    pub fn advance(&self, next: ConnState) -> bool {
        let moved = self.tx.send_if_modified(|state| {
            if next > *state {
                *state = next;
                true
            } else {
                false
            }
        });
        if moved {
            debug!(state = ?next, "Connection state");
        }
        moved
    }

    pub fn get(&self) -> ConnState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnState> {
        self.tx.subscribe()
    }
}

struct Inner {
    peer: PeerIdentity,
    state: StateCell,
    shutdown: watch::Sender<bool>,
    close_reason: OnceLock<CloseReason>,
    outbound: mpsc::Sender<Frame>,
    /// Set by the read pump when a ping arrives. Pending pongs coalesce.
    pong_due: Notify,
    calls: CallTable,
    dispatcher: Arc<Dispatcher>,
    span: Span,
}

/// Shared handle to an established connection. Clones are cheap.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

impl Connection {
    /// Take over an authenticated socket: spawn the pumps and the supervisor.
    pub(crate) fn spawn<S>(
        ws: WebSocketStream<S>,
        peer: PeerIdentity,
        state: StateCell,
        dispatcher: Arc<Dispatcher>,
        config: TransportConfig,
        span: Span,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.write_queue.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        let conn = Self {
            inner: Arc::new(Inner {
                peer,
                state,
                shutdown: shutdown_tx,
                close_reason: OnceLock::new(),
                outbound: outbound_tx,
                pong_due: Notify::new(),
                calls: CallTable::new(),
                dispatcher,
                span: span.clone(),
            }),
        };
        span.in_scope(|| conn.inner.state.advance(ConnState::Established));

        let (sink, stream) = ws.split();
        let reader = tokio::spawn(
            read_pump(
                conn.clone(),
                stream,
                conn.inner.shutdown.subscribe(),
                config.keepalive.pong_wait,
            )
            .instrument(span.clone()),
        );
        let writer = tokio::spawn(
            write_pump(
                conn.clone(),
                sink,
                outbound_rx,
                conn.inner.shutdown.subscribe(),
                config.write_timeout,
                config.keepalive.ping_period(),
            )
            .instrument(span.clone()),
        );

        let supervised = conn.clone();
        tokio::spawn(
            async move {
                let (r, w) = tokio::join!(reader, writer);
                if r.is_err() || w.is_err() {
                    warn!("Connection pump task failed");
                    supervised.close_with(CloseReason::Error(RpcError::Connection(
                        "pump task failed".into(),
                    )));
                }
                supervised.inner.state.advance(ConnState::Closed);
            }
            .instrument(span),
        );

        conn
    }

    pub fn peer(&self) -> PeerIdentity {
        self.inner.peer
    }

    pub fn state(&self) -> ConnState {
        self.inner.state.get()
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnState> {
        self.inner.state.subscribe()
    }

    /// Why the connection closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason.get().cloned()
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.calls.pending_count()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.close_reason.get().is_some()
    }

    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Close from this side. Idempotent.
    pub fn close(&self) {
        self.close_with(CloseReason::Local);
    }

    /// Wait until both pumps have exited and report why the connection ended.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state == ConnState::Closed).await;
        self.close_reason().unwrap_or(CloseReason::Local)
    }

    /// First caller wins; later calls are no-ops.
    pub(crate) fn close_with(&self, reason: CloseReason) {
        if self.inner.close_reason.set(reason.clone()).is_err() {
            return;
        }
        let _entered = self.inner.span.enter();
        match &reason {
            CloseReason::Error(e) => warn!(peer = %self.inner.peer, error = %e, "Connection closing"),
            other => info!(peer = %self.inner.peer, reason = %other, "Connection closing"),
        }
        self.inner.state.advance(ConnState::Closing);
        let failed = self.inner.calls.fail_all();
        if failed > 0 {
            debug!(failed, "Failed pending calls on close");
        }
        self.inner.shutdown.send_replace(true);
    }

    /// Send a request and wait for its response, deadline, or cancellation.
    pub async fn invoke_raw(
        &self,
        ctx: &CallContext,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError> {
        if method.len() > MAX_METHOD_LEN {
            return Err(RpcError::Protocol(format!(
                "method name is {} bytes, max {MAX_METHOD_LEN}",
                method.len()
            )));
        }
        if ctx.is_cancelled() {
            return Err(RpcError::Cancelled);
        }
        if ctx.deadline().is_some_and(|d| d <= Instant::now()) {
            return Err(RpcError::DeadlineExceeded);
        }

        let (id, rx) = self.inner.calls.register(method)?;
        let mut guard = PendingGuard::new(&self.inner.calls, id);
        let request = Frame::Request {
            id,
            method: method.to_string(),
            payload,
        };

        tokio::select! {
            biased;
            sent = async {
                self.enqueue(request).await?;
                Ok::<_, RpcError>(rx.await)
            } => match sent {
                Ok(delivered) => {
                    guard.disarm();
                    delivered.unwrap_or(Err(RpcError::ConnectionClosed))
                }
                Err(e) => Err(e),
            },
            _ = ctx.expired() => {
                debug!(parent: &self.inner.span, id, method, "Call deadline exceeded");
                Err(RpcError::DeadlineExceeded)
            }
            _ = ctx.cancelled() => {
                debug!(parent: &self.inner.span, id, method, "Call cancelled");
                Err(RpcError::Cancelled)
            }
        }
    }

    /// Queue a frame for the write pump.
    pub(crate) async fn enqueue(&self, frame: Frame) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }
        self.inner
            .outbound
            .send(frame)
            .await
            .map_err(|_| RpcError::ConnectionClosed)
    }

    fn route(&self, frame: Frame) {
        match frame {
            Frame::Response { id, payload } => {
                self.inner.calls.complete(id, Ok(payload));
            }
            Frame::Error { id, message } => {
                self.inner.calls.complete(id, Err(RpcError::Handler(message)));
            }
            Frame::Request {
                id,
                method,
                payload,
            } => {
                let ctx = CallContext::new().with_peer(self.inner.peer);
                self.inner.dispatcher.spawn_request(
                    ctx,
                    id,
                    method,
                    payload,
                    self.inner.outbound.clone(),
                );
            }
            Frame::Ping => self.inner.pong_due.notify_one(),
            Frame::Pong => {}
        }
    }
}

#[async_trait]
impl Invoker for Connection {
    async fn invoke_raw(
        &self,
        ctx: &CallContext,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError> {
        Connection::invoke_raw(self, ctx, method, payload).await
    }
}

pub(crate) async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn read_pump<S>(
    conn: Connection,
    mut stream: SplitStream<WebSocketStream<S>>,
    mut shutdown: watch::Receiver<bool>,
    pong_wait: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut deadline = Instant::now() + pong_wait;
    loop {
        let next = tokio::select! {
            _ = wait_shutdown(&mut shutdown) => break,
            next = tokio::time::timeout_at(deadline, stream.next()) => next,
        };
        let message = match next {
            Err(_) => {
                conn.close_with(CloseReason::Error(RpcError::Timeout(format!(
                    "no pong within {pong_wait:?}"
                ))));
                break;
            }
            Ok(None) => {
                conn.close_with(CloseReason::Peer);
                break;
            }
            Ok(Some(Err(e))) => {
                let err = RpcError::from(e);
                let reason = if err == RpcError::ConnectionClosed {
                    CloseReason::Peer
                } else {
                    CloseReason::Error(err)
                };
                conn.close_with(reason);
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Binary(bytes) => match Frame::decode(&bytes) {
                Ok(Frame::Pong) => deadline = Instant::now() + pong_wait,
                Ok(frame) => conn.route(frame),
                Err(e) => {
                    conn.close_with(CloseReason::Error(e.into()));
                    break;
                }
            },
            Message::Close(_) => {
                conn.close_with(CloseReason::Peer);
                break;
            }
            Message::Text(_) => {
                conn.close_with(CloseReason::Error(RpcError::Protocol(
                    "text message on RPC connection".into(),
                )));
                break;
            }
            // Transport-level control frames; tungstenite answers pings itself.
            _ => {}
        }
    }
    debug!("Read pump stopped");
}

async fn write_pump<S>(
    conn: Connection,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::Receiver<Frame>,
    mut shutdown: watch::Receiver<bool>,
    write_timeout: Duration,
    ping_period: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ping_period = ping_period.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_period, ping_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            biased;
            _ = wait_shutdown(&mut shutdown) => break,
            _ = conn.inner.pong_due.notified() => Frame::Pong,
            _ = ticker.tick() => Frame::Ping,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(kind = %frame.kind(), error = %e, "Dropping unencodable frame");
                continue;
            }
        };
        match tokio::time::timeout(write_timeout, sink.send(Message::Binary(bytes))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let err = RpcError::from(e);
                let reason = if err == RpcError::ConnectionClosed {
                    CloseReason::Peer
                } else {
                    CloseReason::Error(err)
                };
                conn.close_with(reason);
                break;
            }
            Err(_) => {
                conn.close_with(CloseReason::Error(RpcError::Timeout(format!(
                    "write exceeded {write_timeout:?}"
                ))));
                break;
            }
        }
    }

    // Best effort: the peer may already be gone.
    let _ = tokio::time::timeout(write_timeout, sink.send(Message::Close(None))).await;
    let _ = tokio::time::timeout(write_timeout, sink.close()).await;
    debug!("Write pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeepaliveConfig;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    /// A connection over an in-memory pipe, plus the raw socket of its peer.
    async fn connected_pair(pong_wait: Duration) -> (Connection, WebSocketStream<DuplexStream>) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let local = WebSocketStream::from_raw_socket(local, Role::Server, None).await;
        let remote = WebSocketStream::from_raw_socket(remote, Role::Client, None).await;
        let conn = Connection::spawn(
            local,
            PeerIdentity::from(&wsrpc_wire::generate_signing_key()),
            StateCell::new(),
            Arc::new(Dispatcher::new()),
            TransportConfig {
                write_timeout: Duration::from_secs(5),
                keepalive: KeepaliveConfig::new(pong_wait),
                write_queue: 256,
            },
            Span::none(),
        );
        (conn, remote)
    }

    /// Queue more data than the pipe holds so the write pump stalls.
    async fn fill_queue(conn: &Connection, frames: u64) {
        for id in 0..frames {
            conn.enqueue(Frame::Response {
                id,
                payload: vec![0u8; 16 * 1024],
            })
            .await
            .unwrap();
        }
    }

    /// How many frames the peer reads before `wanted`.
    async fn frames_before(remote: &mut WebSocketStream<DuplexStream>, wanted: Frame) -> usize {
        let mut seen = 0;
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), remote.next())
                .await
                .expect("frame should arrive")
                .unwrap()
                .unwrap();
            if let Message::Binary(bytes) = message {
                if Frame::decode(&bytes).unwrap() == wanted {
                    return seen;
                }
                seen += 1;
            }
        }
    }

    #[tokio::test]
    async fn test_pong_overtakes_queued_frames() {
        let (conn, mut remote) = connected_pair(Duration::from_secs(60)).await;
        fill_queue(&conn, 200).await;

        remote
            .send(Message::Binary(Frame::Ping.encode().unwrap()))
            .await
            .unwrap();
        let before = frames_before(&mut remote, Frame::Pong).await;
        assert!(before < 20, "pong sent after {before} queued frames");
        assert_eq!(conn.state(), ConnState::Established);
    }

    #[tokio::test]
    async fn test_keepalive_ping_overtakes_queued_frames() {
        // Ping period is 900ms; the first read window ends at 1s.
        let (conn, mut remote) = connected_pair(Duration::from_secs(1)).await;
        fill_queue(&conn, 200).await;

        tokio::time::sleep(Duration::from_millis(600)).await;
        remote
            .send(Message::Binary(Frame::Pong.encode().unwrap()))
            .await
            .unwrap();
        // Start draining only after the first tick is due.
        tokio::time::sleep(Duration::from_millis(500)).await;

        let before = frames_before(&mut remote, Frame::Ping).await;
        assert!(before < 20, "ping sent after {before} queued frames");
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_state_only_moves_forward() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), ConnState::Connecting);
        assert!(cell.advance(ConnState::Authenticating));
        assert!(cell.advance(ConnState::Closing));
        assert!(!cell.advance(ConnState::Established));
        assert!(!cell.advance(ConnState::Closing));
        assert_eq!(cell.get(), ConnState::Closing);
        assert!(cell.advance(ConnState::Closed));
    }

    #[tokio::test]
    async fn test_state_subscribers_see_transitions() {
        let cell = StateCell::new();
        let mut rx = cell.subscribe();
        cell.advance(ConnState::Authenticating);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnState::Authenticating);
    }

    #[test]
    fn test_states_are_ordered() {
        assert!(ConnState::Connecting < ConnState::Established);
        assert!(ConnState::Closing < ConnState::Closed);
    }
}
