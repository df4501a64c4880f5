//! Per-call context: peer identity, deadline, cancellation.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use wsrpc_wire::PeerIdentity;

/// Context passed with every call.
///
/// Inbound, `peer` is the verified caller. Outbound from a server, `peer`
/// selects which connected client receives the call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    peer: Option<PeerIdentity>,
    deadline: Option<Instant>,
    cancel: Option<CancelToken>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peer(mut self, peer: PeerIdentity) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Set a deadline `timeout` from now. An earlier existing deadline wins.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn peer(&self) -> Option<PeerIdentity> {
        self.peer
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    /// Resolves once the deadline passes. Never resolves without one.
    pub(crate) async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    /// Resolves once the call is cancelled. Never resolves without a token.
    pub(crate) async fn cancelled(&self) {
        match &self.cancel {
            Some(token) => token.clone().cancelled().await,
            None => std::future::pending().await,
        }
    }
}

/// Owner side of a cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a cancellation signal, carried in a [`CallContext`].
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for cancellation. A dropped handle that never cancelled means
    /// the call is never cancelled.
    pub async fn cancelled(mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
