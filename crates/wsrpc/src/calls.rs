//! Call multiplexer: correlation ids and pending response slots.
//!
//! Every outstanding outbound call owns one entry in the [`CallTable`].
//! An entry leaves the table exactly once: when its response arrives, when
//! the caller gives up (deadline, cancel, or dropping the future), or when
//! the connection closes and [`CallTable::fail_all`] drains everything.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::RpcError;

/// What a pending call eventually receives.
pub(crate) type CallResult = Result<Vec<u8>, RpcError>;

struct PendingCall {
    method: String,
    tx: oneshot::Sender<CallResult>,
}

struct TableState {
    next_id: u64,
    pending: HashMap<u64, PendingCall>,
    closed: bool,
}

/// Pending calls of one connection. The lock is never held across `.await`.
pub(crate) struct CallTable {
    state: Mutex<TableState>,
}

impl CallTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                next_id: 1,
                pending: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Allocate an id unique among pending calls and park a response slot.
    pub fn register(&self, method: &str) -> Result<(u64, oneshot::Receiver<CallResult>), RpcError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Err(RpcError::ConnectionClosed);
        }
        let id = loop {
            let candidate = state.next_id;
            state.next_id = state.next_id.wrapping_add(1);
            if !state.pending.contains_key(&candidate) {
                break candidate;
            }
        };
        let (tx, rx) = oneshot::channel();
        state.pending.insert(
            id,
            PendingCall {
                method: method.to_string(),
                tx,
            },
        );
        Ok((id, rx))
    }

    /// Hand a result to the call waiting on `id`. Returns `false` for ids
    /// that are not pending (late, duplicate, or never issued).
    pub fn complete(&self, id: u64, result: CallResult) -> bool {
        let entry = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.pending.remove(&id)
        };
        match entry {
            Some(call) => {
                if call.tx.send(result).is_err() {
                    debug!(id, method = %call.method, "Caller gone before response");
                }
                true
            }
            None => {
                debug!(id, "Dropping response for unknown call id");
                false
            }
        }
    }

    /// Forget a call whose caller stopped waiting.
    pub fn remove(&self, id: u64) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pending.remove(&id).is_some()
    }

    /// Close the table: every pending call fails with `ConnectionClosed`
    /// and later registrations are refused. Returns how many calls failed.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<PendingCall> = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.closed = true;
            state.pending.drain().map(|(_, call)| call).collect()
        };
        let count = drained.len();
        for call in drained {
            let _ = call.tx.send(Err(RpcError::ConnectionClosed));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .len()
    }
}

/// Removes a pending entry when the caller's future is dropped or gives up.
pub(crate) struct PendingGuard<'a> {
    table: &'a CallTable,
    id: u64,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    pub fn new(table: &'a CallTable, id: u64) -> Self {
        Self {
            table,
            id,
            armed: true,
        }
    }

    /// The entry was already consumed by a delivered result.
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.table.remove(self.id);
        }
    }
}
