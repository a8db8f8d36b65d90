//! Request correlator: matches responses back to their requests by id.
//!
//! A pending entry is removed from the table in the same critical section
//! that resolves it, so each request completes exactly once: with a
//! result, a server error, a timeout, or a disconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::codec::Message;
use crate::error::LspError;
use crate::writer::Outbound;

type Outcome = Result<Value, LspError>;
type PendingTable = HashMap<u64, oneshot::Sender<Outcome>>;

pub(crate) struct Correlator {
    next_id: AtomicU64,
    pending: Mutex<PendingTable>,
}

/// Drops the pending entry when the waiting future goes away, including
/// when the caller abandons it mid-await.
struct PendingEntry<'a> {
    correlator: &'a Correlator,
    id: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.correlator.table().remove(&self.id);
    }
}

impl Correlator {
    /// Ids start at 1 and are never reused for the lifetime of the correlator.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send a request and wait for its outcome.
    ///
    /// `timeout` bounds the whole exchange, including a write stalled on a
    /// server that has stopped reading its input. The timeout is a local
    /// cancellation: the server is not asked to abort, and a late response
    /// finds no pending entry and is dropped.
    pub async fn issue(
        &self,
        outbound: &Outbound,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Outcome {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.table().insert(id, tx);
        let _entry = PendingEntry {
            correlator: self,
            id,
        };

        tracing::trace!(id, method, "sending request");
        let exchange = async {
            outbound.send(Message::request(id, method, params)).await?;
            rx.await.unwrap_or_else(|_| {
                Err(LspError::Disconnected(format!(
                    "{method} (id {id}) abandoned"
                )))
            })
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .unwrap_or_else(|_| {
                Err(LspError::Timeout {
                    method: method.to_string(),
                    after: timeout,
                })
            })
    }

    /// Resolve the pending entry for `id`. Returns `false` when there is
    /// none (late or unknown response).
    pub fn resolve(&self, id: u64, outcome: Outcome) -> bool {
        let Some(tx) = self.table().remove(&id) else {
            return false;
        };
        // The waiter may have just timed out; its outcome is already decided.
        let _ = tx.send(outcome);
        true
    }

    /// Fail every pending request with `Disconnected`. Returns how many.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = self.table().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(LspError::Disconnected(reason.to_string())));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.table().len()
    }
}
