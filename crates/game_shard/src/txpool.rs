use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use game_shard_proto::SignedTransaction;

use crate::message::MessageId;

/// One accepted transaction waiting to be drained into a tick. The envelope
/// is kept verbatim so a pending batch can be replayed byte-for-byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTransaction {
    pub msg_id: MessageId,
    pub tx_hash: String,
    pub signer_address: String,
    pub envelope: SignedTransaction,
    pub value: JsonValue,
}

#[derive(Debug, Default)]
struct TxQueueInner {
    current: Vec<QueuedTransaction>,
    next: Vec<QueuedTransaction>,
    draining: bool,
}

/// Single-consumer ingestion queue with a current and a next slot. Producers
/// never wait on an in-progress drain: while a drain is being taken, new
/// arrivals land in the next slot, which is swapped in when the drain ends.
#[derive(Debug, Default)]
pub struct TxQueue {
    inner: Mutex<TxQueueInner>,
    unsigned_seq: AtomicU64,
}

impl TxQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_transaction(&self, transaction: QueuedTransaction) {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if inner.draining {
            inner.next.push(transaction);
        } else {
            inner.current.push(transaction);
        }
    }

    /// Atomically snapshots and clears the current slot, promoting the next
    /// slot for the following tick. Returns transactions in acceptance order.
    pub fn drain(&self) -> Vec<QueuedTransaction> {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.draining = true;
        let drained = std::mem::take(&mut inner.current);
        inner.current = std::mem::take(&mut inner.next);
        inner.draining = false;
        drained
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.current.len() + inner.next.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Monotonic sequence used to give unsigned dev-mode submissions unique
    /// hashes.
    pub fn next_unsigned_nonce(&self) -> u64 {
        self.unsigned_seq.fetch_add(1, Ordering::SeqCst)
    }
}
