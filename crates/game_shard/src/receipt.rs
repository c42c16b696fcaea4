use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::entity::Tick;
use crate::txpool::QueuedTransaction;

pub const DEFAULT_RECEIPT_HISTORY_SIZE: usize = 10;

/// The outcome of one drained transaction: at most one result (last writer
/// wins) and any number of accumulated errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub tx_hash: String,
    pub tick: Tick,
    pub result: Option<JsonValue>,
    pub errors: Vec<String>,
}

/// Receipt window reply: the largest `[start_tick, end_tick)` range held in
/// the history with `start_tick` at or after the requested tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptsReply {
    pub start_tick: Tick,
    pub end_tick: Tick,
    pub receipts: Vec<Receipt>,
}

/// Receipt accumulator for the tick in progress. Every drained transaction
/// gets an entry up front, so a receipt exists even when no system touches
/// it.
#[derive(Debug, Default)]
pub struct TickReceipts {
    order: Vec<String>,
    outcomes: BTreeMap<String, (Option<JsonValue>, Vec<String>)>,
}

impl TickReceipts {
    pub fn for_drained(drained: &[QueuedTransaction]) -> Self {
        let mut receipts = Self::default();
        for queued in drained {
            receipts.ensure(&queued.tx_hash);
        }
        receipts
    }

    fn ensure(&mut self, tx_hash: &str) {
        if !self.outcomes.contains_key(tx_hash) {
            self.order.push(tx_hash.to_string());
            self.outcomes
                .insert(tx_hash.to_string(), (None, Vec::new()));
        }
    }

    pub fn set_result(&mut self, tx_hash: &str, result: JsonValue) {
        self.ensure(tx_hash);
        if let Some((slot, _)) = self.outcomes.get_mut(tx_hash) {
            *slot = Some(result);
        }
    }

    pub fn add_error(&mut self, tx_hash: &str, error: impl Into<String>) {
        self.ensure(tx_hash);
        if let Some((_, errors)) = self.outcomes.get_mut(tx_hash) {
            errors.push(error.into());
        }
    }

    pub fn result_of(&self, tx_hash: &str) -> Option<&JsonValue> {
        self.outcomes
            .get(tx_hash)
            .and_then(|(result, _)| result.as_ref())
    }

    pub fn errors_of(&self, tx_hash: &str) -> &[String] {
        self.outcomes
            .get(tx_hash)
            .map(|(_, errors)| errors.as_slice())
            .unwrap_or(&[])
    }

    pub fn into_receipts(self, tick: Tick) -> Vec<Receipt> {
        let mut outcomes = self.outcomes;
        self.order
            .iter()
            .filter_map(|tx_hash| {
                outcomes.remove(tx_hash).map(|(result, errors)| Receipt {
                    tx_hash: tx_hash.clone(),
                    tick,
                    result,
                    errors,
                })
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct ReceiptRing {
    size: usize,
    ticks: VecDeque<(Tick, Vec<Receipt>)>,
}

/// Bounded per-tick receipt history: the last `size` committed ticks, each
/// with its receipt slice (possibly empty).
#[derive(Debug)]
pub struct ReceiptHistory {
    inner: Mutex<ReceiptRing>,
}

impl ReceiptHistory {
    pub fn new(size: usize) -> Self {
        Self {
            inner: Mutex::new(ReceiptRing {
                size: size.max(1),
                ticks: VecDeque::new(),
            }),
        }
    }

    pub fn append(&self, tick: Tick, receipts: Vec<Receipt>) {
        let mut ring = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ring.ticks.push_back((tick, receipts));
        while ring.ticks.len() > ring.size {
            ring.ticks.pop_front();
        }
    }

    /// The window contract: returns the largest `[start_tick, end_tick)`
    /// contained in the ring with `start_tick >= since`. A request beyond
    /// the current tick yields an empty window at `current_tick`.
    pub fn window(&self, since: Tick, current_tick: Tick) -> ReceiptsReply {
        let ring = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if since >= current_tick {
            return ReceiptsReply {
                start_tick: current_tick,
                end_tick: current_tick,
                receipts: Vec::new(),
            };
        }
        let oldest = ring.ticks.front().map(|(tick, _)| *tick).unwrap_or(current_tick);
        let start_tick = since.max(oldest);
        let mut receipts = Vec::new();
        for (tick, slice) in &ring.ticks {
            if *tick >= start_tick {
                receipts.extend(slice.iter().cloned());
            }
        }
        ReceiptsReply {
            start_tick,
            end_tick: current_tick,
            receipts,
        }
    }

    /// All receipts for a specific tick still held in the ring.
    pub fn receipts_for_tick(&self, tick: Tick) -> Option<Vec<Receipt>> {
        let ring = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ring.ticks
            .iter()
            .find(|(held, _)| *held == tick)
            .map(|(_, slice)| slice.clone())
    }
}
