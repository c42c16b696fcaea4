use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::verify::VerifyError;

/// Set of used `(signer_address, nonce)` pairs. Nonces are not required to be
/// monotonic; each pair is accepted at most once for the lifetime of the
/// shard. Writers are HTTP ingestion and recovery replay, serialized by the
/// mutex.
#[derive(Debug, Default)]
pub struct NonceSet {
    used: Mutex<BTreeSet<(String, u64)>>,
}

impl NonceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the in-memory set with the persisted one at game load.
    pub fn load(&self, pairs: BTreeSet<(String, u64)>) {
        let mut used = self.used.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *used = pairs;
    }

    /// Atomically records the pair, rejecting a replay.
    pub fn use_nonce(&self, signer_address: &str, nonce: u64) -> Result<(), VerifyError> {
        let mut used = self.used.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !used.insert((signer_address.to_string(), nonce)) {
            return Err(VerifyError::NonceReused {
                signer_address: signer_address.to_string(),
                nonce,
            });
        }
        Ok(())
    }

    pub fn is_used(&self, signer_address: &str, nonce: u64) -> bool {
        let used = self.used.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        used.contains(&(signer_address.to_string(), nonce))
    }
}
