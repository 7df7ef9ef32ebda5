//! Short-TTL idempotency store for submission replay protection.
//!
//! Keyed by the client's Idempotency-Key; records pair a body fingerprint
//! with the order id that key resolved to. Reservation uses the cache's
//! atomic entry API so two racing submissions sharing a key agree on one
//! winner.

use moka::sync::Cache;
use sha2::{Digest, Sha256};
use std::time::Duration;
use uuid::Uuid;

use crate::models::order::ExecuteOrderRequest;

/// TTL for idempotency records (5 minutes)
pub const IDEMPOTENCY_TTL: Duration = Duration::from_secs(300);

const MAX_TRACKED_KEYS: u64 = 100_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub fingerprint: String,
    pub order_id: Uuid,
}

pub struct IdempotencyStore {
    cache: Cache<String, IdempotencyRecord>,
}

impl IdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(MAX_TRACKED_KEYS)
            .time_to_live(ttl)
            .build();
        Self { cache }
    }

    /// Canonical fingerprint of a submission body.
    pub fn fingerprint(request: &ExecuteOrderRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.order_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(request.token_in.as_bytes());
        hasher.update([0u8]);
        hasher.update(request.token_out.as_bytes());
        hasher.update([0u8]);
        hasher.update(request.amount.as_bytes());
        hasher.update([0u8]);
        hasher.update(request.slippage.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<IdempotencyRecord> {
        self.cache.get(key)
    }

    /// Atomically claim `key` with `record`; returns the record that owns
    /// the key after the call (ours if we won the race).
    pub fn reserve(&self, key: &str, record: IdempotencyRecord) -> IdempotencyRecord {
        self.cache
            .entry_by_ref(key)
            .or_insert_with(|| record)
            .into_value()
    }

    /// Drop our reservation after a failed admission, but only if the key
    /// still maps to our order id.
    pub fn release(&self, key: &str, order_id: Uuid) {
        if let Some(existing) = self.cache.get(key) {
            if existing.order_id == order_id {
                self.cache.invalidate(key);
            }
        }
    }
}

impl Default for IdempotencyStore {
    fn default() -> Self {
        Self::new(IDEMPOTENCY_TTL)
    }
}
