//! Transaction Deduplication
//!
//! Per-subscription, time-windowed "seen" set keyed by transaction hash.
//! Multiple endpoints watching the same mempool will deliver the same
//! transaction more than once; the first occurrence within the window wins.

use alloy::primitives::TxHash;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Default window during which a repeated hash is suppressed
pub const DEDUPE_TTL_MS: u64 = 60_000;

/// Hard cap on tracked hashes. Amortized pruning bounds staleness, not
/// burst memory; past this cap the oldest entries are evicted first.
pub const MAX_SEEN_ENTRIES: usize = 65_536;

/// Time-windowed seen set with amortized pruning
pub struct Deduplicator {
    ttl: Duration,
    max_entries: usize,
    seen: Mutex<HashMap<TxHash, Instant>>,
}

impl Deduplicator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            max_entries: MAX_SEEN_ENTRIES,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Whether a hash should flow through the pipeline.
    ///
    /// Returns `false` for a hash seen less than the TTL ago. Otherwise
    /// records the hash, prunes expired entries (amortized over each call),
    /// enforces the entry cap, and returns `true`.
    pub fn should_process(&self, hash: TxHash) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(last_seen) = seen.get(&hash) {
            if now.duration_since(*last_seen) < self.ttl {
                return false;
            }
        }
        seen.insert(hash, now);

        seen.retain(|_, at| now.duration_since(*at) < self.ttl);

        if seen.len() > self.max_entries {
            let excess = seen.len() - self.max_entries;
            let mut by_age: Vec<(TxHash, Instant)> = seen.iter().map(|(h, at)| (*h, *at)).collect();
            by_age.sort_by_key(|(_, at)| *at);
            for (old_hash, _) in by_age.into_iter().take(excess) {
                seen.remove(&old_hash);
            }
        }

        true
    }

    /// Number of tracked hashes
    pub fn len(&self) -> usize {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all tracked hashes
    pub fn clear(&self) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
