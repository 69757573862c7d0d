//! In-process counter store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use super::backend::CounterStore;
use super::clock::{Clock, SystemClock};
use crate::error::StoreError;

/// One fixed-window counter.
#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: u64,
    /// `None` when created with a zero window
    expires_at: Option<Instant>,
}

impl CounterEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

/// Counter store backed by a sharded concurrent map.
///
/// Each increment holds the entry's shard lock for the whole
/// check-reset-increment sequence, which makes it atomic per key. State is
/// bounded by process memory and lost on restart, so this backend suits
/// single-instance deployments and tests.
///
/// Expired entries are reset lazily on their next increment. Call
/// [`purge_expired`](Self::purge_expired) to reclaim memory held by keys that
/// are never hit again.
#[derive(Debug)]
pub struct InMemoryCounterStore {
    entries: DashMap<String, CounterEntry>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCounterStore {
    /// Create a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Current count for `key`, or `None` if absent or expired.
    pub fn count(&self, key: &str) -> Option<u64> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.count)
    }

    /// Expiry of the live window for `key`.
    pub fn expires_at(&self, key: &str) -> Option<Instant> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| entry.expires_at)
    }

    /// Drop every entry whose window has passed.
    pub fn purge_expired(&self) {
        let now = self.clock.now();
        self.entries.retain(|_, entry| !entry.is_expired(now));
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        if key.is_empty() {
            return Err(StoreError::EmptyKey);
        }

        let now = self.clock.now();
        let mut entry = self
            .entries
            .entry(key.to_owned())
            .or_insert(CounterEntry {
                count: 0,
                expires_at: None,
            });

        if entry.count == 0 || entry.is_expired(now) {
            entry.count = 1;
            entry.expires_at = (!window.is_zero()).then(|| now + window);
            trace!(key = %key, window = ?window, "Started new counter window");
        } else {
            entry.count += 1;
        }

        Ok(entry.count)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
