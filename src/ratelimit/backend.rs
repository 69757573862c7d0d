//! Counter store trait for abstracting in-process and networked storage.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreError;

/// Storage for fixed-window counters.
///
/// `increment` must be atomic per key and must keep fixed-window semantics:
/// when the key is absent or its expiry has passed, the count restarts at 1
/// and the expiry becomes `now + window`; otherwise the count grows by one
/// and the expiry is left untouched. A zero `window` creates an entry that
/// never expires.
///
/// Refreshing the expiry on every hit turns the algorithm into a sliding
/// window and breaks this contract.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter for `key`, returning the post-increment count.
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, StoreError>;

    /// Short backend name for logging.
    fn backend_name(&self) -> &'static str;
}
