//! Redis-backed counter store.
//!
//! Lets several gate instances share counters. The whole
//! increment-and-maybe-expire sequence runs as one Lua script, so Redis
//! executes it atomically and in a single round trip:
//!
//! ```lua
//! local current = redis.call("INCR", KEYS[1])
//! if current == 1 and tonumber(ARGV[1]) > 0 then
//!     redis.call("PEXPIRE", KEYS[1], ARGV[1])
//! end
//! return current
//! ```
//!
//! The expiry is only set on the hit that creates the key, and Redis drops
//! the key once it passes, which gives fixed-window behavior.
//!
//! Reconnection is handled by `redis::aio::ConnectionManager`; the store
//! itself never retries a failed increment.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::fmt;
use std::time::Duration;
use tracing::{error, info, trace};

use super::backend::CounterStore;
use crate::error::StoreError;

const INCREMENT_SCRIPT: &str = r#"
local current = redis.call("INCR", KEYS[1])
if current == 1 and tonumber(ARGV[1]) > 0 then
    redis.call("PEXPIRE", KEYS[1], ARGV[1])
end
return current
"#;

/// Configuration for the Redis counter store.
#[derive(Debug, Clone, Default)]
pub struct RedisStoreConfig {
    /// Upper bound on one increment round trip
    pub response_timeout: Option<Duration>,
}

/// Counter store shared through Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    script: Script,
    config: RedisStoreConfig,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect to Redis with default configuration.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect to Redis with custom configuration.
    pub async fn connect_with_config(
        url: &str,
        config: RedisStoreConfig,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!(timeout = ?config.response_timeout, "Connected Redis counter store");

        Ok(Self::from_connection(connection, config))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(connection: ConnectionManager, config: RedisStoreConfig) -> Self {
        Self {
            connection,
            script: Script::new(INCREMENT_SCRIPT),
            config,
        }
    }

    async fn run_script(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let mut connection = self.connection.clone();
        let count: i64 = self
            .script
            .key(key)
            .arg(window_millis(window))
            .invoke_async(&mut connection)
            .await?;

        u64::try_from(count).map_err(|_| StoreError::UnexpectedReply(count.to_string()))
    }
}

/// Window length for `PEXPIRE`, rounded up to whole milliseconds so a
/// sub-millisecond window still expires.
fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        if key.is_empty() {
            return Err(StoreError::EmptyKey);
        }

        let result = match self.config.response_timeout {
            Some(limit) => tokio::time::timeout(limit, self.run_script(key, window))
                .await
                .map_err(|_| StoreError::Timeout(limit))
                .and_then(|r| r),
            None => self.run_script(key, window).await,
        };

        match &result {
            Ok(count) => trace!(key = %key, count = count, "Incremented Redis counter"),
            Err(e) => error!(key = %key, error = %e, "Redis increment failed"),
        }
        result
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
