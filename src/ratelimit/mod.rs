//! Rate limiting rules, counter storage and evaluation.

mod backend;
mod clock;
mod counter;
mod key;
mod limiter;
#[cfg(feature = "redis-store")]
mod redis_store;
mod rules;
mod source;

pub use backend::CounterStore;
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::InMemoryCounterStore;
pub use key::{Attributes, DefaultKeyBuilder, KeyBuilder, KEY_PREFIX};
pub use limiter::{EvaluationMode, RateKey, RateLimiter, Verdict, GLOBAL_SCOPE};
#[cfg(feature = "redis-store")]
pub use redis_store::{RedisCounterStore, RedisStoreConfig};
pub use rules::{parse_rules, Rule, RuleConfig, TimeUnit};
pub use source::{
    MethodDescriptor, MethodRegistry, MethodRules, RuleResolver, RuleSource, ServiceDescriptor,
    StaticRules,
};

#[cfg(test)]
pub(crate) use limiter::tests as test_stores;
