//! Storage key construction.

use std::collections::BTreeMap;

/// Attributes extracted from a call, ordered by name.
pub type Attributes = BTreeMap<String, String>;

/// Prefix of every key produced by [`DefaultKeyBuilder`].
pub const KEY_PREFIX: &str = "rate-limiter";

/// Builds the counter store key for one (identity, method, rule) tuple.
///
/// Implementations must be pure: the same inputs always yield the same key.
pub trait KeyBuilder: Send + Sync {
    fn build(
        &self,
        namespace: &str,
        identity: &str,
        method: &str,
        rule: &str,
        attributes: &Attributes,
    ) -> String;
}

impl<F> KeyBuilder for F
where
    F: Fn(&str, &str, &str, &str, &Attributes) -> String + Send + Sync,
{
    fn build(
        &self,
        namespace: &str,
        identity: &str,
        method: &str,
        rule: &str,
        attributes: &Attributes,
    ) -> String {
        self(namespace, identity, method, rule, attributes)
    }
}

/// Colon-separated key layout.
///
/// `rate-limiter:{namespace}:{identity}:{method}:{rule}` followed by
/// `:{name=value,...}` when attributes are present. Attributes are rendered in
/// name order, so the key does not depend on extraction order.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultKeyBuilder;

impl KeyBuilder for DefaultKeyBuilder {
    fn build(
        &self,
        namespace: &str,
        identity: &str,
        method: &str,
        rule: &str,
        attributes: &Attributes,
    ) -> String {
        let mut key = format!("{KEY_PREFIX}:{namespace}:{identity}:{method}:{rule}");

        if !attributes.is_empty() {
            let rendered: Vec<String> = attributes
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect();
            key.push(':');
            key.push_str(&rendered.join(","));
        }

        key
    }
}
