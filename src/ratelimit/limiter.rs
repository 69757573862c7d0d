//! Multi-rule evaluation against the counter store.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, trace};

use super::backend::CounterStore;
use super::key::{Attributes, KeyBuilder};
use super::rules::Rule;
use crate::error::EvaluationError;

/// Method segment used in the storage keys of global rules.
///
/// Global rules share one counter per identity across every method.
pub const GLOBAL_SCOPE: &str = "global";

/// The caller's identity token and the attributes extracted for this call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateKey {
    pub identity: String,
    pub attributes: Attributes,
}

impl RateKey {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// Result of checking one call's rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    /// Every exceeded rule, in evaluation order. Never empty.
    Exceeded(Vec<Rule>),
}

impl Verdict {
    fn from_exceeded(exceeded: Vec<Rule>) -> Self {
        if exceeded.is_empty() {
            Verdict::Allowed
        } else {
            Verdict::Exceeded(exceeded)
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }

    pub fn exceeded(&self) -> &[Rule] {
        match self {
            Verdict::Allowed => &[],
            Verdict::Exceeded(rules) => rules,
        }
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.exceeded().iter().map(Rule::name).collect()
    }
}

/// Whether evaluation stops at the first exceeded rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMode {
    /// Check every rule and report all violations.
    #[default]
    CollectAll,
    /// Stop at the first violation. Later rules are not counted.
    FailFast,
}

/// Checks rules for one call against the counter store.
///
/// Rules are checked one at a time, global rules first, then method rules,
/// each in declaration order. A rule is exceeded when the post-increment
/// count is strictly greater than its limit. A store failure aborts the
/// evaluation and discards anything gathered so far.
pub struct RateLimiter {
    namespace: String,
    store: Arc<dyn CounterStore>,
    key_builder: Arc<dyn KeyBuilder>,
    mode: EvaluationMode,
}

impl RateLimiter {
    pub fn new(
        namespace: impl Into<String>,
        store: Arc<dyn CounterStore>,
        key_builder: Arc<dyn KeyBuilder>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            store,
            key_builder,
            mode: EvaluationMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: EvaluationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn mode(&self) -> EvaluationMode {
        self.mode
    }

    /// Evaluate the global and method rules for one call.
    pub async fn evaluate(
        &self,
        rate_key: &RateKey,
        method: &str,
        global_rules: &[Rule],
        method_rules: &[Rule],
    ) -> Result<Verdict, EvaluationError> {
        let checks = global_rules
            .iter()
            .map(|rule| ("global", GLOBAL_SCOPE, rule))
            .chain(method_rules.iter().map(|rule| ("method", method, rule)));

        let mut exceeded = Vec::new();

        for (kind, scope, rule) in checks {
            if self.check_rule(rate_key, kind, scope, rule).await? {
                continue;
            }
            exceeded.push(rule.clone());
            if self.mode == EvaluationMode::FailFast {
                break;
            }
        }

        if !exceeded.is_empty() {
            debug!(
                identity = %rate_key.identity,
                method = %method,
                exceeded = ?exceeded.iter().map(Rule::name).collect::<Vec<_>>(),
                "Rate limit exceeded"
            );
        }

        Ok(Verdict::from_exceeded(exceeded))
    }

    /// Count one hit against `rule`. Returns `true` while within the limit.
    async fn check_rule(
        &self,
        rate_key: &RateKey,
        kind: &'static str,
        scope: &str,
        rule: &Rule,
    ) -> Result<bool, EvaluationError> {
        let key = self.key_builder.build(
            &self.namespace,
            &rate_key.identity,
            scope,
            rule.name(),
            &rate_key.attributes,
        );

        let count = self
            .store
            .increment(&key, rule.window())
            .await
            .map_err(|source| {
                error!(
                    key = %key,
                    backend = self.store.backend_name(),
                    error = %source,
                    "Counter increment failed"
                );
                EvaluationError {
                    scope: kind,
                    rule: rule.name().to_string(),
                    source,
                }
            })?;

        trace!(key = %key, count = count, limit = rule.limit(), "Checked rate limit rule");
        Ok(!rule.is_exceeded_by(count))
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("namespace", &self.namespace)
            .field("backend", &self.store.backend_name())
            .field("mode", &self.mode)
            .finish()
    }
}
