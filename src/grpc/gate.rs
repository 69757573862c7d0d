//! Admission control around unary gRPC handlers.

use std::future::Future;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, error, instrument, warn};

use super::formatter::{DefaultViolationFormatter, ViolationFormatter};
use super::identity::{
    CallContext, FieldTagAttributes, IdentityProvider, MetadataIdentity, Payload, PeerIdentity,
    StaticIdentity, ANONYMOUS,
};
use crate::config::{GateConfig, IdentityConfig, IdentitySource, StoreBackend, StoreConfig};
use crate::error::{GateError, Result};
use crate::ratelimit::{
    CounterStore, DefaultKeyBuilder, EvaluationMode, InMemoryCounterStore, KeyBuilder,
    RateLimiter, Rule, RuleSource, StaticRules, Verdict,
};

/// Decision for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Run the handler.
    Proceed,
    /// Refuse the call; holds every exceeded rule in evaluation order.
    Rejected(Vec<Rule>),
}

impl Admission {
    pub fn is_proceed(&self) -> bool {
        matches!(self, Admission::Proceed)
    }

    pub fn rule_names(&self) -> Vec<&str> {
        match self {
            Admission::Proceed => Vec::new(),
            Admission::Rejected(rules) => rules.iter().map(Rule::name).collect(),
        }
    }
}

/// Rate limiting gate placed in front of RPC handlers.
///
/// For each call the gate extracts the caller's identity, looks up the
/// method's rules, evaluates global and method rules, then lets the call
/// through or rejects it. Identity and counter store failures surface as
/// `INTERNAL` and are never confused with a rejection.
pub struct CallGate {
    limiter: RateLimiter,
    rules: RuleSource,
    global_rules: Vec<Rule>,
    identity: Arc<dyn IdentityProvider>,
    formatter: Arc<dyn ViolationFormatter>,
}

impl CallGate {
    pub fn builder() -> CallGateBuilder {
        CallGateBuilder::default()
    }

    /// Build a gate from configuration, connecting to the configured store.
    pub async fn from_config(config: &GateConfig) -> Result<Self> {
        config.validate()?;

        let store = connect_store(&config.store).await?;
        let gate = Self::builder()
            .namespace(config.namespace.clone())
            .evaluation_mode(config.evaluation)
            .global_rules(config.global_rules()?)
            .rule_source(RuleSource::new(Arc::new(StaticRules::new(
                config.method_rules()?,
            ))))
            .store(store)
            .identity_provider(identity_provider(&config.identity))
            .build();

        Ok(gate)
    }

    pub fn namespace(&self) -> &str {
        self.limiter.namespace()
    }

    pub fn global_rules(&self) -> &[Rule] {
        &self.global_rules
    }

    pub fn rule_source(&self) -> &RuleSource {
        &self.rules
    }

    /// Decide whether one call may proceed.
    pub async fn admit(&self, call: &CallContext<'_>, payload: &dyn Payload) -> Result<Admission> {
        let rate_key = self.identity.extract(call, payload).map_err(|e| {
            error!(method = %call.method, error = %e, "Cannot extract rate key");
            e
        })?;
        debug!(
            identity = %rate_key.identity,
            attributes = rate_key.attributes.len(),
            method = %call.method,
            "Extracted rate key"
        );

        let method_rules = self.rules.rules_for(call.method).await;

        let verdict = self
            .limiter
            .evaluate(&rate_key, call.method, &self.global_rules, method_rules)
            .await
            .map_err(|e| {
                error!(
                    identity = %rate_key.identity,
                    method = %call.method,
                    error = %e,
                    "Error checking rate limits"
                );
                e
            })?;

        Ok(match verdict {
            Verdict::Allowed => Admission::Proceed,
            Verdict::Exceeded(rules) => Admission::Rejected(rules),
        })
    }

    /// Run `handler` for `request` if the call is admitted.
    ///
    /// Rejections are returned as the formatter's status, internal failures
    /// as `INTERNAL`.
    #[instrument(skip_all, fields(method = %method))]
    pub async fn intercept<Req, Resp, F, Fut>(
        &self,
        method: &str,
        request: Request<Req>,
        handler: F,
    ) -> std::result::Result<Response<Resp>, Status>
    where
        Req: Payload,
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = std::result::Result<Response<Resp>, Status>>,
    {
        let admission = {
            let call = CallContext::from_request(method, &request);
            self.admit(&call, request.get_ref()).await
        };

        match admission {
            Ok(Admission::Proceed) => handler(request).await,
            Ok(Admission::Rejected(rules)) => {
                let status = self.formatter.format(&rules);
                warn!(
                    method = %method,
                    exceeded = ?rules.iter().map(Rule::name).collect::<Vec<_>>(),
                    "Call rejected by rate limiter"
                );
                Err(status)
            }
            Err(e) => Err(internal_status(&e)),
        }
    }
}

impl std::fmt::Debug for CallGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallGate")
            .field("limiter", &self.limiter)
            .field("global_rules", &self.global_rules)
            .finish_non_exhaustive()
    }
}

/// Map an internal gate failure to the status returned to callers.
pub fn internal_status(err: &GateError) -> Status {
    match err {
        GateError::Identity(e) => Status::internal(format!("cannot extract rate key: {}", e)),
        other => Status::internal(format!("rate limiter failure: {}", other)),
    }
}

/// Builder for [`CallGate`].
pub struct CallGateBuilder {
    namespace: String,
    global_rules: Vec<Rule>,
    mode: EvaluationMode,
    store: Option<Arc<dyn CounterStore>>,
    rules: Option<RuleSource>,
    identity: Arc<dyn IdentityProvider>,
    key_builder: Arc<dyn KeyBuilder>,
    formatter: Arc<dyn ViolationFormatter>,
}

impl Default for CallGateBuilder {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            global_rules: Vec::new(),
            mode: EvaluationMode::default(),
            store: None,
            rules: None,
            identity: Arc::new(StaticIdentity::default()),
            key_builder: Arc::new(DefaultKeyBuilder),
            formatter: Arc::new(DefaultViolationFormatter),
        }
    }
}

impl CallGateBuilder {
    /// Namespace prefixed to storage keys, for stores shared between services.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Rules applied to every method.
    pub fn global_rules(mut self, rules: Vec<Rule>) -> Self {
        self.global_rules = rules;
        self
    }

    pub fn evaluation_mode(mut self, mode: EvaluationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Counter store backend. Defaults to an in-process store.
    pub fn store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Source of per-method rules. Defaults to no method rules.
    pub fn rule_source(mut self, rules: RuleSource) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn identity_provider(mut self, provider: impl IdentityProvider + 'static) -> Self {
        self.identity = Arc::new(provider);
        self
    }

    pub fn key_builder(mut self, builder: impl KeyBuilder + 'static) -> Self {
        self.key_builder = Arc::new(builder);
        self
    }

    pub fn violation_formatter(mut self, formatter: impl ViolationFormatter + 'static) -> Self {
        self.formatter = Arc::new(formatter);
        self
    }

    pub fn build(self) -> CallGate {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryCounterStore::new()));

        CallGate {
            limiter: RateLimiter::new(self.namespace, store, self.key_builder).with_mode(self.mode),
            rules: self.rules.unwrap_or_else(RuleSource::empty),
            global_rules: self.global_rules,
            identity: self.identity,
            formatter: self.formatter,
        }
    }
}

async fn connect_store(config: &StoreConfig) -> Result<Arc<dyn CounterStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryCounterStore::new())),
        #[cfg(feature = "redis-store")]
        StoreBackend::Redis => {
            use crate::ratelimit::{RedisCounterStore, RedisStoreConfig};

            let store = RedisCounterStore::connect_with_config(
                &config.redis_url,
                RedisStoreConfig {
                    response_timeout: config.response_timeout(),
                },
            )
            .await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis-store"))]
        StoreBackend::Redis => Err(GateError::Config(
            "redis store requested but the `redis-store` feature is disabled".to_string(),
        )),
    }
}

fn identity_provider(config: &IdentityConfig) -> Arc<dyn IdentityProvider> {
    let base: Arc<dyn IdentityProvider> = match config.source {
        IdentitySource::Static => Arc::new(StaticIdentity::new(
            config.token.clone().unwrap_or_else(|| ANONYMOUS.to_string()),
        )),
        IdentitySource::Metadata => {
            let header = config.header.clone().unwrap_or_default();
            let provider = MetadataIdentity::new(header);
            match &config.token {
                Some(token) => Arc::new(provider.with_fallback(token.clone())),
                None => Arc::new(provider),
            }
        }
        IdentitySource::Peer => Arc::new(PeerIdentity),
    };

    if config.attributes.is_empty() {
        base
    } else {
        Arc::new(FieldTagAttributes::new(base, config.attributes.clone()))
    }
}
