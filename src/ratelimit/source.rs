//! Per-method rule lookup.
//!
//! A [`RuleSource`] wraps a [`RuleResolver`] and runs it once, on the first
//! lookup. Concurrent first lookups wait for that single resolution; every
//! later lookup is a plain map access on the published result.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::rules::Rule;

/// Fully-qualified method identifier to its ordered method-scoped rules.
pub type MethodRules = HashMap<String, Vec<Rule>>;

/// Produces the complete method to rules mapping.
///
/// Resolution may be expensive; a [`RuleSource`] calls it at most once.
#[async_trait]
pub trait RuleResolver: Send + Sync {
    async fn resolve(&self) -> MethodRules;
}

/// Rules supplied directly, e.g. from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticRules {
    rules: MethodRules,
}

impl StaticRules {
    pub fn new(rules: MethodRules) -> Self {
        Self { rules }
    }

    /// Add rules for one method, appending to any already declared.
    pub fn with_method(mut self, method: impl Into<String>, rules: Vec<Rule>) -> Self {
        self.rules.entry(method.into()).or_default().extend(rules);
        self
    }
}

#[async_trait]
impl RuleResolver for StaticRules {
    async fn resolve(&self) -> MethodRules {
        self.rules.clone()
    }
}

/// A method declared on a service, with the rules attached to it.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    pub name: String,
    pub rules: Vec<Rule>,
}

/// A service and its methods, as registered by the server.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    /// Fully-qualified service name, e.g. `pkg.Echo`
    pub name: String,
    pub methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    pub fn method(mut self, name: impl Into<String>, rules: Vec<Rule>) -> Self {
        self.methods.push(MethodDescriptor {
            name: name.into(),
            rules,
        });
        self
    }
}

/// Resolves rules by walking every registered service and method.
///
/// Method identifiers take the gRPC path form `/{service}/{method}`. Methods
/// without attached rules are left out of the mapping.
#[derive(Debug, Clone, Default)]
pub struct MethodRegistry {
    services: Vec<ServiceDescriptor>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, service: ServiceDescriptor) -> Self {
        self.services.push(service);
        self
    }
}

#[async_trait]
impl RuleResolver for MethodRegistry {
    async fn resolve(&self) -> MethodRules {
        let mut rules = MethodRules::new();

        for service in &self.services {
            for method in &service.methods {
                if method.rules.is_empty() {
                    continue;
                }
                let path = format!("/{}/{}", service.name, method.name);
                rules.entry(path).or_default().extend(method.rules.iter().cloned());
            }
        }

        rules
    }
}

/// Lazily resolved, process-lifetime cache of method rules.
pub struct RuleSource {
    resolver: Arc<dyn RuleResolver>,
    resolved: OnceCell<MethodRules>,
}

impl RuleSource {
    pub fn new(resolver: Arc<dyn RuleResolver>) -> Self {
        Self {
            resolver,
            resolved: OnceCell::new(),
        }
    }

    /// A source with no method rules at all.
    pub fn empty() -> Self {
        Self::new(Arc::new(StaticRules::default()))
    }

    /// Rules for `method`, resolving the full mapping on first use.
    ///
    /// Unknown methods have no rules.
    pub async fn rules_for(&self, method: &str) -> &[Rule] {
        let rules = self.resolved().await;
        let method_rules = rules.get(method).map(Vec::as_slice).unwrap_or_default();
        debug!(method = %method, rules = method_rules.len(), "Found method rate limit rules");
        method_rules
    }

    /// The whole resolved mapping.
    pub async fn resolved(&self) -> &MethodRules {
        self.resolved
            .get_or_init(|| async {
                let rules = self.resolver.resolve().await;
                info!(methods = rules.len(), "Resolved method rate limit rules");
                rules
            })
            .await
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.initialized()
    }
}

impl std::fmt::Debug for RuleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleSource")
            .field("resolved", &self.resolved.get())
            .finish_non_exhaustive()
    }
}
