//! Configuration management for the gate.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tonic::metadata::AsciiMetadataKey;
use tracing::info;

use crate::error::{GateError, Result};
use crate::grpc::FieldTag;
use crate::ratelimit::{parse_rules, EvaluationMode, MethodRules, Rule, RuleConfig};

/// Prefix of environment variables overriding file settings.
pub const ENV_PREFIX: &str = "RATEGATE";

/// Main configuration for the gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Namespace prefixed to every storage key
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Whether to stop evaluating at the first exceeded rule
    #[serde(default)]
    pub evaluation: EvaluationMode,

    /// Rules applied to every method
    #[serde(default)]
    pub global_rules: Vec<RuleConfig>,

    /// Rules applied to individual methods
    #[serde(default)]
    pub methods: Vec<MethodRulesConfig>,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Identity extraction configuration
    #[serde(default)]
    pub identity: IdentityConfig,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            evaluation: EvaluationMode::default(),
            global_rules: Vec::new(),
            methods: Vec::new(),
            store: StoreConfig::default(),
            identity: IdentityConfig::default(),
        }
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

/// Rules declared for one method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodRulesConfig {
    /// Fully-qualified method identifier, e.g. `/pkg.Echo/Say`
    pub method: String,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Counter store backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Upper bound on one Redis increment, unbounded when absent
    #[serde(default)]
    pub response_timeout_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            response_timeout_ms: None,
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1/".to_string()
}

impl StoreConfig {
    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_ms.map(Duration::from_millis)
    }
}

/// Where the identity token comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentitySource {
    /// A fixed token for every call
    #[default]
    Static,
    /// A request metadata entry
    Metadata,
    /// The peer IP address
    Peer,
}

/// Identity extraction configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub source: IdentitySource,

    /// Token for the static source, or fallback for the metadata source
    #[serde(default)]
    pub token: Option<String>,

    /// Metadata key for the metadata source
    #[serde(default)]
    pub header: Option<String>,

    /// Payload fields added as attributes
    #[serde(default)]
    pub attributes: Vec<FieldTag>,
}

impl GateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        info!(path = %path, "Loading gate configuration");
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GateError::Config(format!("Failed to parse gate config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file layered with `RATEGATE__*` environment
    /// overrides, e.g. `RATEGATE__STORE__BACKEND=redis`.
    pub fn load(path: &str) -> Result<Self> {
        info!(path = %path, "Loading layered gate configuration");
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| GateError::Config(e.to_string()))?;

        let config: GateConfig = settings
            .try_deserialize()
            .map_err(|e| GateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every rule declaration and the identity settings.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(GateError::Config("namespace must not be empty".to_string()));
        }
        self.global_rules()?;
        self.method_rules()?;

        if self.identity.source == IdentitySource::Metadata {
            let header = self.identity.header.as_deref().ok_or_else(|| {
                GateError::Config("identity source `metadata` requires `header`".to_string())
            })?;
            AsciiMetadataKey::from_bytes(header.to_ascii_lowercase().as_bytes()).map_err(|_| {
                GateError::Config(format!(
                    "identity header {header:?} is not an ascii metadata key"
                ))
            })?;
        }

        for tag in &self.identity.attributes {
            if !tag.path.is_empty() && !tag.path.starts_with('/') {
                return Err(GateError::Config(format!(
                    "attribute {:?} path {:?} must be a JSON pointer starting with '/'",
                    tag.name, tag.path
                )));
            }
        }
        Ok(())
    }

    /// The validated global rules.
    pub fn global_rules(&self) -> Result<Vec<Rule>> {
        Ok(parse_rules(&self.global_rules)?)
    }

    /// The validated method rules. Repeated methods have their rules
    /// appended in declaration order.
    pub fn method_rules(&self) -> Result<MethodRules> {
        let mut rules = MethodRules::new();
        for method in &self.methods {
            if method.method.is_empty() {
                return Err(GateError::Config("method identifier must not be empty".to_string()));
            }
            rules
                .entry(method.method.clone())
                .or_default()
                .extend(parse_rules(&method.rules)?);
        }
        Ok(rules)
    }
}
