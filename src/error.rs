//! Error types for the rate limiting gate.

use thiserror::Error;

/// Main error type for gate operations.
#[derive(Error, Debug)]
pub enum GateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid rule declaration
    #[error("Invalid rule: {0}")]
    Rule(#[from] RuleError),

    /// Identity or attribute extraction failed
    #[error("Identity extraction failed: {0}")]
    Identity(#[from] IdentityError),

    /// Rule evaluation could not complete
    #[error("Rate limit evaluation failed: {0}")]
    Evaluation(#[from] EvaluationError),

    /// Counter store errors outside of an evaluation (e.g. connecting)
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A rule declaration that violates the rule invariants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("rule name must not be empty")]
    EmptyName,

    #[error("rule {0:?} must have a limit greater than zero")]
    ZeroLimit(String),

    #[error("rule {0:?} must have a window greater than zero")]
    ZeroWindow(String),

    #[error("rule {0:?} must set exactly one of `unit` or `window_ms`")]
    AmbiguousWindow(String),
}

/// Failure of the counter store's increment operation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage key must not be empty")]
    EmptyKey,

    #[error("counter store did not respond within {0:?}")]
    Timeout(std::time::Duration),

    #[error("unexpected counter store reply: {0}")]
    UnexpectedReply(String),

    #[cfg(feature = "redis-store")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Failure to derive the identity token or attributes for a call.
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("metadata key {0:?} is missing")]
    MissingMetadata(String),

    #[error("metadata key {0:?} is not valid ASCII")]
    InvalidMetadata(String),

    #[error("peer address is not available")]
    MissingPeer,

    #[error("required payload field {0:?} is missing")]
    MissingField(String),

    #[error("payload field {0:?} is not a scalar value")]
    UnsupportedField(String),

    #[error("payload could not be inspected: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("{0}")]
    Custom(String),
}

/// Failure while checking one rule against the counter store.
#[derive(Error, Debug)]
#[error("failed to check {scope} rule {rule:?}: {source}")]
pub struct EvaluationError {
    pub scope: &'static str,
    pub rule: String,
    #[source]
    pub source: StoreError,
}

/// Result type alias for gate operations.
pub type Result<T> = std::result::Result<T, GateError>;
