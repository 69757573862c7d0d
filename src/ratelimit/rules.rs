//! Rate limit rules and their configuration format.
//!
//! A [`Rule`] is one named fixed-window constraint. Rules are declared in
//! configuration as [`RuleConfig`] entries which carry either a coarse
//! [`TimeUnit`] (matching Envoy-style `unit: minute` declarations) or an exact
//! window in milliseconds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::RuleError;

/// A fixed-window rate limit rule.
///
/// Rules are validated on construction and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    name: String,
    limit: u64,
    window: Duration,
}

impl Rule {
    /// Create a rule allowing `limit` calls per `window`.
    pub fn new(name: impl Into<String>, limit: u64, window: Duration) -> Result<Self, RuleError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RuleError::EmptyName);
        }
        if limit == 0 {
            return Err(RuleError::ZeroLimit(name));
        }
        if window.is_zero() {
            return Err(RuleError::ZeroWindow(name));
        }
        Ok(Self {
            name,
            limit,
            window,
        })
    }

    /// Create a rule whose window is one `unit`.
    pub fn per(name: impl Into<String>, limit: u64, unit: TimeUnit) -> Result<Self, RuleError> {
        Self::new(name, limit, unit.duration())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Whether a post-increment count violates this rule.
    pub fn is_exceeded_by(&self, count: u64) -> bool {
        count > self.limit
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} per {:?})", self.name, self.limit, self.window)
    }
}

/// Time unit for rule windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of this time unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// A rule as declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Rule name, used in storage keys and rejection messages
    pub name: String,
    /// Number of calls allowed per window
    pub limit: u64,
    /// Window expressed as one time unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<TimeUnit>,
    /// Window expressed in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_ms: Option<u64>,
}

impl TryFrom<&RuleConfig> for Rule {
    type Error = RuleError;

    fn try_from(config: &RuleConfig) -> Result<Self, Self::Error> {
        let window = match (config.unit, config.window_ms) {
            (Some(unit), None) => unit.duration(),
            (None, Some(ms)) => Duration::from_millis(ms),
            _ => return Err(RuleError::AmbiguousWindow(config.name.clone())),
        };
        Rule::new(config.name.clone(), config.limit, window)
    }
}

/// Convert a list of rule declarations, failing on the first invalid one.
pub fn parse_rules(configs: &[RuleConfig]) -> Result<Vec<Rule>, RuleError> {
    configs.iter().map(Rule::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_validation() {
        assert_eq!(
            Rule::new("", 1, Duration::from_secs(1)),
            Err(RuleError::EmptyName)
        );
        assert_eq!(
            Rule::new("r", 0, Duration::from_secs(1)),
            Err(RuleError::ZeroLimit("r".to_string()))
        );
        assert_eq!(
            Rule::new("r", 1, Duration::ZERO),
            Err(RuleError::ZeroWindow("r".to_string()))
        );
    }

    #[test]
    fn test_exceeded_is_strict() {
        let rule = Rule::per("per_minute", 2, TimeUnit::Minute).unwrap();
        assert!(!rule.is_exceeded_by(1));
        assert!(!rule.is_exceeded_by(2));
        assert!(rule.is_exceeded_by(3));
    }

    #[test]
    fn test_time_unit_duration() {
        assert_eq!(TimeUnit::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeUnit::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeUnit::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeUnit::Day.duration(), Duration::from_secs(86400));
    }

    #[test]
    fn test_parse_rule_configs() {
        let yaml = r#"
- name: per_minute
  limit: 10
  unit: minute
- name: burst
  limit: 3
  window_ms: 500
"#;
        let configs: Vec<RuleConfig> = serde_yaml::from_str(yaml).unwrap();
        let rules = parse_rules(&configs).unwrap();

        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].name(), "per_minute");
        assert_eq!(rules[0].window(), Duration::from_secs(60));
        assert_eq!(rules[1].limit(), 3);
        assert_eq!(rules[1].window(), Duration::from_millis(500));
    }

    #[test]
    fn test_window_must_be_declared_once() {
        let both = RuleConfig {
            name: "r".to_string(),
            limit: 1,
            unit: Some(TimeUnit::Second),
            window_ms: Some(1000),
        };
        let neither = RuleConfig {
            unit: None,
            window_ms: None,
            ..both.clone()
        };

        assert_eq!(
            Rule::try_from(&both),
            Err(RuleError::AmbiguousWindow("r".to_string()))
        );
        assert_eq!(
            Rule::try_from(&neither),
            Err(RuleError::AmbiguousWindow("r".to_string()))
        );
    }
}
