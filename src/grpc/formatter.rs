//! Conversion of exceeded rules into the status returned to callers.

use tonic::Status;

use crate::ratelimit::Rule;

/// Builds the rejection status for a call that exceeded one or more rules.
///
/// `exceeded` is never empty and is in evaluation order.
pub trait ViolationFormatter: Send + Sync {
    fn format(&self, exceeded: &[Rule]) -> Status;
}

impl<F> ViolationFormatter for F
where
    F: Fn(&[Rule]) -> Status + Send + Sync,
{
    fn format(&self, exceeded: &[Rule]) -> Status {
        self(exceeded)
    }
}

/// `RESOURCE_EXHAUSTED` with message `rate limit exceeded: a, b`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultViolationFormatter;

impl ViolationFormatter for DefaultViolationFormatter {
    fn format(&self, exceeded: &[Rule]) -> Status {
        let names: Vec<&str> = exceeded.iter().map(Rule::name).collect();
        Status::resource_exhausted(format!("rate limit exceeded: {}", names.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::TimeUnit;

    #[test]
    fn test_default_format_names_rules_in_order() {
        let rules = vec![
            Rule::per("global_qps", 1, TimeUnit::Second).unwrap(),
            Rule::per("per_minute", 2, TimeUnit::Minute).unwrap(),
        ];

        let status = DefaultViolationFormatter.format(&rules);

        assert_eq!(status.code(), tonic::Code::ResourceExhausted);
        assert_eq!(status.message(), "rate limit exceeded: global_qps, per_minute");
    }

    #[test]
    fn test_closure_formatter() {
        let formatter = |rules: &[Rule]| Status::unavailable(format!("{} limits hit", rules.len()));
        let rules = vec![Rule::per("a", 1, TimeUnit::Second).unwrap()];

        let status = ViolationFormatter::format(&formatter, &rules);
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert_eq!(status.message(), "1 limits hit");
    }
}
