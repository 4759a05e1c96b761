//! Status-code matchers for per-status callbacks.

use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Rule {
    Code(u16),
    Any,
    Range(u16, u16),
    Less(u16),
    LessOrEqual(u16),
    Greater(u16),
    GreaterOrEqual(u16),
    Never,
}

/// Decides whether a status-code handler applies to a response.
///
/// Accepted forms:
/// - a literal code: `404`
/// - the wildcard `*`
/// - an inclusive range: `400-499` or `400~499`
/// - a comparison against one bound: `<300`, `<=299`, `>399`, `>=400`, `=204`
///
/// The comparison operator must be followed directly by the digits. Anything
/// else (`+200`, `200--300`, `>= 200`) is kept but never matches.
#[derive(Clone, PartialEq, Eq)]
pub struct StatusCodeMatcher {
    source: String,
    rule: Rule,
}

fn parse_code(digits: &str) -> Option<u16> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn parse_rule(source: &str) -> Rule {
    if source == "*" {
        return Rule::Any;
    }
    if let Some(code) = parse_code(source) {
        return Rule::Code(code);
    }

    let comparisons: [(&str, fn(u16) -> Rule); 5] = [
        ("<=", Rule::LessOrEqual),
        (">=", Rule::GreaterOrEqual),
        ("<", Rule::Less),
        (">", Rule::Greater),
        ("=", Rule::Code),
    ];
    for (operator, rule) in comparisons {
        if let Some(rest) = source.strip_prefix(operator) {
            return parse_code(rest).map_or(Rule::Never, rule);
        }
    }

    let range = source.split_once('-').or_else(|| source.split_once('~'));
    if let Some((low, high)) = range
        && let (Some(low), Some(high)) = (parse_code(low), parse_code(high))
    {
        return Rule::Range(low, high);
    }

    Rule::Never
}

impl StatusCodeMatcher {
    /// Parse a matcher expression.
    pub fn parse(source: impl Into<String>) -> Self {
        let source = source.into();
        let rule = parse_rule(&source);
        Self { source, rule }
    }

    /// A matcher for every status.
    pub fn any() -> Self {
        Self::parse("*")
    }

    /// Whether `status` is accepted.
    pub fn matches(&self, status: u16) -> bool {
        match self.rule {
            Rule::Code(code) => status == code,
            Rule::Any => true,
            Rule::Range(low, high) => low <= status && status <= high,
            Rule::Less(bound) => status < bound,
            Rule::LessOrEqual(bound) => status <= bound,
            Rule::Greater(bound) => status > bound,
            Rule::GreaterOrEqual(bound) => status >= bound,
            Rule::Never => false,
        }
    }

    /// Whether the expression was understood.
    pub fn is_valid(&self) -> bool {
        self.rule != Rule::Never
    }

    /// The original expression.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl From<u16> for StatusCodeMatcher {
    fn from(code: u16) -> Self {
        Self {
            source: code.to_string(),
            rule: Rule::Code(code),
        }
    }
}

impl From<&str> for StatusCodeMatcher {
    fn from(source: &str) -> Self {
        Self::parse(source)
    }
}

impl From<String> for StatusCodeMatcher {
    fn from(source: String) -> Self {
        Self::parse(source)
    }
}

impl fmt::Debug for StatusCodeMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusCodeMatcher({:?})", self.source)
    }
}

impl fmt::Display for StatusCodeMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(source: &str, status: u16) -> bool {
        StatusCodeMatcher::parse(source).matches(status)
    }

    #[test]
    fn test_literal_and_wildcard() {
        assert!(matches("200", 200));
        assert!(!matches("200", 201));
        assert!(StatusCodeMatcher::from(404).matches(404));
        assert!(matches("*", 100));
        assert!(matches("*", 599));
    }

    #[test]
    fn test_ranges_are_inclusive() {
        for source in ["400-499", "400~499"] {
            assert!(matches(source, 400));
            assert!(matches(source, 499));
            assert!(!matches(source, 399));
            assert!(!matches(source, 500));
        }
    }

    #[test]
    fn test_comparisons() {
        assert!(matches(">=400", 400));
        assert!(!matches(">=400", 399));
        assert!(matches("<=299", 299));
        assert!(!matches("<=299", 300));
        assert!(matches(">399", 400));
        assert!(!matches(">399", 399));
        assert!(matches("<300", 299));
        assert!(!matches("<300", 300));
        assert!(matches("=204", 204));
        assert!(!matches("=204", 200));
    }

    #[test]
    fn test_malformed_never_match() {
        for source in ["+200", "200--300", ">= 200", "", "abc", "2xx", "<", "200-", "-200"] {
            let matcher = StatusCodeMatcher::parse(source);
            assert!(!matcher.is_valid(), "{source:?} should be invalid");
            for status in [100, 200, 250, 300, 500] {
                assert!(!matcher.matches(status), "{source:?} matched {status}");
            }
        }
    }
}
