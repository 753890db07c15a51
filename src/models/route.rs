//! Route rules and their match predicates

use std::sync::atomic::{AtomicU64, Ordering};

use regex::Regex;
use serde::{Deserialize, Serialize};

static NEXT_RULE_ID: AtomicU64 = AtomicU64::new(1);

/// Synthetic identity of a route rule.
///
/// Assigned once when a rule is built from configuration. Rebuilding a rule
/// from identical input yields a new id, so rotation cursors never carry
/// over from one installed rule set to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(u64);

impl RuleId {
    pub fn next() -> Self {
        Self(NEXT_RULE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// A single value or a non-empty list of values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::One(value) => std::slice::from_ref(value),
            OneOrMany::Many(values) => values,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    pub fn map<U>(&self, f: impl Fn(&T) -> U) -> OneOrMany<U> {
        match self {
            OneOrMany::One(value) => OneOrMany::One(f(value)),
            OneOrMany::Many(values) => OneOrMany::Many(values.iter().map(f).collect()),
        }
    }
}

impl<T: PartialEq> OneOrMany<T> {
    pub fn contains(&self, value: &T) -> bool {
        self.as_slice().contains(value)
    }
}

/// Hostname matcher
#[derive(Debug, Clone)]
pub enum DomainMatcher {
    /// Case-insensitive exact match or dot-boundary suffix match.
    /// The pattern is stored lower-cased.
    Literal(String),
    /// Regular expression tested against the raw hostname.
    Pattern(Regex),
}

impl DomainMatcher {
    pub fn literal(pattern: &str) -> Self {
        DomainMatcher::Literal(pattern.to_lowercase())
    }

    pub fn matches(&self, hostname: &str) -> bool {
        match self {
            DomainMatcher::Literal(pattern) => {
                let host = hostname.to_lowercase();
                host == *pattern
                    || (host.len() > pattern.len()
                        && host.ends_with(pattern.as_str())
                        && host.as_bytes()[host.len() - pattern.len() - 1] == b'.')
            }
            DomainMatcher::Pattern(regex) => regex.is_match(hostname),
        }
    }
}

/// Match predicate of a route rule. Absent fields are wildcards.
#[derive(Debug, Clone, Default)]
pub struct RouteMatch {
    pub domain: Option<DomainMatcher>,
    pub hostname: Option<DomainMatcher>,
    pub port: Option<OneOrMany<u16>>,
    pub is_http: Option<bool>,
    /// Methods, stored upper-cased
    pub method: Option<OneOrMany<String>>,
}

/// How a matched rule resolves its upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamSpec {
    /// No upstream configured; the listener applies its default
    Unset,
    /// Explicit `null`; always connect directly
    Direct,
    /// A single upstream URL
    Single(String),
    /// Upstream URLs visited in round-robin order
    RoundRobin(Vec<String>),
}

/// A routing rule: optional match predicate plus upstream policy
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub id: RuleId,
    pub name: Option<String>,
    pub matcher: Option<RouteMatch>,
    pub upstream: UpstreamSpec,
}

impl RouteRule {
    pub fn new(name: Option<String>, matcher: Option<RouteMatch>, upstream: UpstreamSpec) -> Self {
        Self {
            id: RuleId::next(),
            name,
            matcher,
            upstream,
        }
    }

    /// Human-readable label for logs
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("#{}", self.id.get()),
        }
    }
}

/// Outcome of upstream selection for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamDecision {
    /// Forward through this upstream proxy URL
    Upstream(String),
    /// Connect to the target without an upstream
    Direct,
    /// Nothing matched; the listener uses its own default (direct)
    NoDecision,
}

impl UpstreamDecision {
    pub fn upstream(&self) -> Option<&str> {
        match self {
            UpstreamDecision::Upstream(url) => Some(url),
            UpstreamDecision::Direct | UpstreamDecision::NoDecision => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_ids_are_unique() {
        let a = RouteRule::new(None, None, UpstreamSpec::Direct);
        let b = RouteRule::new(None, None, UpstreamSpec::Direct);
        assert_ne!(a.id, b.id);
        assert!(b.id > a.id);
        assert_eq!(a.clone().id, a.id);
    }

    #[test]
    fn test_literal_domain_matcher() {
        let matcher = DomainMatcher::literal("Example.com");

        assert!(matcher.matches("example.com"));
        assert!(matcher.matches("sub.EXAMPLE.com"));
        assert!(matcher.matches("a.b.example.com"));
        assert!(!matcher.matches("notexample.com"));
        assert!(!matcher.matches("example.com.evil"));
        assert!(!matcher.matches("com"));
    }

    #[test]
    fn test_pattern_domain_matcher() {
        let matcher = DomainMatcher::Pattern(Regex::new(r"example\.com$").unwrap());
        assert!(matcher.matches("a.example.com"));
        assert!(!matcher.matches("A.EXAMPLE.COM"));

        let insensitive = DomainMatcher::Pattern(Regex::new(r"(?i)example\.com$").unwrap());
        assert!(insensitive.matches("A.EXAMPLE.COM"));
    }

    #[test]
    fn test_one_or_many() {
        let one = OneOrMany::One(80u16);
        let many = OneOrMany::Many(vec![80u16, 443]);

        assert!(one.contains(&80));
        assert!(!one.contains(&443));
        assert!(many.contains(&443));
        assert_eq!(many.as_slice(), &[80, 443]);
        assert!(OneOrMany::<u16>::Many(vec![]).is_empty());
        assert_eq!(one.map(|p| p + 1), OneOrMany::One(81));
    }

    #[test]
    fn test_one_or_many_serde_shapes() {
        let one: OneOrMany<u16> = serde_json::from_str("443").unwrap();
        let many: OneOrMany<u16> = serde_json::from_str("[80, 443]").unwrap();

        assert_eq!(one, OneOrMany::One(443));
        assert_eq!(many, OneOrMany::Many(vec![80, 443]));
        assert_eq!(serde_json::to_string(&many).unwrap(), "[80,443]");
    }

    #[test]
    fn test_upstream_decision_accessor() {
        assert_eq!(
            UpstreamDecision::Upstream("http://u1".to_string()).upstream(),
            Some("http://u1")
        );
        assert_eq!(UpstreamDecision::Direct.upstream(), None);
        assert_eq!(UpstreamDecision::NoDecision.upstream(), None);
    }
}
