//! Route matching
//!
//! Rules are evaluated in list order and the first match wins. Matching is
//! pure: it never touches rotation state or metrics.

use crate::models::{DomainMatcher, OneOrMany, RequestInfo, RouteRule};

/// Check whether a rule applies to a request.
///
/// All present predicates must hold; absent predicates are wildcards and a
/// rule without a match block matches everything. `domain` and `hostname`
/// are checked independently against the same hostname.
pub fn matches_route(rule: &RouteRule, info: &RequestInfo) -> bool {
    let Some(matcher) = &rule.matcher else {
        return true;
    };

    if !matches_domain(&info.hostname, matcher.domain.as_ref()) {
        return false;
    }

    if !matches_domain(&info.hostname, matcher.hostname.as_ref()) {
        return false;
    }

    if let Some(port) = &matcher.port {
        if !port.contains(&info.port) {
            return false;
        }
    }

    if let Some(is_http) = matcher.is_http {
        if is_http != info.is_http {
            return false;
        }
    }

    if let Some(method) = &matcher.method {
        if !matches_method(&info.method, method) {
            return false;
        }
    }

    true
}

/// Return the first rule in `rules` that matches the request
pub fn select_route<'a>(rules: &'a [RouteRule], info: &RequestInfo) -> Option<&'a RouteRule> {
    rules.iter().find(|rule| matches_route(rule, info))
}

fn matches_domain(hostname: &str, matcher: Option<&DomainMatcher>) -> bool {
    matcher.map_or(true, |m| m.matches(hostname))
}

fn matches_method(method: &str, allowed: &OneOrMany<String>) -> bool {
    let method = crate::models::normalize_method(Some(method));
    allowed
        .as_slice()
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(&method))
}
