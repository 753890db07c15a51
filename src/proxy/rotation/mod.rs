//! Upstream selection
//!
//! Resolves a matched rule to an upstream decision. Rules with a list of
//! upstreams rotate through it in round-robin order, one cursor per rule.

mod round_robin;

pub use round_robin::RotationState;

use crate::models::{RouteRule, UpstreamDecision, UpstreamSpec};

/// Resolve the upstream for a matched rule.
///
/// - no rule, or upstream unset: [`UpstreamDecision::NoDecision`]
/// - upstream `null` or an empty list: [`UpstreamDecision::Direct`]
/// - a single URL: that URL, rotation state untouched
/// - a list: the element under the rule's cursor, then the cursor advances
pub fn select_upstream(rule: Option<&RouteRule>, state: &RotationState) -> UpstreamDecision {
    let Some(rule) = rule else {
        return UpstreamDecision::NoDecision;
    };

    match &rule.upstream {
        UpstreamSpec::Unset => UpstreamDecision::NoDecision,
        UpstreamSpec::Direct => UpstreamDecision::Direct,
        UpstreamSpec::Single(url) => UpstreamDecision::Upstream(url.clone()),
        UpstreamSpec::RoundRobin(urls) => match urls.len() {
            0 => UpstreamDecision::Direct,
            1 => UpstreamDecision::Upstream(urls[0].clone()),
            len => {
                let idx = state.advance(rule.id, len);
                UpstreamDecision::Upstream(urls[idx].clone())
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_robin(urls: &[&str]) -> RouteRule {
        RouteRule::new(
            None,
            None,
            UpstreamSpec::RoundRobin(urls.iter().map(|u| u.to_string()).collect()),
        )
    }

    #[test]
    fn test_no_rule_or_unset_upstream_is_no_decision() {
        let state = RotationState::new();
        assert_eq!(select_upstream(None, &state), UpstreamDecision::NoDecision);

        let rule = RouteRule::new(None, None, UpstreamSpec::Unset);
        assert_eq!(select_upstream(Some(&rule), &state), UpstreamDecision::NoDecision);
    }

    #[test]
    fn test_null_upstream_is_direct() {
        let rule = RouteRule::new(None, None, UpstreamSpec::Direct);
        let state = RotationState::for_rules(std::slice::from_ref(&rule));

        for _ in 0..3 {
            assert_eq!(select_upstream(Some(&rule), &state), UpstreamDecision::Direct);
        }
    }

    #[test]
    fn test_empty_list_is_direct() {
        let rule = round_robin(&[]);
        let state = RotationState::new();
        assert_eq!(select_upstream(Some(&rule), &state), UpstreamDecision::Direct);
    }

    #[test]
    fn test_single_upstream_leaves_cursor_alone() {
        let rule = RouteRule::new(None, None, UpstreamSpec::Single("http://one".to_string()));
        let state = RotationState::new();

        assert_eq!(
            select_upstream(Some(&rule), &state),
            UpstreamDecision::Upstream("http://one".to_string())
        );
        assert_eq!(state.cursor(rule.id), None);

        let single_list = round_robin(&["http://only"]);
        assert_eq!(
            select_upstream(Some(&single_list), &state),
            UpstreamDecision::Upstream("http://only".to_string())
        );
        assert_eq!(state.cursor(single_list.id), None);
    }

    #[test]
    fn test_round_robin_visits_each_upstream_in_order() {
        let rule = round_robin(&["http://one", "http://two", "http://three"]);
        let state = RotationState::for_rules(std::slice::from_ref(&rule));

        let picks: Vec<_> = (0..4)
            .map(|_| select_upstream(Some(&rule), &state))
            .collect();

        assert_eq!(
            picks,
            vec![
                UpstreamDecision::Upstream("http://one".to_string()),
                UpstreamDecision::Upstream("http://two".to_string()),
                UpstreamDecision::Upstream("http://three".to_string()),
                UpstreamDecision::Upstream("http://one".to_string()),
            ]
        );
        assert_eq!(state.cursor(rule.id), Some(1));
    }

    #[test]
    fn test_cursors_are_per_rule() {
        let a = round_robin(&["http://a1", "http://a2"]);
        let b = round_robin(&["http://b1", "http://b2"]);
        let state = RotationState::new();

        assert_eq!(
            select_upstream(Some(&a), &state),
            UpstreamDecision::Upstream("http://a1".to_string())
        );
        assert_eq!(
            select_upstream(Some(&b), &state),
            UpstreamDecision::Upstream("http://b1".to_string())
        );
        assert_eq!(
            select_upstream(Some(&a), &state),
            UpstreamDecision::Upstream("http://a2".to_string())
        );
    }

    #[test]
    fn test_rebuilt_rule_starts_from_first_upstream() {
        let rule = round_robin(&["http://one", "http://two"]);
        let state = RotationState::for_rules(std::slice::from_ref(&rule));
        select_upstream(Some(&rule), &state);

        // Same input, new identity, new state.
        let rebuilt = round_robin(&["http://one", "http://two"]);
        let fresh = RotationState::for_rules(std::slice::from_ref(&rebuilt));
        assert_eq!(
            select_upstream(Some(&rebuilt), &fresh),
            UpstreamDecision::Upstream("http://one".to_string())
        );
    }
}
