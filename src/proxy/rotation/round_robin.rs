//! Round-robin cursor bookkeeping

use dashmap::DashMap;

use crate::models::{RouteRule, RuleId, UpstreamSpec};

/// Next-index cursors for rules with more than one upstream
///
/// Each read-and-advance holds the map entry lock, so concurrent selections
/// for the same rule observe each other as if they were serialized.
#[derive(Debug, Default)]
pub struct RotationState {
    cursors: DashMap<RuleId, usize>,
}

impl RotationState {
    pub fn new() -> Self {
        Self {
            cursors: DashMap::new(),
        }
    }

    /// Fresh state with a zero cursor for every multi-upstream rule
    pub fn for_rules(rules: &[RouteRule]) -> Self {
        let state = Self::new();
        for rule in rules {
            if let UpstreamSpec::RoundRobin(urls) = &rule.upstream {
                if urls.len() > 1 {
                    state.cursors.insert(rule.id, 0);
                }
            }
        }
        state
    }

    /// Return the current index for `rule` and move the cursor forward.
    /// `len` must be non-zero.
    pub fn advance(&self, rule: RuleId, len: usize) -> usize {
        let mut cursor = self.cursors.entry(rule).or_insert(0);
        let current = *cursor % len;
        *cursor = (current + 1) % len;
        current
    }

    pub fn cursor(&self, rule: RuleId) -> Option<usize> {
        self.cursors.get(&rule).map(|c| *c)
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_for_rules_seeds_only_rotating_rules() {
        let rules = vec![
            RouteRule::new(None, None, UpstreamSpec::Direct),
            RouteRule::new(None, None, UpstreamSpec::Single("http://a".to_string())),
            RouteRule::new(
                None,
                None,
                UpstreamSpec::RoundRobin(vec!["http://a".to_string(), "http://b".to_string()]),
            ),
        ];

        let state = RotationState::for_rules(&rules);
        assert_eq!(state.len(), 1);
        assert_eq!(state.cursor(rules[2].id), Some(0));
        assert_eq!(state.cursor(rules[0].id), None);
    }

    #[test]
    fn test_advance_wraps() {
        let state = RotationState::new();
        let id = RuleId::next();

        assert_eq!(state.advance(id, 3), 0);
        assert_eq!(state.advance(id, 3), 1);
        assert_eq!(state.advance(id, 3), 2);
        assert_eq!(state.advance(id, 3), 0);
        assert_eq!(state.cursor(id), Some(1));
    }

    #[test]
    fn test_concurrent_advance_hands_out_every_slot() {
        let state = Arc::new(RotationState::new());
        let id = RuleId::next();
        let len = 4;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = state.clone();
                std::thread::spawn(move || {
                    (0..100).map(|_| state.advance(id, len)).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut counts = [0usize; 4];
        for handle in handles {
            for idx in handle.join().unwrap() {
                counts[idx] += 1;
            }
        }

        // 800 selections over 4 slots, strictly alternating
        assert_eq!(counts, [200, 200, 200, 200]);
        assert_eq!(state.cursor(id), Some(0));
    }
}
